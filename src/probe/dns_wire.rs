//! Decoding of DNS messages carried in raw Ethernet frames
//!
//! Only what the DNS trace reports is decoded: transaction id, direction,
//! the first question and, for responses, the response code.

use nodescope_common::{DnsEvent, DnsPacketKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const ETH_HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IPPROTO_UDP: u8 = 17;
const UDP_HEADER_LEN: usize = 8;
const DNS_HEADER_LEN: usize = 12;
const DNS_PORT: u16 = 53;
const MAX_NAME_LEN: usize = 255;

/// A DNS message seen on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsPacket {
    pub id: u16,
    pub kind: DnsPacketKind,
    pub name: String,
    pub qtype: u16,
    pub rcode: u8,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl DnsPacket {
    pub fn into_event(self, timestamp_ns: u64) -> DnsEvent {
        let rcode = match self.kind {
            DnsPacketKind::Response => Some(rcode_name(self.rcode)),
            DnsPacketKind::Query => None,
        };
        DnsEvent {
            k8s: Default::default(),
            timestamp_ns,
            id: self.id,
            qr: self.kind,
            name: self.name,
            qtype: qtype_name(self.qtype),
            rcode,
            src: self.src.to_string(),
            dst: self.dst.to_string(),
        }
    }
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Decode a frame as UDP/53 DNS. Anything else yields `None`.
pub fn parse_frame(frame: &[u8]) -> Option<DnsPacket> {
    let mut offset = ETH_HEADER_LEN;
    let mut ethertype = read_u16(frame, 12)?;
    if ethertype == ETHERTYPE_VLAN {
        ethertype = read_u16(frame, 16)?;
        offset += 4;
    }

    let ip = frame.get(offset..)?;
    let (src_ip, dst_ip, udp) = match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(ip)?,
        ETHERTYPE_IPV6 => parse_ipv6(ip)?,
        _ => return None,
    };

    let sport = read_u16(udp, 0)?;
    let dport = read_u16(udp, 2)?;
    if sport != DNS_PORT && dport != DNS_PORT {
        return None;
    }

    let mut packet = parse_message(udp.get(UDP_HEADER_LEN..)?)?;
    packet.src = SocketAddr::new(src_ip, sport);
    packet.dst = SocketAddr::new(dst_ip, dport);
    Some(packet)
}

fn parse_ipv4(ip: &[u8]) -> Option<(IpAddr, IpAddr, &[u8])> {
    let version_ihl = *ip.first()?;
    if version_ihl >> 4 != 4 || *ip.get(9)? != IPPROTO_UDP {
        return None;
    }
    let header_len = usize::from(version_ihl & 0x0f) * 4;
    let src: [u8; 4] = ip.get(12..16)?.try_into().ok()?;
    let dst: [u8; 4] = ip.get(16..20)?.try_into().ok()?;
    Some((
        IpAddr::V4(Ipv4Addr::from(src)),
        IpAddr::V4(Ipv4Addr::from(dst)),
        ip.get(header_len..)?,
    ))
}

fn parse_ipv6(ip: &[u8]) -> Option<(IpAddr, IpAddr, &[u8])> {
    // Extension headers are not followed
    if *ip.first()? >> 4 != 6 || *ip.get(6)? != IPPROTO_UDP {
        return None;
    }
    let src: [u8; 16] = ip.get(8..24)?.try_into().ok()?;
    let dst: [u8; 16] = ip.get(24..40)?.try_into().ok()?;
    Some((
        IpAddr::V6(Ipv6Addr::from(src)),
        IpAddr::V6(Ipv6Addr::from(dst)),
        ip.get(40..)?,
    ))
}

/// Decode the DNS header and first question of a UDP payload
fn parse_message(msg: &[u8]) -> Option<DnsPacket> {
    if msg.len() < DNS_HEADER_LEN {
        return None;
    }
    let id = read_u16(msg, 0)?;
    let flags = read_u16(msg, 2)?;
    let qdcount = read_u16(msg, 4)?;
    if qdcount == 0 {
        return None;
    }

    let (name, end) = parse_name(msg, DNS_HEADER_LEN)?;
    let qtype = read_u16(msg, end)?;

    let kind = if flags & 0x8000 != 0 {
        DnsPacketKind::Response
    } else {
        DnsPacketKind::Query
    };

    let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    Some(DnsPacket {
        id,
        kind,
        name,
        qtype,
        rcode: (flags & 0x000f) as u8,
        src: unspecified,
        dst: unspecified,
    })
}

/// Read an uncompressed name starting at `at`, returning it and the offset after it
fn parse_name(msg: &[u8], mut at: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    loop {
        let len = usize::from(*msg.get(at)?);
        at += 1;
        if len == 0 {
            break;
        }
        // Compression pointers never appear in the question of a well-formed message
        if len & 0xc0 != 0 {
            return None;
        }
        let label = msg.get(at..at + len)?;
        name.push_str(&String::from_utf8_lossy(label));
        name.push('.');
        at += len;
        if name.len() > MAX_NAME_LEN {
            return None;
        }
    }
    if name.is_empty() {
        name.push('.');
    }
    Some((name, at))
}

pub fn qtype_name(qtype: u16) -> String {
    let name = match qtype {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        65 => "HTTPS",
        255 => "ANY",
        other => return format!("TYPE{}", other),
    };
    name.to_string()
}

pub fn rcode_name(rcode: u8) -> String {
    let name = match rcode {
        0 => "NoError",
        1 => "FormErr",
        2 => "ServFail",
        3 => "NXDomain",
        4 => "NotImp",
        5 => "Refused",
        other => return format!("RCode{}", other),
    };
    name.to_string()
}
