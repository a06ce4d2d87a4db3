//! TCP probe that polls `/proc/<pid>/net/tcp{,6}` in each container's network
//! namespace and reports established connections as they appear and vanish
//!
//! Needs no kernel support beyond procfs. Connections that open and close
//! between two polls are not seen.

use crate::probe::netns::{NetnsWorker, NetnsWorkers, WorkerContext};
use crate::trace::{EventHandler, EventSource};
use crate::{NodescopeError, Result};
use chrono::Utc;
use nodescope_common::{ContainerRecord, TcpEvent, TcpOperation};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Longest a worker sleeps before checking whether it was stopped
const STOP_CHECK: Duration = Duration::from_millis(50);

const TCP_ESTABLISHED: u8 = 0x01;
const TCP_LISTEN: u8 = 0x0a;

pub struct ProcTcpProbe {
    interval: Duration,
    handler: Option<EventHandler<TcpEvent>>,
    workers: NetnsWorkers,
}

impl ProcTcpProbe {
    pub fn new(proc_root: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            interval,
            handler: None,
            workers: NetnsWorkers::new("tcp", proc_root),
        }
    }
}

impl EventSource for ProcTcpProbe {
    type Event = TcpEvent;

    fn name(&self) -> &str {
        "proc tcp tracer"
    }

    fn start(&mut self, handler: EventHandler<TcpEvent>) -> Result<()> {
        let proc_root = self.workers.proc_root();
        if !proc_root.is_dir() {
            return Err(NodescopeError::resource_init(
                "proc tcp tracer",
                format!("{} is not a directory", proc_root.display()),
            ));
        }
        self.handler = Some(handler);
        Ok(())
    }

    fn attach(&mut self, container: &ContainerRecord) -> Result<()> {
        let handler = self.handler.clone().ok_or_else(|| {
            NodescopeError::resource_init("proc tcp tracer", "attach before start")
        })?;
        let interval = self.interval;
        self.workers.attach(container, || ConnectionPoller {
            handler,
            interval,
            table: ConnectionTable::default(),
            next_scan: Instant::now(),
        })
    }

    fn detach(&mut self, container: &ContainerRecord) -> Result<()> {
        self.workers.detach(container);
        Ok(())
    }

    fn stop(&mut self) {
        self.workers.stop_all();
        self.handler = None;
    }
}

/// One row of `/proc/net/tcp` or `/proc/net/tcp6`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: u8,
}

/// Parse the contents of a `/proc/net/tcp{,6}` file, skipping malformed rows
pub fn parse_proc_net_tcp(content: &str) -> Vec<TcpEntry> {
    content.lines().skip(1).filter_map(parse_row).collect()
}

fn parse_row(line: &str) -> Option<TcpEntry> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let local = parse_socket_addr(fields.next()?)?;
    let remote = parse_socket_addr(fields.next()?)?;
    let state = u8::from_str_radix(fields.next()?, 16).ok()?;
    Some(TcpEntry {
        local,
        remote,
        state,
    })
}

/// `0100007F:0CEA` style address. The address words are in host byte order.
fn parse_socket_addr(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;

    let ip = match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(addr.get(i * 8..i * 8 + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpChange {
    pub operation: TcpOperation,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// Established connections seen on the previous scan
#[derive(Debug, Default)]
pub struct ConnectionTable {
    established: HashSet<(SocketAddr, SocketAddr)>,
}

impl ConnectionTable {
    /// Record a scan, returning what changed since the last one.
    ///
    /// A new connection whose local port is listening was accepted, any
    /// other new connection was initiated from this namespace.
    pub fn update(&mut self, entries: &[TcpEntry]) -> Vec<TcpChange> {
        let listening: HashSet<u16> = entries
            .iter()
            .filter(|e| e.state == TCP_LISTEN)
            .map(|e| e.local.port())
            .collect();
        let current: HashSet<(SocketAddr, SocketAddr)> = entries
            .iter()
            .filter(|e| e.state == TCP_ESTABLISHED)
            .map(|e| (e.local, e.remote))
            .collect();

        let mut changes: Vec<TcpChange> = current
            .difference(&self.established)
            .map(|&(local, remote)| TcpChange {
                operation: if listening.contains(&local.port()) {
                    TcpOperation::Accept
                } else {
                    TcpOperation::Connect
                },
                local,
                remote,
            })
            .collect();
        changes.extend(
            self.established
                .difference(&current)
                .map(|&(local, remote)| TcpChange {
                    operation: TcpOperation::Close,
                    local,
                    remote,
                }),
        );

        self.established = current;
        changes
    }

    pub fn len(&self) -> usize {
        self.established.len()
    }

    pub fn is_empty(&self) -> bool {
        self.established.is_empty()
    }
}

struct ConnectionPoller {
    handler: EventHandler<TcpEvent>,
    interval: Duration,
    table: ConnectionTable,
    next_scan: Instant,
}

impl ConnectionPoller {
    fn scan(&self, ctx: &WorkerContext) -> Result<Vec<TcpEntry>> {
        let proc_dir = ctx
            .owner_proc_dir()
            .ok_or_else(|| NodescopeError::resource_init("proc tcp tracer", "no container"))?;

        let mut entries = Vec::new();
        for file in ["tcp", "tcp6"] {
            match std::fs::read_to_string(proc_dir.join("net").join(file)) {
                Ok(content) => entries.extend(parse_proc_net_tcp(&content)),
                // tcp6 is absent when IPv6 is disabled
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && file == "tcp6" => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }
}

impl NetnsWorker for ConnectionPoller {
    fn setup(&mut self, ctx: &WorkerContext) -> Result<()> {
        // Connections open before the trace started are not reported
        let entries = self.scan(ctx)?;
        self.table.update(&entries);
        self.next_scan = Instant::now() + self.interval;
        debug!("Baseline of {} established connections", self.table.len());
        Ok(())
    }

    fn poll(&mut self, ctx: &WorkerContext) -> Result<()> {
        let now = Instant::now();
        if now < self.next_scan {
            std::thread::sleep((self.next_scan - now).min(STOP_CHECK));
            return Ok(());
        }
        self.next_scan = now + self.interval;

        let entries = self.scan(ctx)?;
        let changes = self.table.update(&entries);
        if changes.is_empty() {
            return Ok(());
        }

        let owner = ctx.owner();
        let timestamp_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        for change in changes {
            let event = TcpEvent {
                k8s: Default::default(),
                timestamp_ns,
                operation: change.operation,
                pid: owner.as_ref().map(|c| c.pid),
                ip_version: if change.local.is_ipv4() { 4 } else { 6 },
                saddr: change.local.ip().to_string(),
                daddr: change.remote.ip().to_string(),
                sport: change.local.port(),
                dport: change.remote.port(),
            };
            (self.handler)(owner.as_ref(), event);
        }
        Ok(())
    }
}
