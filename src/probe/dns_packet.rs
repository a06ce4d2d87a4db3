//! DNS probe reading raw frames from a packet socket in each container's
//! network namespace

use crate::probe::dns_wire;
use crate::probe::netns::{NetnsWorker, NetnsWorkers, WorkerContext};
use crate::trace::{EventHandler, EventSource};
use crate::{NodescopeError, Result};
use chrono::Utc;
use nodescope_common::{ContainerRecord, DnsEvent};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use tracing::debug;

/// Upper bound on how long a worker takes to notice it was stopped
const RECV_TIMEOUT_USEC: libc::suseconds_t = 200_000;
const FRAME_BUFFER_LEN: usize = 65_536;

pub struct PacketDnsProbe {
    handler: Option<EventHandler<DnsEvent>>,
    workers: NetnsWorkers,
}

impl PacketDnsProbe {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            handler: None,
            workers: NetnsWorkers::new("dns", proc_root),
        }
    }
}

impl EventSource for PacketDnsProbe {
    type Event = DnsEvent;

    fn name(&self) -> &str {
        "packet dns tracer"
    }

    fn start(&mut self, handler: EventHandler<DnsEvent>) -> Result<()> {
        self.handler = Some(handler);
        Ok(())
    }

    fn attach(&mut self, container: &ContainerRecord) -> Result<()> {
        let handler = self.handler.clone().ok_or_else(|| {
            NodescopeError::resource_init("packet dns tracer", "attach before start")
        })?;
        self.workers.attach(container, || PacketCapture {
            handler,
            socket: None,
            buffer: vec![0u8; FRAME_BUFFER_LEN],
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

struct PacketCapture {
    handler: EventHandler<DnsEvent>,
    socket: Option<OwnedFd>,
    buffer: Vec<u8>,
}

impl NetnsWorker for PacketCapture {
    fn setup(&mut self, ctx: &WorkerContext) -> Result<()> {
        let proc_dir = ctx
            .owner_proc_dir()
            .ok_or_else(|| NodescopeError::resource_init("packet dns tracer", "no container"))?;
        let netns = File::open(proc_dir.join("ns").join("net"))?;

        // setns only moves the calling thread
        if unsafe { libc::setns(netns.as_raw_fd(), libc::CLONE_NEWNET) } != 0 {
            return Err(NodescopeError::resource_init(
                "network namespace",
                io::Error::last_os_error(),
            ));
        }

        self.socket = Some(open_packet_socket()?);
        debug!("Packet socket open in {}", proc_dir.display());
        Ok(())
    }

    fn poll(&mut self, ctx: &WorkerContext) -> Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(NodescopeError::resource_init("packet dns tracer", "socket closed"));
        };

        let n = unsafe {
            libc::recv(
                socket.as_raw_fd(),
                self.buffer.as_mut_ptr() as *mut libc::c_void,
                self.buffer.len(),
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                    Ok(())
                }
                _ => Err(err.into()),
            };
        }

        if let Some(packet) = dns_wire::parse_frame(&self.buffer[..n as usize]) {
            let timestamp_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
            let owner = ctx.owner();
            (self.handler)(owner.as_ref(), packet.into_event(timestamp_ns));
        }
        Ok(())
    }
}

fn open_packet_socket() -> Result<OwnedFd> {
    let protocol = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;
    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, protocol) };
    if fd < 0 {
        return Err(NodescopeError::resource_init(
            "packet socket",
            io::Error::last_os_error(),
        ));
    }
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let timeout = libc::timeval {
        tv_sec: 0,
        tv_usec: RECV_TIMEOUT_USEC,
    };
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &timeout as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(NodescopeError::resource_init(
            "packet socket timeout",
            io::Error::last_os_error(),
        ));
    }

    Ok(socket)
}
