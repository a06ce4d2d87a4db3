//! Concrete event sources and the host checks they depend on
//!
//! The collectors only see the [`EventSource`](crate::trace::EventSource)
//! contract; this module provides the implementations shipped with the agent.

pub mod dns_wire;

#[cfg(target_os = "linux")]
pub mod dns_packet;
#[cfg(target_os = "linux")]
pub mod netns;
#[cfg(target_os = "linux")]
pub mod tcp_proc;

#[cfg(target_os = "linux")]
pub use dns_packet::PacketDnsProbe;
#[cfg(target_os = "linux")]
pub use tcp_proc::ProcTcpProbe;

use crate::{NodescopeError, Result};
use tracing::{debug, info, warn};

/// Kernels from 5.11 account BPF memory to the cgroup instead of RLIMIT_MEMLOCK
const MEMCG_ACCOUNTING_KERNEL: (u32, u32) = (5, 11);

/// Lift RLIMIT_MEMLOCK so kernel probes can allocate their maps.
///
/// Not being allowed to raise it is only an error on kernels that still
/// charge probe memory against the limit.
#[cfg(target_os = "linux")]
pub fn raise_memlock_limit() -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };

    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if ret == 0 {
        debug!("RLIMIT_MEMLOCK removed");
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    match kernel_version() {
        Some(version) if version >= MEMCG_ACCOUNTING_KERNEL => {
            debug!(
                "Could not raise RLIMIT_MEMLOCK ({}), kernel {}.{} uses memcg accounting",
                err, version.0, version.1
            );
            Ok(())
        }
        Some(version) => Err(NodescopeError::resource_init(
            "memlock rlimit",
            format!("failed to remove memlock on kernel {}.{}: {}", version.0, version.1, err),
        )),
        None => {
            warn!("Could not raise RLIMIT_MEMLOCK: {}", err);
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn raise_memlock_limit() -> Result<()> {
    Ok(())
}

/// Running kernel's (major, minor) version
pub fn kernel_version() -> Option<(u32, u32)> {
    let release = match std::fs::read_to_string("/proc/sys/kernel/osrelease") {
        Ok(release) => release,
        Err(_) => {
            let output = std::process::Command::new("uname").arg("-r").output().ok()?;
            String::from_utf8(output.stdout).ok()?
        }
    };

    let version = parse_kernel_version(&release);
    if let Some((major, minor)) = version {
        info!("Kernel version: {}.{}", major, minor);
    }
    version
}

fn parse_kernel_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split('.');
    let major: u32 = parts.next()?.trim().parse().ok()?;
    let minor_str = parts.next()?;
    let minor: u32 = minor_str
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()?;
    Some((major, minor))
}
