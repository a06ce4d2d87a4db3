//! Container ID to host PID resolution
//!
//! Every process in a container carries the runtime's container ID somewhere
//! in its cgroup path, for example:
//! - systemd driver: `0::/kubepods.slice/.../cri-containerd-{id}.scope`
//! - cgroupfs driver: `0::/kubepods/burstable/pod{uid}/{id}`
//!
//! The lowest matching PID is the container's init process. The agent runs in
//! the host PID namespace, so these PIDs are the ones probes attach to.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

const PROC_ROOT: &str = "/proc";

/// Shortest ID accepted, so a truncated ID cannot match unrelated cgroups
const MIN_CONTAINER_ID_LEN: usize = 12;

pub struct PidResolver {
    proc_root: PathBuf,
}

impl PidResolver {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from(PROC_ROOT),
        }
    }

    /// Resolver over a different procfs mount (for testing or `/host/proc`)
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    pub fn proc_root(&self) -> &std::path::Path {
        &self.proc_root
    }

    /// Resolve the init PID of each container in one pass over procfs.
    ///
    /// IDs may carry a runtime prefix such as `containerd://`. Containers with
    /// no live process are absent from the result.
    pub fn resolve_all(&self, container_ids: &[String]) -> HashMap<String, u32> {
        let wanted: Vec<(&String, &str)> = container_ids
            .iter()
            .map(|id| (id, clean_container_id(id)))
            .filter(|(_, clean)| clean.len() >= MIN_CONTAINER_ID_LEN)
            .collect();

        let mut found: HashMap<String, u32> = HashMap::new();
        if wanted.is_empty() {
            return found;
        }

        let entries = match fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read {}: {}", self.proc_root.display(), e);
                return found;
            }
        };

        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // Processes exit between listing and reading
            let Ok(cgroup) = fs::read_to_string(entry.path().join("cgroup")) else {
                continue;
            };

            for (original, clean) in &wanted {
                if cgroup.contains(clean) {
                    let slot = found.entry((*original).clone()).or_insert(pid);
                    if pid < *slot {
                        *slot = pid;
                    }
                }
            }
        }

        debug!(
            "Resolved {} of {} container PIDs",
            found.len(),
            container_ids.len()
        );
        found
    }

    pub fn resolve(&self, container_id: &str) -> Option<u32> {
        let ids = [container_id.to_string()];
        self.resolve_all(&ids).remove(container_id)
    }
}

impl Default for PidResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip the runtime prefix (`containerd://`, `docker://`, `cri-o://`)
pub fn clean_container_id(container_id: &str) -> &str {
    container_id
        .split("://")
        .last()
        .unwrap_or(container_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ID_A: &str = "3f4e1c2b9a8d7e6f5a4b3c2d1e0f9a8b7c6d5e4f3a2b1c0d9e8f7a6b5c4d3e2f";
    const ID_B: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";

    fn write_proc(dir: &TempDir, pid: u32, cgroup: &str) {
        let pid_dir = dir.path().join(pid.to_string());
        fs::create_dir_all(&pid_dir).unwrap();
        fs::write(pid_dir.join("cgroup"), cgroup).unwrap();
    }

    #[test]
    fn test_clean_container_id() {
        assert_eq!(clean_container_id("containerd://abc"), "abc");
        assert_eq!(clean_container_id("cri-o://abc"), "abc");
        assert_eq!(clean_container_id("abc"), "abc");
    }

    #[test]
    fn test_lowest_pid_wins() {
        let dir = TempDir::new().unwrap();
        let systemd = format!(
            "0::/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod1234.slice/cri-containerd-{}.scope\n",
            ID_A
        );
        write_proc(&dir, 4300, &systemd);
        write_proc(&dir, 4211, &systemd);
        write_proc(&dir, 5000, &format!("0::/kubepods/besteffort/pod5678/{}\n", ID_B));
        write_proc(&dir, 1, "0::/init.scope\n");
        fs::create_dir_all(dir.path().join("self")).unwrap();

        let resolver = PidResolver::with_root(dir.path());
        let ids = vec![
            format!("containerd://{}", ID_A),
            format!("containerd://{}", ID_B),
            "containerd://0000000000000000dead".to_string(),
        ];
        let pids = resolver.resolve_all(&ids);

        assert_eq!(pids.len(), 2);
        assert_eq!(pids[&ids[0]], 4211);
        assert_eq!(pids[&ids[1]], 5000);
    }

    #[test]
    fn test_short_ids_are_ignored() {
        let dir = TempDir::new().unwrap();
        write_proc(&dir, 10, "0::/kubepods/pod1/abc\n");

        let resolver = PidResolver::with_root(dir.path());
        assert_eq!(resolver.resolve("containerd://abc"), None);
    }

    #[test]
    fn test_missing_proc_root_resolves_nothing() {
        let resolver = PidResolver::with_root("/nonexistent/proc");
        assert!(resolver.resolve(ID_A).is_none());
    }
}
