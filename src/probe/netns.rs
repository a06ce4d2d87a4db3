//! One worker thread per network namespace
//!
//! Containers of the same pod share a network namespace, so probes that
//! observe a namespace keep a single worker for it and track which attached
//! containers live there. The worker stops when its last container detaches.

use crate::{NodescopeError, Result};
use nodescope_common::ContainerRecord;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// What a worker thread sees of its namespace
pub struct WorkerContext {
    proc_root: PathBuf,
    stop: Arc<AtomicBool>,
    members: Arc<RwLock<Vec<ContainerRecord>>>,
}

impl WorkerContext {
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Container events from this namespace are attributed to
    pub fn owner(&self) -> Option<ContainerRecord> {
        self.members.read().first().cloned()
    }

    /// `/proc/<pid>` of the owning container
    pub fn owner_proc_dir(&self) -> Option<PathBuf> {
        self.owner()
            .map(|c| self.proc_root.join(c.pid.to_string()))
    }
}

/// Body of a namespace worker
pub trait NetnsWorker: Send + 'static {
    /// Runs on the worker thread before the attach is reported successful
    fn setup(&mut self, ctx: &WorkerContext) -> Result<()>;

    /// One bounded unit of work, called until the worker is stopped
    fn poll(&mut self, ctx: &WorkerContext) -> Result<()>;
}

struct Worker {
    stop: Arc<AtomicBool>,
    members: Arc<RwLock<Vec<ContainerRecord>>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Namespace worker panicked");
            }
        }
    }
}

pub struct NetnsWorkers {
    label: &'static str,
    proc_root: PathBuf,
    workers: HashMap<u64, Worker>,
    pid_netns: HashMap<u32, u64>,
}

impl NetnsWorkers {
    pub fn new(label: &'static str, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            label,
            proc_root: proc_root.into(),
            workers: HashMap::new(),
            pid_netns: HashMap::new(),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    pub fn namespace_count(&self) -> usize {
        self.workers.len()
    }

    fn netns_inode(&self, pid: u32) -> Result<u64> {
        let path = self.proc_root.join(pid.to_string()).join("ns").join("net");
        let metadata = std::fs::metadata(&path).map_err(|e| {
            NodescopeError::resource_init(format!("network namespace of pid {}", pid), e)
        })?;
        Ok(metadata.ino())
    }

    /// Track `container`, starting a worker built by `make_worker` if its
    /// namespace has none yet
    pub fn attach<W, F>(&mut self, container: &ContainerRecord, make_worker: F) -> Result<()>
    where
        W: NetnsWorker,
        F: FnOnce() -> W,
    {
        if self.pid_netns.contains_key(&container.pid) {
            return Ok(());
        }
        let inode = self.netns_inode(container.pid)?;

        if let Some(worker) = self.workers.get(&inode) {
            worker.members.write().push(container.clone());
            self.pid_netns.insert(container.pid, inode);
            debug!("{}: {} joins netns {}", self.label, container.name, inode);
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let members = Arc::new(RwLock::new(vec![container.clone()]));
        let ctx = WorkerContext {
            proc_root: self.proc_root.clone(),
            stop: stop.clone(),
            members: members.clone(),
        };

        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let mut worker = make_worker();
        let label = self.label;
        let thread = std::thread::Builder::new()
            .name(format!("{}-{}", label, inode))
            .spawn(move || {
                if let Err(e) = worker.setup(&ctx) {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                drop(ready_tx);

                while !ctx.stopped() {
                    if let Err(e) = worker.poll(&ctx) {
                        warn!("{}: worker for netns {} stopped: {}", label, inode, e);
                        break;
                    }
                }
            })?;

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(NodescopeError::resource_init(
                self.label,
                "worker exited before reporting readiness",
            ))
        });

        let mut worker = Worker {
            stop,
            members,
            thread: Some(thread),
        };
        if let Err(e) = ready {
            worker.shutdown();
            return Err(e);
        }

        debug!("{}: started worker for netns {} ({})", self.label, inode, container.name);
        self.workers.insert(inode, worker);
        self.pid_netns.insert(container.pid, inode);
        Ok(())
    }

    /// Forget `container`, stopping its namespace worker if it was the last member
    pub fn detach(&mut self, container: &ContainerRecord) {
        let Some(inode) = self.pid_netns.remove(&container.pid) else {
            return;
        };
        let Some(worker) = self.workers.get_mut(&inode) else {
            return;
        };

        let remaining = {
            let mut members = worker.members.write();
            members.retain(|c| c.pid != container.pid);
            members.len()
        };
        if remaining == 0 {
            worker.shutdown();
            self.workers.remove(&inode);
            debug!("{}: stopped worker for netns {}", self.label, inode);
        }
    }

    /// Stop every worker and wait for them to exit
    pub fn stop_all(&mut self) {
        for (_, mut worker) in self.workers.drain() {
            worker.shutdown();
        }
        self.pid_netns.clear();
    }
}

impl Drop for NetnsWorkers {
    fn drop(&mut self) {
        self.stop_all();
    }
}
