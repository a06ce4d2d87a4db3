//! Node-local container registry for correlating PIDs to Kubernetes containers
//!
//! The registry is built fresh for every trace run. It is seeded from the
//! container runtime's current state and then kept up to date by the runtime's
//! add/remove notifications, which are its only writer. Probes subscribe to
//! the same notifications to follow containers as they come and go.

use crate::probe;
use crate::{NodescopeError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use nodescope_common::{ContainerEvent, ContainerRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives container add/remove notifications
pub type ContainerCallback = Arc<dyn Fn(ContainerEvent) + Send + Sync>;

/// Source of the containers running on this node
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Containers alive right now
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>>;

    /// Deliver notifications to `notify` until `shutdown` is cancelled
    async fn watch(&self, notify: ContainerCallback, shutdown: CancellationToken) -> Result<()>;
}

/// Handle returned by [`ContainerRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct RegistryInner {
    containers: DashMap<u32, ContainerRecord>,
    subscribers: DashMap<u64, ContainerCallback>,
    next_subscription: AtomicU64,
}

impl RegistryInner {
    fn apply(&self, event: ContainerEvent) {
        let announce = match event {
            ContainerEvent::Added(c) => {
                info!("Container added: {:?} pid {}", c.name, c.pid);
                match self.containers.insert(c.pid, c.clone()) {
                    None => vec![ContainerEvent::Added(c)],
                    Some(old) if old == c => Vec::new(),
                    // A new container reused the pid: retire the old record first
                    Some(old) => vec![ContainerEvent::Removed(old), ContainerEvent::Added(c)],
                }
            }
            ContainerEvent::Removed(c) => {
                info!("Container removed: {:?} pid {}", c.name, c.pid);
                match self.containers.remove(&c.pid) {
                    Some((_, old)) => vec![ContainerEvent::Removed(old)],
                    None => Vec::new(),
                }
            }
        };

        if announce.is_empty() {
            return;
        }

        // Snapshot the callbacks so no shard lock is held while they run
        let callbacks: Vec<ContainerCallback> =
            self.subscribers.iter().map(|r| r.value().clone()).collect();
        for event in announce {
            for callback in &callbacks {
                callback(event.clone());
            }
        }
    }
}

/// Shared view of a registry for probe callbacks and blocking tasks
#[derive(Clone)]
pub struct RegistryHandle(Arc<RegistryInner>);

impl RegistryHandle {
    pub fn get(&self, pid: u32) -> Option<ContainerRecord> {
        self.0.containers.get(&pid).map(|r| r.clone())
    }

    pub fn snapshot(&self) -> Vec<ContainerRecord> {
        let mut containers: Vec<ContainerRecord> =
            self.0.containers.iter().map(|r| r.value().clone()).collect();
        containers.sort_by_key(|c| c.pid);
        containers
    }

    /// Register a callback for future add/remove notifications
    pub fn subscribe(&self, callback: ContainerCallback) -> SubscriptionId {
        let id = self.0.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.0.subscribers.insert(id, callback);
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.0.subscribers.remove(&id.0);
    }
}

/// Live view of the containers on this node, keyed by PID
pub struct ContainerRegistry {
    inner: Arc<RegistryInner>,
    shutdown: CancellationToken,
    watch_task: Option<JoinHandle<()>>,
}

impl ContainerRegistry {
    /// Raise resource limits, start watching the runtime and seed the registry.
    ///
    /// On success the caller must `close` the registry on every exit path.
    pub async fn initialize(runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        probe::raise_memlock_limit()?;

        let inner = Arc::new(RegistryInner {
            containers: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscription: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();

        // Watch before listing so nothing started in between is missed
        let notify: ContainerCallback = {
            let inner = inner.clone();
            Arc::new(move |event| inner.apply(event))
        };
        let watch_task = tokio::spawn({
            let runtime = runtime.clone();
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = runtime.watch(notify, shutdown).await {
                    warn!("Container runtime watch ended with error: {}", e);
                }
            }
        });

        let seed = match runtime.list_containers().await {
            Ok(seed) => seed,
            Err(e) => {
                shutdown.cancel();
                if let Err(join_err) = watch_task.await {
                    warn!("Container watch task failed: {}", join_err);
                }
                return Err(NodescopeError::resource_init("container collection", e));
            }
        };

        for container in seed {
            inner.apply(ContainerEvent::Added(container));
        }

        info!(
            "Container registry initialized. Tracking {} containers",
            inner.containers.len()
        );

        Ok(Self {
            inner,
            shutdown,
            watch_task: Some(watch_task),
        })
    }

    pub fn lookup(&self, pid: u32) -> Option<ContainerRecord> {
        self.handle().get(pid)
    }

    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle(self.inner.clone())
    }

    pub fn snapshot(&self) -> Vec<ContainerRecord> {
        self.handle().snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.containers.is_empty()
    }

    pub fn subscribe(&self, callback: ContainerCallback) -> SubscriptionId {
        self.handle().subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.handle().unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Stop the runtime watch and drop every subscription
    pub async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.watch_task.take() {
            if let Err(e) = task.await {
                warn!("Container watch task failed: {}", e);
            }
        }
        self.inner.subscribers.clear();
        self.inner.containers.clear();
        debug!("Container registry closed");
    }
}

impl Drop for ContainerRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    /// Runtime whose notifications are driven by the test
    #[derive(Default)]
    pub(crate) struct FakeRuntime {
        pub seed: Vec<ContainerRecord>,
        pub notify: Mutex<Option<ContainerCallback>>,
        pub watching: AtomicBool,
        pub fail_list: bool,
    }

    impl FakeRuntime {
        pub fn with_seed(seed: Vec<ContainerRecord>) -> Self {
            Self {
                seed,
                ..Default::default()
            }
        }

        pub fn emit(&self, event: ContainerEvent) {
            if let Some(notify) = self.notify.lock().as_ref() {
                notify(event);
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
            if self.fail_list {
                return Err(NodescopeError::Config("runtime unreachable".to_string()));
            }
            Ok(self.seed.clone())
        }

        async fn watch(&self, notify: ContainerCallback, shutdown: CancellationToken) -> Result<()> {
            *self.notify.lock() = Some(notify);
            self.watching.store(true, Ordering::SeqCst);
            shutdown.cancelled().await;
            *self.notify.lock() = None;
            self.watching.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn record(pid: u32, name: &str, host_network: bool) -> ContainerRecord {
        ContainerRecord {
            id: format!("cid-{}", pid),
            namespace: "default".to_string(),
            pod: format!("{}-pod", name),
            name: name.to_string(),
            pid,
            host_network,
        }
    }

    #[tokio::test]
    async fn test_initialize_then_close_without_events() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = ContainerRegistry::initialize(runtime.clone()).await.unwrap();

        assert!(registry.is_empty());
        assert_eq!(registry.subscriber_count(), 0);

        registry.close().await;
        assert!(!runtime.watching.load(Ordering::SeqCst));
        assert!(runtime.notify.lock().is_none());
    }

    #[tokio::test]
    async fn test_seed_and_lookup_by_pid() {
        let runtime = Arc::new(FakeRuntime::with_seed(vec![
            record(10, "nginx", false),
            record(20, "coredns", false),
        ]));
        let registry = ContainerRegistry::initialize(runtime).await.unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(20).unwrap().name, "coredns");
        assert!(registry.lookup(30).is_none());

        registry.close().await;
    }

    #[tokio::test]
    async fn test_live_updates_reach_subscribers() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = ContainerRegistry::initialize(runtime.clone()).await.unwrap();

        // Wait for the watch task to register its callback
        while !runtime.watching.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = registry.subscribe({
            let seen = seen.clone();
            Arc::new(move |event| seen.lock().push(event))
        });

        runtime.emit(ContainerEvent::Added(record(42, "api", false)));
        runtime.emit(ContainerEvent::Added(record(42, "api", false)));
        assert_eq!(registry.lookup(42).unwrap().name, "api");

        runtime.emit(ContainerEvent::Removed(record(42, "api", false)));
        assert!(registry.lookup(42).is_none());

        // The duplicate add is not re-announced
        assert_eq!(seen.lock().len(), 2);

        registry.unsubscribe(id);
        assert_eq!(registry.subscriber_count(), 0);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_failed_seed_is_resource_init_error() {
        let runtime = Arc::new(FakeRuntime {
            fail_list: true,
            ..Default::default()
        });

        let err = ContainerRegistry::initialize(runtime.clone())
            .await
            .err()
            .unwrap();
        assert!(err.is_resource_init());
        assert!(!runtime.watching.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_pid_reuse_retires_old_record() {
        let runtime = Arc::new(FakeRuntime::with_seed(vec![record(42, "api", false)]));
        let registry = ContainerRegistry::initialize(runtime.clone()).await.unwrap();
        while !runtime.watching.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        registry.subscribe({
            let seen = seen.clone();
            Arc::new(move |event| seen.lock().push(event))
        });

        runtime.emit(ContainerEvent::Added(record(42, "batch", true)));

        assert_eq!(
            *seen.lock(),
            vec![
                ContainerEvent::Removed(record(42, "api", false)),
                ContainerEvent::Added(record(42, "batch", true)),
            ]
        );
        assert_eq!(registry.lookup(42).unwrap().name, "batch");

        registry.close().await;
    }
}
