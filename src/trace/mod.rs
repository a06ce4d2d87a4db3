//! In-process event tracing
//!
//! A trace run builds a fresh container registry, starts a probe, attaches it
//! to the node's containers and publishes enriched events into a shared
//! [`TraceSink`] until the injected waiter completes. Every resource acquired
//! along the way is released in reverse order, whether the run succeeds or not.

pub mod dns;
pub mod registry;
pub mod sink;
pub mod source;
pub mod tcp;

pub use dns::DnsTraceCollector;
pub use registry::{ContainerCallback, ContainerRegistry, ContainerRuntime, RegistryHandle};
pub use sink::{TraceBucket, TraceSink};
pub use source::{
    BoxedSource, ContainerSelector, EventHandler, EventSource, ProbeConnection, SharedSource,
};
pub use tcp::TcpTraceCollector;

use crate::collector::DataMap;
use crate::{NodescopeError, Result};
use futures::future::BoxFuture;
use nodescope_common::{ContainerRecord, TraceEvent};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of a trace collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Unsupported,
    Initializing,
    Running,
    Draining,
    Done,
    Failed,
}

/// Builds an unstarted probe
pub type ProbeFactory<E> = Arc<dyn Fn() -> Result<BoxedSource<E>> + Send + Sync>;

/// Decides how long a trace window stays open
pub type Waiter = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Waiter that keeps the window open for a fixed duration
pub fn sleep_waiter(duration: Duration) -> Waiter {
    Arc::new(move || Box::pin(tokio::time::sleep(duration)))
}

/// Waiter that closes the window after `duration` or on Ctrl-C, whichever is first
pub fn shutdown_waiter(duration: Duration) -> Waiter {
    Arc::new(move || {
        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("Interrupted, closing trace window early"),
                        Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
                    }
                }
            }
        })
    })
}

/// Build a probe from `factory` and start it delivering to `handler`
pub(crate) fn start_probe<E: Send + 'static>(
    factory: &ProbeFactory<E>,
    handler: EventHandler<E>,
) -> Result<BoxedSource<E>> {
    let mut probe = factory()?;
    if let Err(e) = probe.start(handler) {
        probe.stop();
        return Err(e);
    }
    Ok(probe)
}

/// Everything a trace run needs besides the probe itself
pub(crate) struct TraceRun<'a> {
    pub name: &'a str,
    pub node_name: &'a str,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub sink: &'a TraceSink,
    pub waiter: &'a Waiter,
}

impl TraceRun<'_> {
    /// Drive one trace window, recording each transition in `state`.
    ///
    /// `launch` receives the enriching handler and returns a started probe.
    pub async fn execute<E, F>(self, state: &mut TraceState, launch: F) -> Result<()>
    where
        E: TraceEvent,
        F: FnOnce(EventHandler<E>) -> Result<BoxedSource<E>>,
    {
        *state = TraceState::Initializing;

        let registry = match ContainerRegistry::initialize(self.runtime.clone()).await {
            Ok(registry) => registry,
            Err(e) => {
                *state = TraceState::Failed;
                return Err(NodescopeError::collect(
                    "failed to initialize container collection",
                    e,
                ));
            }
        };

        let result = self.trace(&registry, state, launch).await;
        registry.close().await;

        *state = if result.is_ok() {
            TraceState::Done
        } else {
            TraceState::Failed
        };
        result
    }

    async fn trace<E, F>(
        &self,
        registry: &ContainerRegistry,
        state: &mut TraceState,
        launch: F,
    ) -> Result<()>
    where
        E: TraceEvent,
        F: FnOnce(EventHandler<E>) -> Result<BoxedSource<E>>,
    {
        let handler = enriching_handler(
            self.name.to_string(),
            self.node_name.to_string(),
            self.sink.clone(),
            registry.handle(),
        );

        let probe = launch(handler).map_err(|e| {
            NodescopeError::collect(format!("failed to start {} tracer", self.name), e)
        })?;
        let source: SharedSource<E> = Arc::new(Mutex::new(probe));

        let handle = registry.handle();
        let connected = {
            let handle = handle.clone();
            let source = source.clone();
            let selector = ContainerSelector::default();
            run_blocking("probe connect", move || source::connect(&handle, source, selector))
                .await
                .and_then(|connected| connected)
        };
        let connection = match connected {
            Ok(connection) => connection,
            Err(e) => {
                let stop = run_blocking("probe stop", move || source.lock().stop());
                if let Err(stop_err) = stop.await {
                    warn!("Failed to stop {} tracer: {}", self.name, stop_err);
                }
                return Err(NodescopeError::collect(
                    format!("failed to connect {} tracer", self.name),
                    e,
                ));
            }
        };

        *state = TraceState::Running;
        info!(
            "Tracing {} across {} containers",
            self.name,
            connection.attached_count()
        );
        (self.waiter)().await;

        *state = TraceState::Draining;
        let teardown = run_blocking("probe teardown", move || {
            connection.close(&handle);
            source.lock().stop();
        });
        if let Err(e) = teardown.await {
            warn!("Failed to tear down {} tracer: {}", self.name, e);
        }

        debug!(
            "{} collected {} events",
            self.name,
            self.sink.event_count(self.name)
        );
        Ok(())
    }
}

/// Run probe plumbing that spawns or joins threads off the async executor
async fn run_blocking<T, F>(what: &str, f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NodescopeError::collect(format!("{} task", what), e))
}

/// Handler that fills in Kubernetes identity and publishes the event
fn enriching_handler<E: TraceEvent>(
    name: String,
    node_name: String,
    sink: TraceSink,
    lookup: RegistryHandle,
) -> EventHandler<E> {
    Arc::new(move |container: Option<&ContainerRecord>, mut event: E| {
        let resolved = match container {
            Some(c) => Some(c.clone()),
            None => event.pid().and_then(|pid| lookup.get(pid)),
        };
        event.k8s_mut().enrich(&node_name, resolved.as_ref());
        sink.publish_event(&name, resolved.as_ref(), event.to_event_string());
    })
}

/// Render a trace bucket as a single JSON document keyed by `name`
pub(crate) fn bucket_data(name: &str, sink: &TraceSink) -> Result<DataMap> {
    let bucket = sink.tracer_data(name)?;

    let events: BTreeMap<String, serde_json::Value> = bucket
        .into_iter()
        .map(|(key, content)| {
            let value = serde_json::from_str(&content)
                .unwrap_or_else(|_| serde_json::Value::String(content));
            (key, value)
        })
        .collect();

    let mut data = DataMap::new();
    data.insert(name.to_string(), serde_json::to_string_pretty(&events)?);
    Ok(data)
}
