//! TCP trace collector, keyed `ig-tcptrace`
//!
//! Prefers an in-kernel tracer when one is provided and falls back to an
//! always-available probe when it cannot be brought up.

use crate::collector::{Collector, DataMap, DataProducer};
use crate::config::RuntimeInfo;
use crate::trace::{
    bucket_data, start_probe, ContainerRuntime, ProbeFactory, TraceRun, TraceSink, TraceState,
    Waiter,
};
use crate::Result;
use async_trait::async_trait;
use nodescope_common::TcpEvent;
use std::sync::Arc;
use tracing::warn;

pub const TCP_TRACE_NAME: &str = "ig-tcptrace";

pub struct TcpTraceCollector {
    runtime_info: Arc<RuntimeInfo>,
    runtime: Arc<dyn ContainerRuntime>,
    primary: Option<ProbeFactory<TcpEvent>>,
    fallback: ProbeFactory<TcpEvent>,
    waiter: Waiter,
    sink: TraceSink,
    state: TraceState,
}

impl TcpTraceCollector {
    pub fn new(
        runtime_info: Arc<RuntimeInfo>,
        runtime: Arc<dyn ContainerRuntime>,
        fallback: ProbeFactory<TcpEvent>,
        waiter: Waiter,
    ) -> Self {
        Self {
            runtime_info,
            runtime,
            primary: None,
            fallback,
            waiter,
            sink: TraceSink::new(),
            state: TraceState::Unsupported,
        }
    }

    /// Try `primary` first on every run
    pub fn with_primary(mut self, primary: ProbeFactory<TcpEvent>) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn state(&self) -> TraceState {
        self.state
    }
}

#[async_trait]
impl Collector for TcpTraceCollector {
    fn name(&self) -> &str {
        TCP_TRACE_NAME
    }

    async fn check_supported(&self) -> Result<()> {
        self.runtime_info.check_not_excluded(TCP_TRACE_NAME)?;
        self.runtime_info.check_linux()
    }

    async fn collect(&mut self) -> Result<()> {
        let run = TraceRun {
            name: TCP_TRACE_NAME,
            node_name: &self.runtime_info.host_node_name,
            runtime: self.runtime.clone(),
            sink: &self.sink,
            waiter: &self.waiter,
        };
        let primary = self.primary.as_ref();
        let fallback = &self.fallback;

        run.execute(&mut self.state, |handler| match primary {
            Some(primary) => start_probe(primary, handler.clone()).or_else(|e| {
                warn!("Failed to create core tracer, falling back to standard one: {}", e);
                start_probe(fallback, handler)
            }),
            None => start_probe(fallback, handler),
        })
        .await
    }
}

impl DataProducer for TcpTraceCollector {
    fn data(&self) -> Result<DataMap> {
        bucket_data(TCP_TRACE_NAME, &self.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::registry::tests::{record, FakeRuntime};
    use crate::trace::tests::FakeProbe;
    use crate::trace::{sleep_waiter, BoxedSource, EventHandler, Waiter};
    use crate::NodescopeError;
    use nodescope_common::TcpOperation;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn runtime_info() -> Arc<RuntimeInfo> {
        Arc::new(RuntimeInfo {
            os_identifier: "linux".to_string(),
            host_node_name: "node-1".to_string(),
            ..Default::default()
        })
    }

    fn refusing_factory(calls: Arc<AtomicUsize>) -> ProbeFactory<TcpEvent> {
        Arc::new(move || -> Result<BoxedSource<TcpEvent>> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(NodescopeError::resource_init("in-kernel tcp tracer", "not available"))
        })
    }

    type HandlerSlot = Arc<Mutex<Option<EventHandler<TcpEvent>>>>;

    /// Factory whose probes park their handler in `slot`
    fn recording_factory(calls: Arc<AtomicUsize>, slot: HandlerSlot) -> ProbeFactory<TcpEvent> {
        Arc::new(move || -> Result<BoxedSource<TcpEvent>> {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut probe = FakeProbe::new(Arc::new(AtomicUsize::new(0)));
            probe.handler = slot.clone();
            let probe: BoxedSource<TcpEvent> = Box::new(probe);
            Ok(probe)
        })
    }

    fn connect_event(pid: u32) -> TcpEvent {
        TcpEvent {
            k8s: Default::default(),
            timestamp_ns: 42,
            operation: TcpOperation::Connect,
            pid: Some(pid),
            ip_version: 4,
            saddr: "10.244.1.7".to_string(),
            daddr: "10.0.0.1".to_string(),
            sport: 40000,
            dport: 443,
        }
    }

    /// Emits one event for `pid` through whatever handler the probe holds
    fn emitting_waiter(slot: HandlerSlot, pid: u32) -> Waiter {
        Arc::new(move || {
            let handler = slot.lock().clone();
            Box::pin(async move {
                if let Some(handler) = handler {
                    handler(None, connect_event(pid));
                }
            })
        })
    }

    #[tokio::test]
    async fn test_falls_back_when_primary_unavailable() {
        let runtime = Arc::new(FakeRuntime::with_seed(vec![record(77, "db", false)]));
        let primary_calls = Arc::new(AtomicUsize::new(0));
        let fallback_calls = Arc::new(AtomicUsize::new(0));
        let slot: HandlerSlot = Arc::new(Mutex::new(None));

        let mut collector = TcpTraceCollector::new(
            runtime_info(),
            runtime,
            recording_factory(fallback_calls.clone(), slot.clone()),
            emitting_waiter(slot, 77),
        )
        .with_primary(refusing_factory(primary_calls.clone()));

        collector.collect().await.unwrap();

        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
        assert_eq!(collector.state(), TraceState::Done);

        // The event carried only a pid; the registry resolved its container
        let data = collector.data().unwrap();
        let doc = &data[TCP_TRACE_NAME];
        assert!(doc.contains("/namespaces/default/pods/db-pod/containers/db "));
        assert!(doc.contains("\"pod\": \"db-pod\""));
        assert!(doc.contains("\"node\": \"node-1\""));
    }

    #[tokio::test]
    async fn test_primary_used_when_available() {
        let runtime = Arc::new(FakeRuntime::default());
        let primary_calls = Arc::new(AtomicUsize::new(0));
        let fallback_calls = Arc::new(AtomicUsize::new(0));
        let slot: HandlerSlot = Arc::new(Mutex::new(None));

        let mut collector = TcpTraceCollector::new(
            runtime_info(),
            runtime,
            refusing_factory(fallback_calls.clone()),
            emitting_waiter(slot.clone(), 5),
        )
        .with_primary(recording_factory(primary_calls.clone(), slot));

        collector.collect().await.unwrap();

        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);

        // Unknown pid: keyed by timestamp alone, node identity only
        let data = collector.data().unwrap();
        assert!(!data[TCP_TRACE_NAME].contains("/namespaces/"));
    }

    #[tokio::test]
    async fn test_both_probes_failing_is_collect_failure() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut collector = TcpTraceCollector::new(
            runtime_info(),
            runtime.clone(),
            refusing_factory(Arc::new(AtomicUsize::new(0))),
            sleep_waiter(Duration::from_millis(0)),
        )
        .with_primary(refusing_factory(Arc::new(AtomicUsize::new(0))));

        let err = collector.collect().await.unwrap_err();
        assert!(matches!(err, NodescopeError::CollectFailure { .. }));
        assert_eq!(collector.state(), TraceState::Failed);
        assert!(!runtime.watching.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_excluded_by_collector_list() {
        let info = Arc::new(RuntimeInfo {
            os_identifier: "linux".to_string(),
            host_node_name: "node-1".to_string(),
            collector_list: vec![TCP_TRACE_NAME.to_string()],
            ..Default::default()
        });
        let collector = TcpTraceCollector::new(
            info,
            Arc::new(FakeRuntime::default()),
            refusing_factory(Arc::new(AtomicUsize::new(0))),
            sleep_waiter(Duration::from_millis(0)),
        );
        let err = collector.check_supported().await.unwrap_err();
        assert!(err.is_unsupported());
        assert!(err.to_string().contains(TCP_TRACE_NAME));

        let allowed = TcpTraceCollector::new(
            runtime_info(),
            Arc::new(FakeRuntime::default()),
            refusing_factory(Arc::new(AtomicUsize::new(0))),
            sleep_waiter(Duration::from_millis(0)),
        );
        allowed.check_supported().await.unwrap();
    }
}
