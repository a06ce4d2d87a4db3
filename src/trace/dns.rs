//! DNS trace collector, keyed `ig-dnstrace`

use crate::collector::{Collector, DataMap, DataProducer};
use crate::config::RuntimeInfo;
use crate::trace::{bucket_data, start_probe, ContainerRuntime, ProbeFactory, TraceRun, TraceSink, TraceState, Waiter};
use crate::Result;
use async_trait::async_trait;
use nodescope_common::DnsEvent;
use std::sync::Arc;

pub const DNS_TRACE_NAME: &str = "ig-dnstrace";

/// Traces DNS queries and responses in every container's network namespace
/// for the length of the trace window.
pub struct DnsTraceCollector {
    runtime_info: Arc<RuntimeInfo>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: ProbeFactory<DnsEvent>,
    waiter: Waiter,
    sink: TraceSink,
    state: TraceState,
}

impl DnsTraceCollector {
    pub fn new(
        runtime_info: Arc<RuntimeInfo>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: ProbeFactory<DnsEvent>,
        waiter: Waiter,
    ) -> Self {
        Self {
            runtime_info,
            runtime,
            probe,
            waiter,
            sink: TraceSink::new(),
            state: TraceState::Unsupported,
        }
    }

    pub fn state(&self) -> TraceState {
        self.state
    }
}

#[async_trait]
impl Collector for DnsTraceCollector {
    fn name(&self) -> &str {
        DNS_TRACE_NAME
    }

    async fn check_supported(&self) -> Result<()> {
        self.runtime_info.check_not_excluded(DNS_TRACE_NAME)?;
        self.runtime_info.check_linux()
    }

    async fn collect(&mut self) -> Result<()> {
        let run = TraceRun {
            name: DNS_TRACE_NAME,
            node_name: &self.runtime_info.host_node_name,
            runtime: self.runtime.clone(),
            sink: &self.sink,
            waiter: &self.waiter,
        };
        let probe = &self.probe;
        run.execute(&mut self.state, |handler| start_probe(probe, handler))
            .await
    }
}

impl DataProducer for DnsTraceCollector {
    fn data(&self) -> Result<DataMap> {
        bucket_data(DNS_TRACE_NAME, &self.sink)
    }
}
