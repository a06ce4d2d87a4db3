//! Trace collection through an Inspektor Gadget deployment in the cluster
//!
//! A `Trace` resource asks the gadget pod on this node to start tracing. Its
//! output is streamed back through an exec session until the trace is deleted
//! at the end of the collecting period.

use crate::collector::{Collector, DataMap, DataProducer};
use crate::config::RuntimeInfo;
use crate::k8s::client::{trace_object, GADGET_NAMESPACE, GADGET_TRACE_CRD};
use crate::k8s::K8sClient;
use crate::{NodescopeError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct GadgetTraceCollector {
    gadget: String,
    name: String,
    runtime_info: Arc<RuntimeInfo>,
    client: K8sClient,
    collecting_period: Duration,
    data: DataMap,
}

impl GadgetTraceCollector {
    pub fn new(
        gadget: &str,
        runtime_info: Arc<RuntimeInfo>,
        client: K8sClient,
        collecting_period: Duration,
    ) -> Self {
        Self {
            gadget: gadget.to_string(),
            name: format!("gadget-{}", gadget),
            runtime_info,
            client,
            collecting_period,
            data: DataMap::new(),
        }
    }

    /// One trace per gadget per node
    fn trace_name(&self) -> String {
        format!("{}-{}", self.gadget, self.runtime_info.host_node_name)
    }

    async fn delete_trace(&self, trace_name: &str) {
        if let Err(e) = self.client.delete_trace(trace_name).await {
            warn!("could not kill trace {}: {}", trace_name, e);
        }
    }
}

/// Command that streams a trace's output from the gadget tracer manager
pub fn receive_stream_command(trace_name: &str) -> Vec<String> {
    vec![
        "./bin/gadgettracermanager".to_string(),
        "-call".to_string(),
        "receive-stream".to_string(),
        "-tracerid".to_string(),
        format!("trace_gadget_{}", trace_name),
    ]
}

#[async_trait]
impl Collector for GadgetTraceCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check_supported(&self) -> Result<()> {
        self.runtime_info.check_linux()?;
        self.runtime_info.check_not_excluded("connectedCluster")?;

        match self.client.crd_exists(GADGET_TRACE_CRD).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(NodescopeError::UnsupportedEnvironment(
                "does not contain gadget crd".to_string(),
            )),
            Err(e) => Err(NodescopeError::UnsupportedEnvironment(format!(
                "error listing CRDs in cluster: {}",
                e
            ))),
        }
    }

    async fn collect(&mut self) -> Result<()> {
        let node_name = self.runtime_info.host_node_name.clone();
        let trace_name = self.trace_name();

        let trace = trace_object(&trace_name, &self.gadget, &node_name);
        if let Err(e) = self.client.create_trace(&trace).await {
            let message = format!("could not create trace {}", trace_name);
            return Err(NodescopeError::collect(message, e));
        }

        let pod = match self.client.gadget_pod_name(&node_name).await {
            Ok(pod) => pod,
            Err(e) => {
                self.delete_trace(&trace_name).await;
                return Err(NodescopeError::collect("failed to get gadget pod name", e));
            }
        };

        info!("Collecting trace stream {} from pod {}", trace_name, pod);
        let command = receive_stream_command(&trace_name);
        let stream = self.client.exec(GADGET_NAMESPACE, &pod, command);
        // Deleting the trace ends the stream
        let stop = async {
            info!("Waiting {:?} to stop collection", self.collecting_period);
            tokio::time::sleep(self.collecting_period).await;
            self.delete_trace(&trace_name).await;
        };
        let (output, ()) = tokio::join!(stream, stop);

        let output = output.map_err(|e| {
            NodescopeError::collect(format!("error executing command on {}", pod), e)
        })?;
        info!("Collected trace stream {} from pod {}", trace_name, pod);

        let result = format!("{}\n{}", output.stdout.trim(), output.stderr.trim());
        self.data.insert(self.name.clone(), result);
        Ok(())
    }
}

impl DataProducer for GadgetTraceCollector {
    fn data(&self) -> Result<DataMap> {
        Ok(self.data.clone())
    }
}
