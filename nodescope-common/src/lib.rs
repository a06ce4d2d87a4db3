//! Shared types between the container registry, the probes and the trace collectors
//!
//! This crate defines the records that cross component boundaries:
//! - Containers known to the node-local registry
//! - Kubernetes context attached to enriched events
//! - DNS and TCP events produced by probes

use serde::{Deserialize, Serialize};
use std::fmt;

/// A container alive on this node, as seen by the container runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Runtime container ID without the `containerd://` style prefix
    pub id: String,
    pub namespace: String,
    pub pod: String,
    pub name: String,
    /// PID of the container's init process, the registry key
    pub pid: u32,
    /// Container shares the node's network namespace
    pub host_network: bool,
}

impl ContainerRecord {
    /// `/namespaces/<ns>/pods/<pod>/containers/<name>` path identifying this container
    pub fn path(&self) -> String {
        format!(
            "/namespaces/{}/pods/{}/containers/{}",
            self.namespace, self.pod, self.name
        )
    }
}

/// Add/remove notification delivered by the container runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    Added(ContainerRecord),
    Removed(ContainerRecord),
}

impl ContainerEvent {
    pub fn container(&self) -> &ContainerRecord {
        match self {
            ContainerEvent::Added(c) | ContainerEvent::Removed(c) => c,
        }
    }
}

/// Kubernetes context attached to every traced event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sContext {
    pub node: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub namespace: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub pod: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub container: String,
}

impl K8sContext {
    /// Fill in node identity and, for pod-network containers, the pod coordinates.
    ///
    /// Host-network containers share the node's namespace, so attributing their
    /// traffic to a single pod would be misleading.
    pub fn enrich(&mut self, node: &str, container: Option<&ContainerRecord>) {
        self.node = node.to_string();
        if let Some(c) = container {
            if !c.host_network {
                self.namespace = c.namespace.clone();
                self.pod = c.pod.clone();
                self.container = c.name.clone();
            }
        }
    }
}

/// Events that can be enriched with Kubernetes context and published as JSON
pub trait TraceEvent: Serialize + Send + 'static {
    fn k8s_mut(&mut self) -> &mut K8sContext;

    /// PID the kernel attributed the event to, when known
    fn pid(&self) -> Option<u32>;

    /// Stringified form stored in trace buckets
    fn to_event_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}

/// Direction of a DNS packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsPacketKind {
    Query,
    Response,
}

/// A DNS query or response observed on a container's network namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsEvent {
    #[serde(flatten)]
    pub k8s: K8sContext,
    pub timestamp_ns: u64,
    pub id: u16,
    pub qr: DnsPacketKind,
    pub name: String,
    pub qtype: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rcode: Option<String>,
    pub src: String,
    pub dst: String,
}

impl TraceEvent for DnsEvent {
    fn k8s_mut(&mut self) -> &mut K8sContext {
        &mut self.k8s
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// TCP connection lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcpOperation {
    Connect,
    Accept,
    Close,
}

impl fmt::Display for TcpOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpOperation::Connect => write!(f, "connect"),
            TcpOperation::Accept => write!(f, "accept"),
            TcpOperation::Close => write!(f, "close"),
        }
    }
}

/// A TCP connect/accept/close observed on the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEvent {
    #[serde(flatten)]
    pub k8s: K8sContext,
    pub timestamp_ns: u64,
    pub operation: TcpOperation,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pid: Option<u32>,
    pub ip_version: u8,
    pub saddr: String,
    pub daddr: String,
    pub sport: u16,
    pub dport: u16,
}

impl TraceEvent for TcpEvent {
    fn k8s_mut(&mut self) -> &mut K8sContext {
        &mut self.k8s
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}
