//! Node and container resource usage from the metrics API

use crate::collector::{Collector, DataMap, DataProducer};
use crate::config::RuntimeInfo;
use crate::k8s::K8sClient;
use crate::{NodescopeError, Result};
use async_trait::async_trait;
use kube::api::DynamicObject;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

pub const SYSTEMPERF_NAME: &str = "systemperf";

/// Usage of one node or container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub name: String,
    /// Millicores
    pub cpu_usage: i64,
    /// Bytes
    pub memory_usage: i64,
}

pub struct SystemPerfCollector {
    runtime_info: Arc<RuntimeInfo>,
    client: K8sClient,
    data: DataMap,
}

impl SystemPerfCollector {
    pub fn new(runtime_info: Arc<RuntimeInfo>, client: K8sClient) -> Self {
        Self {
            runtime_info,
            client,
            data: DataMap::new(),
        }
    }
}

#[async_trait]
impl Collector for SystemPerfCollector {
    fn name(&self) -> &str {
        SYSTEMPERF_NAME
    }

    async fn check_supported(&self) -> Result<()> {
        self.runtime_info.check_not_excluded("connectedCluster")
    }

    async fn collect(&mut self) -> Result<()> {
        let nodes = self
            .client
            .node_metrics()
            .await
            .map_err(|e| NodescopeError::collect("node metrics error", e))?;
        let nodes = node_usage(&nodes)?;
        debug!("Collected metrics for {} nodes", nodes.len());
        self.data
            .insert("nodes".to_string(), serde_json::to_string(&nodes)?);

        let pods = self
            .client
            .pod_metrics()
            .await
            .map_err(|e| NodescopeError::collect("pod metrics failure", e))?;
        let containers = container_usage(&pods)?;
        debug!("Collected metrics for {} containers", containers.len());
        self.data
            .insert("pods".to_string(), serde_json::to_string(&containers)?);

        Ok(())
    }
}

impl DataProducer for SystemPerfCollector {
    fn data(&self) -> Result<DataMap> {
        Ok(self.data.clone())
    }
}

fn usage_field<'a>(name: &str, usage: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    usage[key]
        .as_str()
        .ok_or_else(|| NodescopeError::Config(format!("{} has no {} usage", name, key)))
}

fn usage_of(name: &str, usage: &serde_json::Value) -> Result<ResourceUsage> {
    let cpu = Quantity::parse(usage_field(name, usage, "cpu")?)?;
    let memory = Quantity::parse(usage_field(name, usage, "memory")?)?;

    Ok(ResourceUsage {
        name: name.to_string(),
        cpu_usage: cpu.scaled_ceil(1000)?,
        memory_usage: memory.scaled_ceil(1)?,
    })
}

/// `NodeMetrics` items to per-node usage
pub fn node_usage(items: &[DynamicObject]) -> Result<Vec<ResourceUsage>> {
    items
        .iter()
        .map(|item| {
            let name = item.metadata.name.as_deref().unwrap_or_default();
            usage_of(name, &item.data["usage"])
        })
        .collect()
}

/// `PodMetrics` items to per-container usage
pub fn container_usage(items: &[DynamicObject]) -> Result<Vec<ResourceUsage>> {
    let mut result = Vec::new();
    for item in items {
        let containers = item.data["containers"].as_array().map(|v| v.as_slice());
        for container in containers.unwrap_or(&[]) {
            let name = container["name"].as_str().unwrap_or_default();
            result.push(usage_of(name, &container["usage"])?);
        }
    }
    Ok(result)
}

/// A Kubernetes resource quantity held exactly as `numerator / denominator`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantity {
    numerator: i128,
    denominator: i128,
}

impl Quantity {
    pub fn parse(text: &str) -> Result<Self> {
        parse_quantity(text.trim())
            .ok_or_else(|| NodescopeError::Config(format!("invalid quantity {:?}", text)))
    }

    /// `self * scale`, rounded up to the next integer
    pub fn scaled_ceil(&self, scale: i128) -> Result<i64> {
        let n = self
            .numerator
            .checked_mul(scale)
            .ok_or_else(|| NodescopeError::Config("quantity overflow".to_string()))?;
        let mut value = n.div_euclid(self.denominator);
        if n.rem_euclid(self.denominator) != 0 {
            value += 1;
        }
        i64::try_from(value).map_err(|_| NodescopeError::Config("quantity overflow".to_string()))
    }
}

fn parse_quantity(text: &str) -> Option<Quantity> {
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.trim_start_matches(['+', '-']).is_empty() && fraction.is_empty() {
        return None;
    }
    let mut numerator: i128 = format!("{}{}", whole, fraction).parse().ok()?;
    let mut denominator: i128 = 10i128.checked_pow(u32::try_from(fraction.len()).ok()?)?;

    let binary = |power: u32| 1024i128.checked_pow(power);
    match suffix {
        "Ki" => numerator = numerator.checked_mul(binary(1)?)?,
        "Mi" => numerator = numerator.checked_mul(binary(2)?)?,
        "Gi" => numerator = numerator.checked_mul(binary(3)?)?,
        "Ti" => numerator = numerator.checked_mul(binary(4)?)?,
        "Pi" => numerator = numerator.checked_mul(binary(5)?)?,
        "Ei" => numerator = numerator.checked_mul(binary(6)?)?,
        _ => {
            let exponent: i32 = match suffix {
                "n" => -9,
                "u" => -6,
                "m" => -3,
                "" => 0,
                "k" => 3,
                "M" => 6,
                "G" => 9,
                "T" => 12,
                "P" => 15,
                "E" => 18,
                other => other
                    .strip_prefix(['e', 'E'])
                    .and_then(|e| e.parse().ok())?,
            };
            let factor = 10i128.checked_pow(exponent.unsigned_abs())?;
            if exponent >= 0 {
                numerator = numerator.checked_mul(factor)?;
            } else {
                denominator = denominator.checked_mul(factor)?;
            }
        }
    }

    Some(Quantity {
        numerator,
        denominator,
    })
}
