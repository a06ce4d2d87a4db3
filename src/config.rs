//! Runtime configuration for one agent run
//!
//! Everything is read from the environment the DaemonSet manifest provides.
//! The host node name comes from the downward API because the container's own
//! hostname is the pod name.

use crate::{NodescopeError, Result};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, warn};

pub const HOST_NODE_NAME: &str = "HOST_NODE_NAME";
pub const COLLECTOR_LIST: &str = "COLLECTOR_LIST";
pub const AZURE_BLOB_ACCOUNT_NAME: &str = "AZURE_BLOB_ACCOUNT_NAME";
pub const AZURE_BLOB_SAS_KEY: &str = "AZURE_BLOB_SAS_KEY";
pub const AZURE_BLOB_CONTAINER_NAME: &str = "AZURE_BLOB_CONTAINER_NAME";
pub const AZURE_STORAGE_SAS_KEY_TYPE: &str = "AZURE_STORAGE_SAS_KEY_TYPE";

const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

/// Settings shared by every collector and the exporter
#[derive(Debug, Clone, Default)]
pub struct RuntimeInfo {
    pub os_identifier: String,
    pub host_node_name: String,
    /// Names or categories that exclude collectors from the run
    pub collector_list: Vec<String>,
    pub storage_account_name: String,
    pub storage_sas_key: String,
    pub storage_container_name: String,
    pub storage_sas_key_type: String,
}

impl RuntimeInfo {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host_node_name = lookup(HOST_NODE_NAME).unwrap_or_default();
        if host_node_name.trim().is_empty() {
            return Err(NodescopeError::Config(format!(
                "{} value not set for container",
                HOST_NODE_NAME
            )));
        }

        let fields = |key: &str| -> Vec<String> {
            lookup(key)
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_string)
                .collect()
        };

        Ok(Self {
            os_identifier: std::env::consts::OS.to_string(),
            host_node_name: host_node_name.trim().to_string(),
            collector_list: fields(COLLECTOR_LIST),
            storage_account_name: lookup(AZURE_BLOB_ACCOUNT_NAME).unwrap_or_default(),
            storage_sas_key: lookup(AZURE_BLOB_SAS_KEY).unwrap_or_default(),
            storage_container_name: lookup(AZURE_BLOB_CONTAINER_NAME).unwrap_or_default(),
            storage_sas_key_type: lookup(AZURE_STORAGE_SAS_KEY_TYPE).unwrap_or_default(),
        })
    }

    pub fn excludes(&self, value: &str) -> bool {
        self.collector_list.iter().any(|v| v == value)
    }

    /// Fail with `UnsupportedEnvironment` when `value` is on the exclusion list
    pub fn check_not_excluded(&self, value: &str) -> Result<()> {
        if self.excludes(value) {
            return Err(NodescopeError::UnsupportedEnvironment(format!(
                "Not included because '{}' is in {} variable. Included values: {}",
                value,
                COLLECTOR_LIST,
                self.collector_list.join(" ")
            )));
        }
        Ok(())
    }

    pub fn check_linux(&self) -> Result<()> {
        if self.os_identifier != "linux" {
            return Err(NodescopeError::UnsupportedEnvironment(format!(
                "unsupported OS: {}",
                self.os_identifier
            )));
        }
        Ok(())
    }
}

/// Well-known host files mounted into the agent pod
#[derive(Debug, Clone)]
pub struct KnownFilePaths {
    pub azure_json: PathBuf,
}

impl Default for KnownFilePaths {
    fn default() -> Self {
        Self {
            azure_json: PathBuf::from("/etc/kubernetes/azure.json"),
        }
    }
}

#[derive(Deserialize)]
struct CloudConfig {
    #[serde(default)]
    cloud: String,
}

impl KnownFilePaths {
    /// Blob endpoint suffix for the cloud this node runs in
    pub fn storage_endpoint_suffix(&self) -> String {
        let content = match std::fs::read_to_string(&self.azure_json) {
            Ok(content) => content,
            Err(e) => {
                debug!(
                    "Could not read {}: {}, using public cloud endpoint",
                    self.azure_json.display(),
                    e
                );
                return DEFAULT_ENDPOINT_SUFFIX.to_string();
            }
        };

        match serde_json::from_str::<CloudConfig>(&content) {
            Ok(config) => endpoint_suffix_for_cloud(&config.cloud).to_string(),
            Err(e) => {
                warn!("Malformed {}: {}", self.azure_json.display(), e);
                DEFAULT_ENDPOINT_SUFFIX.to_string()
            }
        }
    }
}

fn endpoint_suffix_for_cloud(cloud: &str) -> &'static str {
    match cloud.to_ascii_lowercase().as_str() {
        "azurechinacloud" => "core.chinacloudapi.cn",
        "azureusgovernmentcloud" | "azureusgovernment" => "core.usgovcloudapi.net",
        _ => DEFAULT_ENDPOINT_SUFFIX,
    }
}
