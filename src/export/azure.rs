//! Azure Blob Storage backend using SAS-authenticated REST calls

use crate::config::{KnownFilePaths, RuntimeInfo};
use crate::export::ObjectStore;
use crate::{NodescopeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::{debug, warn};

const STORAGE_API_VERSION: &str = "2021-08-06";

/// SAS key type whose token is scoped to an existing container
const CONTAINER_SAS_KEY_TYPE: &str = "Container";

pub struct AzureBlobStore {
    client: reqwest::Client,
    account_name: String,
    container_name: String,
    sas_key: String,
    sas_key_type: String,
    endpoint_suffix: String,
    endpoint: Option<String>,
}

impl AzureBlobStore {
    pub fn new(runtime_info: &RuntimeInfo, known_file_paths: &KnownFilePaths) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_name: runtime_info.storage_account_name.clone(),
            container_name: runtime_info.storage_container_name.clone(),
            sas_key: runtime_info.storage_sas_key.clone(),
            sas_key_type: runtime_info.storage_sas_key_type.clone(),
            endpoint_suffix: known_file_paths.storage_endpoint_suffix(),
            endpoint: None,
        }
    }

    /// Send requests to `endpoint` (`scheme://host[:port]`) instead of the
    /// account's public blob endpoint, e.g. a storage emulator
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    fn container_url(&self) -> Result<String> {
        if self.account_name.is_empty() || self.sas_key.is_empty() || self.container_name.is_empty()
        {
            warn!("Storage Account information were not provided. Export to Azure Storage Account will be skipped.");
            return Err(NodescopeError::StorageNotConfigured);
        }

        let endpoint = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://{}.blob.{}", self.account_name, self.endpoint_suffix),
        };
        Ok(format!("{}/{}", endpoint, self.container_name))
    }

    fn sas_query(&self) -> &str {
        self.sas_key.trim_start_matches('?')
    }
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    async fn ensure_container(&self) -> Result<()> {
        let url = self.container_url()?;

        if self.sas_key_type == CONTAINER_SAS_KEY_TYPE {
            debug!("Container-scoped SAS key, assuming container exists");
            return Ok(());
        }

        let response = self
            .client
            .put(format!("{}?restype=container&{}", url, self.sas_query()))
            .header("x-ms-version", STORAGE_API_VERSION)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let code = error_code(&response);
        if status == StatusCode::CONFLICT && code == "ContainerAlreadyExists" {
            debug!("Container {} already exists", self.container_name);
            return Ok(());
        }

        Err(NodescopeError::ContainerCreate {
            status: status.as_u16(),
            code,
        })
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<()> {
        let url = format!(
            "{}/{}?{}",
            self.container_url()?,
            encode_blob_name(key),
            self.sas_query()
        );

        let response = self
            .client
            .put(url)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .body(content)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        Err(NodescopeError::StorageStatus {
            status: status.as_u16(),
            code: error_code(&response),
        })
    }
}

fn error_code(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// Percent-encode a blob name, keeping `/` as the virtual directory separator
fn encode_blob_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::BlobExporter;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn paths() -> KnownFilePaths {
        KnownFilePaths {
            azure_json: PathBuf::from("/nonexistent/azure.json"),
        }
    }

    #[test]
    fn test_encode_blob_name() {
        assert_eq!(
            encode_blob_name("2026-10-17T08-15-30Z/node-1/ig-dnstrace"),
            "2026-10-17T08-15-30Z/node-1/ig-dnstrace"
        );
        assert_eq!(encode_blob_name("a b:c"), "a%20b%3Ac");
    }

    #[tokio::test]
    async fn test_export_without_account_fails_fast() {
        let info = RuntimeInfo {
            host_node_name: "node-1".to_string(),
            storage_account_name: String::new(),
            storage_sas_key: "?sv=2021&sig=abc".to_string(),
            storage_container_name: "diagnostics".to_string(),
            ..Default::default()
        };
        let store = AzureBlobStore::new(&info, &paths());
        let exporter = BlobExporter::new(Arc::new(store), "2026-10-17T08:15:30Z", "node-1");

        let mut data = crate::collector::DataMap::new();
        data.insert("nodes".to_string(), "[]".to_string());
        struct Items(crate::collector::DataMap);
        impl crate::collector::DataProducer for Items {
            fn data(&self) -> Result<crate::collector::DataMap> {
                Ok(self.0.clone())
            }
        }

        let err = exporter.export(&Items(data)).await.unwrap_err();
        assert!(matches!(err, NodescopeError::StorageNotConfigured));
        assert!(err.to_string().contains("Storage not configured"));
    }

    #[tokio::test]
    async fn test_container_sas_skips_creation() {
        let info = RuntimeInfo {
            storage_account_name: "diagstore".to_string(),
            storage_sas_key: "?sv=2021&sig=abc".to_string(),
            storage_container_name: "diagnostics".to_string(),
            storage_sas_key_type: "Container".to_string(),
            ..Default::default()
        };
        let store = AzureBlobStore::new(&info, &paths());
        assert!(store.ensure_container().await.is_ok());
        assert_eq!(store.sas_query(), "sv=2021&sig=abc");
    }

    fn account_info() -> RuntimeInfo {
        RuntimeInfo {
            storage_account_name: "diagstore".to_string(),
            storage_sas_key: "?sv=2021&sig=abc".to_string(),
            storage_container_name: "diagnostics".to_string(),
            ..Default::default()
        }
    }

    /// Answer one request with `status` and an `x-ms-error-code`, returning the request head
    async fn storage_stub(status: &'static str, code: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\nx-ms-error-code: {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                status, code
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        (endpoint, server)
    }

    #[tokio::test]
    async fn test_existing_container_is_success() {
        let (endpoint, server) = storage_stub("409 Conflict", "ContainerAlreadyExists").await;
        let store = AzureBlobStore::new(&account_info(), &paths()).with_endpoint(endpoint);

        store.ensure_container().await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("PUT /diagnostics?restype=container&sv=2021&sig=abc "));
        assert!(request.to_ascii_lowercase().contains("x-ms-version: 2021-08-06"));
    }

    #[tokio::test]
    async fn test_other_creation_error_is_fatal() {
        let (endpoint, server) = storage_stub("403 Forbidden", "AuthorizationFailure").await;
        let store = AzureBlobStore::new(&account_info(), &paths()).with_endpoint(endpoint);

        let err = store.ensure_container().await.unwrap_err();
        match err {
            NodescopeError::ContainerCreate { status, code } => {
                assert_eq!(status, 403);
                assert_eq!(code, "AuthorizationFailure");
            }
            other => panic!("unexpected error: {}", other),
        }
        server.await.unwrap();
    }
}
