//! Upload of collector outputs to remote object storage
//!
//! Each item lands at `<run-timestamp>/<node-name>/<item-name>`, with the
//! colons of the RFC 3339 run timestamp replaced by dashes.

pub mod azure;
pub mod memory;

pub use azure::AzureBlobStore;
pub use memory::MemoryStore;

use crate::collector::DataProducer;
use crate::{NodescopeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::OnceCell;
use tracing::info;

/// Destination container for uploaded items
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the destination container. Already existing counts as success.
    async fn ensure_container(&self) -> Result<()>;

    async fn put(&self, key: &str, content: Bytes) -> Result<()>;
}

/// Uploads named items under the per-run, per-node prefix
pub struct BlobExporter {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    container_ready: OnceCell<()>,
}

impl BlobExporter {
    pub fn new(store: Arc<dyn ObjectStore>, creation_time: &str, node_name: &str) -> Self {
        Self {
            store,
            prefix: format!("{}/{}", creation_time.replace(':', "-"), node_name),
            container_ready: OnceCell::new(),
        }
    }

    /// Full object key an item is uploaded under
    pub fn blob_key(&self, item: &str) -> String {
        format!("{}/{}", self.prefix, item)
    }

    async fn ensure_container(&self) -> Result<()> {
        self.container_ready
            .get_or_try_init(|| self.store.ensure_container())
            .await?;
        Ok(())
    }

    /// Upload every item of `producer`, stopping at the first failure.
    ///
    /// The destination is checked before the producer is asked for data, so
    /// a storage problem is reported ahead of anything the producer lacks.
    pub async fn export<P>(&self, producer: &P) -> Result<()>
    where
        P: DataProducer + Sync + ?Sized,
    {
        self.ensure_container().await?;
        let data = producer.data()?;

        for (item, content) in data {
            info!("Append blob file: {} (of size {} bytes)", item, content.len());
            self.store
                .put(&self.blob_key(&item), Bytes::from(content))
                .await
                .map_err(|e| NodescopeError::Upload {
                    item: item.clone(),
                    source: Box::new(e),
                })?;
        }

        Ok(())
    }

    /// Upload a single named stream outside of any collector
    pub async fn export_reader<R>(&self, name: &str, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.ensure_container().await?;

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;

        info!("Uploading the file with blob name: {}", name);
        self.store
            .put(&self.blob_key(name), Bytes::from(buf))
            .await
            .map_err(|e| NodescopeError::Upload {
                item: name.to_string(),
                source: Box::new(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::DataMap;

    struct StaticProducer(DataMap);

    impl DataProducer for StaticProducer {
        fn data(&self) -> Result<DataMap> {
            Ok(self.0.clone())
        }
    }

    fn producer(items: &[(&str, &str)]) -> StaticProducer {
        StaticProducer(
            items
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_blob_key_replaces_colons() {
        let exporter = BlobExporter::new(
            Arc::new(MemoryStore::new()),
            "2026-10-17T08:15:30Z",
            "aks-nodepool1-0",
        );
        assert_eq!(
            exporter.blob_key("ig-dnstrace"),
            "2026-10-17T08-15-30Z/aks-nodepool1-0/ig-dnstrace"
        );
    }

    #[tokio::test]
    async fn test_export_round_trip() {
        let store = MemoryStore::new();
        let exporter = BlobExporter::new(Arc::new(store.clone()), "2026-10-17T08:15:30Z", "node");

        exporter
            .export(&producer(&[("nodes", "[{\"name\":\"node\"}]"), ("pods", "[]")]))
            .await
            .unwrap();

        assert!(store.container_created());
        assert_eq!(
            store.get(&exporter.blob_key("nodes")).unwrap(),
            Bytes::from_static(b"[{\"name\":\"node\"}]")
        );
        assert_eq!(store.get(&exporter.blob_key("pods")).unwrap(), Bytes::from_static(b"[]"));
    }

    #[tokio::test]
    async fn test_export_reader_round_trip() {
        let store = MemoryStore::new();
        let exporter = BlobExporter::new(Arc::new(store.clone()), "2026-10-17T08:15:30Z", "node");

        let content = b"packaged artifact bytes\x00\x01".to_vec();
        let mut reader = std::io::Cursor::new(content.clone());
        exporter.export_reader("bundle.zip", &mut reader).await.unwrap();

        assert_eq!(
            store.get(&exporter.blob_key("bundle.zip")).unwrap().to_vec(),
            content
        );
    }

    #[tokio::test]
    async fn test_export_fails_fast_on_first_upload_error() {
        let store = MemoryStore::new();
        store.fail_on("b-item");
        let exporter = BlobExporter::new(Arc::new(store.clone()), "t", "node");

        let err = exporter
            .export(&producer(&[("a-item", "1"), ("b-item", "2"), ("c-item", "3")]))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("b-item"));
        assert!(store.get(&exporter.blob_key("a-item")).is_some());
        assert!(store.get(&exporter.blob_key("c-item")).is_none());
    }

    struct EmptyTrace;

    impl DataProducer for EmptyTrace {
        fn data(&self) -> Result<DataMap> {
            Err(NodescopeError::EmptyTrace("ig-dnstrace".to_string()))
        }
    }

    #[tokio::test]
    async fn test_container_creation_failure_uploads_nothing() {
        let store = MemoryStore::new();
        store.refuse_container();
        let exporter = BlobExporter::new(Arc::new(store.clone()), "t", "node");

        let err = exporter
            .export(&producer(&[("nodes", "[]"), ("pods", "[]")]))
            .await
            .unwrap_err();

        assert!(matches!(err, NodescopeError::ContainerCreate { status: 403, .. }));
        assert_eq!(store.put_count(), 0);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_storage_error_reported_before_producer_error() {
        let store = MemoryStore::new();
        store.refuse_container();
        let exporter = BlobExporter::new(Arc::new(store.clone()), "t", "node");

        let err = exporter.export(&EmptyTrace).await.unwrap_err();
        assert!(matches!(err, NodescopeError::ContainerCreate { .. }));

        let healthy = MemoryStore::new();
        let exporter = BlobExporter::new(Arc::new(healthy.clone()), "t", "node");
        let err = exporter.export(&EmptyTrace).await.unwrap_err();
        assert!(matches!(err, NodescopeError::EmptyTrace(_)));
        assert_eq!(healthy.put_count(), 0);
    }
}
