//! In-process object store, used for dry runs and tests

use crate::export::ObjectStore;
use crate::{NodescopeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<DashMap<String, Bytes>>,
    created: Arc<AtomicBool>,
    refuse_container: Arc<AtomicBool>,
    failing_items: Arc<DashSet<String>>,
    puts: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upload whose key ends with `/<item>` fail
    pub fn fail_on(&self, item: &str) {
        self.failing_items.insert(item.to_string());
    }

    /// Make container creation fail as an unauthorized SAS would
    pub fn refuse_container(&self) {
        self.refuse_container.store(true, Ordering::SeqCst);
    }

    /// Upload attempts, failed ones included
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|r| r.value().clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn container_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_container(&self) -> Result<()> {
        if self.refuse_container.load(Ordering::SeqCst) {
            return Err(NodescopeError::ContainerCreate {
                status: 403,
                code: "AuthorizationPermissionMismatch".to_string(),
            });
        }
        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let item = key.rsplit('/').next().unwrap_or(key);
        if self.failing_items.contains(item) {
            return Err(NodescopeError::StorageStatus {
                status: 500,
                code: "InternalError".to_string(),
            });
        }
        self.objects.insert(key.to_string(), content);
        Ok(())
    }
}
