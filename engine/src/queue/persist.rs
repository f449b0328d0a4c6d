//! Durable queue layout.
//!
//! One meta key holds the ordered list of entry ids; each entry is stored
//! under its own key. Entries are written before the meta list references
//! them and the meta list drops an id before its entry is removed, so a crash
//! between the two writes never leaves a dangling id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::MutationRequest;
use crate::{error::Result, QueueEntryId};

/// Key holding the ordered list of queue entry ids.
pub const META_KEY: &str = "offline-meta-data";

/// Key of one queue entry.
pub fn entry_key(id: &str) -> String {
    format!("offline:{}", id)
}

/// Key/value store the queue persists to.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<Value>>;

    async fn set_item(&self, key: &str, value: Value) -> Result<()>;

    async fn remove_item(&self, key: &str) -> Result<()>;
}

/// In-memory [`OfflineStore`]. Clones share data, which lets tests simulate
/// a restart by building a new queue over the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryOfflineStore {
    items: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.items.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<()> {
        self.items.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.items.write().await.remove(key);
        Ok(())
    }
}

/// Queue persistence on top of an [`OfflineStore`].
#[derive(Clone)]
pub(crate) struct QueueStore {
    store: Arc<dyn OfflineStore>,
}

impl QueueStore {
    pub(crate) fn new(store: Arc<dyn OfflineStore>) -> Self {
        Self { store }
    }

    /// Read every persisted request in queue order.
    pub(crate) async fn load(&self) -> Result<Vec<MutationRequest>> {
        let ids: Vec<QueueEntryId> = match self.store.get_item(META_KEY).await? {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };

        let mut requests = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get_item(&entry_key(&id)).await? {
                Some(value) => requests.push(serde_json::from_value(value)?),
                None => tracing::warn!(entry = %id, "queue entry missing from offline store"),
            }
        }
        Ok(requests)
    }

    /// Persist a new entry, then the id list that references it.
    pub(crate) async fn append(&self, request: &MutationRequest, ids: &[QueueEntryId]) -> Result<()> {
        self.put(request).await?;
        self.write_meta(ids).await
    }

    /// Overwrite an existing entry.
    pub(crate) async fn put(&self, request: &MutationRequest) -> Result<()> {
        self.store
            .set_item(&entry_key(&request.id), serde_json::to_value(request)?)
            .await
    }

    /// Drop an id from the list, then its entry.
    pub(crate) async fn remove(&self, id: &str, ids: &[QueueEntryId]) -> Result<()> {
        self.write_meta(ids).await?;
        self.store.remove_item(&entry_key(id)).await
    }

    async fn write_meta(&self, ids: &[QueueEntryId]) -> Result<()> {
        self.store
            .set_item(META_KEY, serde_json::to_value(ids)?)
            .await
    }

    pub(crate) fn offline_store(&self) -> &Arc<dyn OfflineStore> {
        &self.store
    }
}
