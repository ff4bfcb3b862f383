use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{watch, Mutex};

use super::{entry_path, split_entry_path, BroadcastStore, Snapshot, StoreResult};

/// In-process broadcast store. Both peers of a room share one instance in
/// tests and single-process runs.
#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<String, watch::Sender<Snapshot>>,
    on_disconnect: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents of a collection.
    pub fn snapshot(&self, path: &str) -> Snapshot {
        self.collections
            .get(path.trim_matches('/'))
            .map(|tx| tx.borrow().clone())
            .unwrap_or_default()
    }

    fn modify(&self, collection: &str, f: impl FnOnce(&mut Snapshot) -> bool) {
        self.collections
            .entry(collection.to_string())
            .or_insert_with(|| watch::channel(Snapshot::new()).0)
            .send_if_modified(f);
    }
}

#[async_trait]
impl BroadcastStore for MemoryStore {
    async fn write(&self, path: &str, value: Value) -> StoreResult<()> {
        let (collection, key) = split_entry_path(path)?;
        self.modify(collection, |entries| {
            entries.insert(key.to_string(), value);
            true
        });
        Ok(())
    }

    async fn append(&self, path: &str, value: Value) -> StoreResult<String> {
        let collection = path.trim_matches('/');
        let id = format!("{:020}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let key = id.clone();
        self.modify(collection, |entries| {
            entries.insert(key, value);
            true
        });
        tracing::trace!(path = %entry_path(collection, &id), "Entry appended");
        Ok(id)
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let (collection, key) = split_entry_path(path)?;
        if let Some(tx) = self.collections.get(collection) {
            tx.send_if_modified(|entries| entries.remove(key).is_some());
        }
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> StoreResult<watch::Receiver<Snapshot>> {
        Ok(self
            .collections
            .entry(path.trim_matches('/').to_string())
            .or_insert_with(|| watch::channel(Snapshot::new()).0)
            .subscribe())
    }

    async fn on_disconnect_remove(&self, path: &str) -> StoreResult<()> {
        split_entry_path(path)?;
        self.on_disconnect.lock().await.push(path.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> StoreResult<()> {
        let paths = std::mem::take(&mut *self.on_disconnect.lock().await);
        for path in paths {
            self.delete(&path).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<bool> {
        Ok(true)
    }
}
