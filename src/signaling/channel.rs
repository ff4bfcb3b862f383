use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::signaling::CallSignal;
use crate::store::{entry_path, BroadcastStore, Snapshot, StoreError, StoreResult};

/// Upper bound on remembered entry ids.
const HANDLED_CAPACITY: usize = 512;

/// An entry addressed to the local user that has not been acknowledged yet
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub signal: CallSignal,
}

/// Bounded FIFO set of entry ids this client already handled.
#[derive(Debug, Default)]
struct HandledIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl HandledIds {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > HANDLED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Message bus over one room-scoped collection of the broadcast store.
///
/// The store resends the full collection on every change, so each call to
/// [`SignalChannel::take_pending`] re-filters the latest snapshot and skips ids
/// already acknowledged. Entries older than `max_age` are deleted unread.
pub struct SignalChannel {
    store: Arc<dyn BroadcastStore>,
    collection: String,
    local_user: String,
    max_age: Duration,
    snapshots: watch::Receiver<Snapshot>,
    handled: HandledIds,
}

impl SignalChannel {
    pub async fn open(
        store: Arc<dyn BroadcastStore>,
        scope: &str,
        room: &str,
        local_user: &str,
        max_age: Duration,
    ) -> StoreResult<Self> {
        let collection = format!("{}/{}", scope, room);
        let snapshots = store.subscribe(&collection).await?;

        tracing::debug!(collection = %collection, user = %local_user, "Signal channel opened");

        Ok(Self {
            store,
            collection,
            local_user: local_user.to_string(),
            max_age,
            snapshots,
            handled: HandledIds::default(),
        })
    }

    /// Append `signal`, stamping the publish time.
    pub async fn publish(&self, mut signal: CallSignal) -> StoreResult<String> {
        signal.timestamp = Utc::now().timestamp_millis();
        let value = serde_json::to_value(&signal)?;
        let id = self.store.append(&self.collection, value).await?;

        tracing::debug!(
            collection = %self.collection,
            kind = %signal.kind,
            target = ?signal.target,
            call_id = ?signal.call_id,
            id = %id,
            "Signal published"
        );
        Ok(id)
    }

    /// Wait until the collection changes.
    pub async fn changed(&mut self) -> StoreResult<()> {
        self.snapshots
            .changed()
            .await
            .map_err(|_| StoreError::Disconnected)
    }

    /// Entries from the current snapshot that are addressed to the local user
    /// and not yet handled, in insertion order.
    pub async fn take_pending(&mut self) -> Vec<Delivery> {
        let snapshot = self.snapshots.borrow_and_update().clone();
        let now = Utc::now().timestamp_millis();
        let max_age_ms = i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX);

        let mut deliveries = Vec::new();
        for (id, value) in snapshot {
            if self.handled.contains(&id) {
                continue;
            }

            let signal: CallSignal = match serde_json::from_value(value) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::debug!(collection = %self.collection, id = %id, error = %e, "Skipping malformed signal");
                    self.handled.insert(&id);
                    continue;
                }
            };

            if now.saturating_sub(signal.timestamp) > max_age_ms {
                tracing::debug!(collection = %self.collection, id = %id, kind = %signal.kind, "Pruning stale signal");
                self.acknowledge(&id).await;
                continue;
            }

            if signal.is_addressed_to(&self.local_user) {
                deliveries.push(Delivery { id, signal });
            }
        }
        deliveries
    }

    /// Delete a handled entry so it is not delivered again.
    pub async fn acknowledge(&mut self, id: &str) {
        if !self.handled.insert(id) {
            return;
        }
        if let Err(e) = self.store.delete(&entry_path(&self.collection, id)).await {
            tracing::warn!(collection = %self.collection, id = %id, error = %e, "Failed to acknowledge signal");
        }
    }
}
