//! Presence and typing indicators for the two members of a room.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::store::{entry_path, BroadcastStore, Snapshot, StoreResult};

/// One presence entry, upserted wholesale on every change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub username: String,
    pub is_online: bool,
    pub last_seen: i64,
    pub is_typing: bool,
}

pub fn users_collection(room: &str) -> String {
    format!("rooms/{}/users", room)
}

fn new_user_id() -> String {
    format!("user_{}", Uuid::new_v4().simple())
}

fn decode_roster(snapshot: &Snapshot) -> Vec<Participant> {
    snapshot
        .iter()
        .filter_map(|(key, value)| match serde_json::from_value(value.clone()) {
            Ok(participant) => Some(participant),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Skipping malformed presence entry");
                None
            }
        })
        .collect()
}

/// Publishes the local user's presence and reads everyone else's.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn BroadcastStore>,
    collection: String,
    local: Arc<Mutex<Participant>>,
    local_id: String,
    local_username: String,
    roster: watch::Receiver<Snapshot>,
}

impl PresenceTracker {
    /// Mark `username` online in `room` and arrange for the entry to be removed
    /// when the store connection drops.
    pub async fn join(
        store: Arc<dyn BroadcastStore>,
        room: &str,
        username: &str,
    ) -> StoreResult<Self> {
        let collection = users_collection(room);
        let local = Participant {
            id: new_user_id(),
            username: username.to_string(),
            is_online: true,
            last_seen: Utc::now().timestamp_millis(),
            is_typing: false,
        };
        let path = entry_path(&collection, &local.id);

        store.write(&path, serde_json::to_value(&local)?).await?;
        store.on_disconnect_remove(&path).await?;
        let roster = store.subscribe(&collection).await?;

        tracing::info!(room = %room, user_id = %local.id, username = %username, "Joined room");

        Ok(Self {
            store,
            collection,
            local_id: local.id.clone(),
            local_username: username.to_string(),
            local: Arc::new(Mutex::new(local)),
            roster,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.local_id
    }

    pub fn username(&self) -> &str {
        &self.local_username
    }

    async fn update(&self, apply: impl FnOnce(&mut Participant)) -> StoreResult<()> {
        let mut local = self.local.lock().await;
        apply(&mut local);
        local.last_seen = Utc::now().timestamp_millis();
        let path = entry_path(&self.collection, &local.id);
        self.store.write(&path, serde_json::to_value(&*local)?).await
    }

    pub async fn set_typing(&self, is_typing: bool) -> StoreResult<()> {
        self.update(|me| me.is_typing = is_typing).await
    }

    /// Mark the local user offline.
    pub async fn leave(&self) -> StoreResult<()> {
        self.update(|me| {
            me.is_online = false;
            me.is_typing = false;
        })
        .await?;
        tracing::info!(user_id = %self.local_id, "Left room");
        Ok(())
    }

    /// Every presence entry in the room, the local user included.
    pub fn roster(&self) -> Vec<Participant> {
        decode_roster(&self.roster.borrow())
    }

    /// Receiver that changes whenever the roster does.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.roster.clone()
    }

    fn others(&self) -> Vec<Participant> {
        self.roster()
            .into_iter()
            .filter(|p| p.id != self.local_id && p.username != self.local_username)
            .collect()
    }

    /// The other member of this two-party room: the only other username,
    /// preferring online entries. `None` when there is nobody or more than
    /// one candidate.
    pub fn partner(&self) -> Option<String> {
        let others = self.others();
        let online: BTreeSet<&str> = others
            .iter()
            .filter(|p| p.is_online)
            .map(|p| p.username.as_str())
            .collect();
        let everyone: BTreeSet<&str> = others.iter().map(|p| p.username.as_str()).collect();

        let candidates = if online.is_empty() { everyone } else { online };
        if candidates.len() != 1 {
            if candidates.len() > 1 {
                tracing::debug!(candidates = candidates.len(), "Partner is ambiguous");
            }
            return None;
        }
        let partner = candidates.into_iter().next().map(str::to_string);
        partner
    }

    pub fn partner_online(&self) -> bool {
        self.others().iter().any(|p| p.is_online)
    }

    /// Username of a partner who is currently typing.
    pub fn partner_typing(&self) -> Option<String> {
        self.others()
            .into_iter()
            .find(|p| p.is_typing)
            .map(|p| p.username)
    }
}
