//! Text and attachment messages with per-user reactions.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::store::{entry_path, BroadcastStore, Snapshot, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Entry key; filled in when reading, never stored
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub text: String,
    pub sender: String,
    pub timestamp: i64,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Emoji keyed by user id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, String>,
}

/// Outgoing message as submitted by the UI
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

pub fn messages_collection(room: &str) -> String {
    format!("rooms/{}/messages", room)
}

/// The room's message list as seen by one user
#[derive(Clone)]
pub struct ChatRoom {
    store: Arc<dyn BroadcastStore>,
    collection: String,
    user_id: String,
    username: String,
    messages: watch::Receiver<Snapshot>,
}

impl ChatRoom {
    pub async fn open(
        store: Arc<dyn BroadcastStore>,
        room: &str,
        user_id: &str,
        username: &str,
    ) -> StoreResult<Self> {
        let collection = messages_collection(room);
        let messages = store.subscribe(&collection).await?;
        Ok(Self {
            store,
            collection,
            user_id: user_id.to_string(),
            username: username.to_string(),
            messages,
        })
    }

    pub async fn send(&self, message: NewMessage) -> StoreResult<ChatMessage> {
        let mut stored = ChatMessage {
            id: String::new(),
            text: message.text,
            sender: self.username.clone(),
            timestamp: Utc::now().timestamp_millis(),
            kind: message.kind,
            file_url: message.file_url,
            file_name: message.file_name,
            reactions: BTreeMap::new(),
        };
        let id = self
            .store
            .append(&self.collection, serde_json::to_value(&stored)?)
            .await?;

        tracing::debug!(id = %id, kind = ?stored.kind, "Message sent");
        stored.id = id;
        Ok(stored)
    }

    /// Set the local user's reaction on `message_id`, replacing any earlier
    /// one. The whole entry is rewritten.
    pub async fn add_reaction(&self, message_id: &str, emoji: &str) -> StoreResult<ChatMessage> {
        let value = self
            .messages
            .borrow()
            .get(message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(entry_path(&self.collection, message_id)))?;

        let mut message: ChatMessage = serde_json::from_value(value)?;
        message.id.clear();
        message
            .reactions
            .insert(self.user_id.clone(), emoji.to_string());
        self.store
            .write(
                &entry_path(&self.collection, message_id),
                serde_json::to_value(&message)?,
            )
            .await?;

        message.id = message_id.to_string();
        Ok(message)
    }

    /// All messages, oldest first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let snapshot = self.messages.borrow();
        let mut messages: Vec<ChatMessage> = snapshot
            .iter()
            .filter_map(|(id, value)| {
                let mut message: ChatMessage = serde_json::from_value(value.clone()).ok()?;
                message.id = id.clone();
                Some(message)
            })
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        messages
    }
}
