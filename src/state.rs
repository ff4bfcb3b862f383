use std::sync::Arc;

use crate::call::CallHandle;
use crate::chat::ChatRoom;
use crate::config::Config;
use crate::media::FeedDevices;
use crate::presence::PresenceTracker;
use crate::storage::BlobStore;
use crate::store::BroadcastStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn BroadcastStore>,
    pub calls: CallHandle,
    pub presence: PresenceTracker,
    pub chat: ChatRoom,
    /// Capture provider the host pushes encoded frames into
    pub feeds: Arc<FeedDevices>,
    /// Absent when no blob storage is configured
    pub storage: Option<Arc<dyn BlobStore>>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn BroadcastStore>,
        calls: CallHandle,
        presence: PresenceTracker,
        chat: ChatRoom,
        feeds: Arc<FeedDevices>,
        storage: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            calls,
            presence,
            chat,
            feeds,
            storage,
        }
    }
}
