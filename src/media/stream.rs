use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Encoded media payload pushed by a capture source
pub type Frame = Bytes;

/// Frames buffered per track before the capture side has to wait.
const FEED_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
    feed: Mutex<Option<mpsc::Receiver<Frame>>>,
}

/// A captured local track. Clones share state.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    /// Create a live, enabled track together with the sender its capture
    /// source writes frames into.
    pub fn new(kind: TrackKind, label: impl Into<String>) -> (Self, mpsc::Sender<Frame>) {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let track = Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                feed: Mutex::new(Some(rx)),
            }),
        };
        (track, tx)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Flip the enabled flag and return the new value.
    pub fn toggle(&self) -> bool {
        !self.inner.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Stop capturing. Returns false when the track was already stopped.
    pub fn stop(&self) -> bool {
        self.inner.live.swap(false, Ordering::SeqCst)
    }

    /// Take the frame feed; only the first caller gets it.
    pub async fn take_feed(&self) -> Option<mpsc::Receiver<Frame>> {
        self.inner.feed.lock().await.take()
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Local capture stream, exclusively owned by the connection manager.
#[derive(Debug)]
pub struct LocalStream {
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn first_track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Flip the first track of `kind`; `false` when there is none.
    pub fn toggle(&self, kind: TrackKind) -> bool {
        self.first_track(kind).map(LocalTrack::toggle).unwrap_or(false)
    }

    /// Stop every track regardless of kind.
    pub fn stop_all(&self) {
        for track in &self.tracks {
            if track.stop() {
                tracing::debug!(kind = %track.kind(), track_id = %track.id(), "Stopped local track");
            }
        }
    }
}

/// Descriptor of a track received from the partner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Remote stream; received, not owned
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn add_track(&mut self, track: RemoteTrack) {
        if self.id.is_empty() {
            self.id = track.stream_id.clone();
        }
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }
}
