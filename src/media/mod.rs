//! Media capture and peer-connection plumbing.
//!
//! The platform capabilities sit behind [`MediaDevices`] and
//! [`PeerConnectionFactory`]; [`ConnectionManager`] drives them for one call.

pub mod connection;
pub mod devices;
pub mod sample_forwarder;
pub mod stream;
pub mod webrtc_peer;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::signaling::{IceCandidate, SessionDescription};

pub use connection::{CandidateDisposition, ConnectionManager};
pub use devices::{CaptureError, FeedDevices, MediaConstraints, MediaDevices};
pub use stream::{Frame, LocalStream, LocalTrack, RemoteStream, RemoteTrack, TrackKind};
pub use webrtc_peer::WebRtcPeerFactory;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("No peer connection is open")]
    NoConnection,

    #[error("A peer connection is already open")]
    AlreadyOpen,

    #[error("Invalid negotiation state: {0}")]
    InvalidNegotiationState(&'static str),

    #[error("WebRTC error: {0}")]
    WebRtc(String),
}

impl From<webrtc::Error> for MediaError {
    fn from(err: webrtc::Error) -> Self {
        MediaError::WebRtc(err.to_string())
    }
}

pub type MediaResult<T> = std::result::Result<T, MediaError>;

/// Connection state as reported by the platform, plus the application level
/// `connecting` phase used before a connection reports anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications raised by a peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    Track(RemoteTrack),
    StateChange(ConnectionState),
}

/// A [`PeerEvent`] tagged with the connection generation that raised it.
#[derive(Debug, Clone)]
pub struct PeerNotification {
    pub generation: u64,
    pub event: PeerEvent,
}

/// Handed to a new connection so its callbacks can report back to the owner.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerNotification>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerNotification>) -> Self {
        Self { generation, tx }
    }

    pub fn emit(&self, event: PeerEvent) {
        if self
            .tx
            .send(PeerNotification {
                generation: self.generation,
                event,
            })
            .is_err()
        {
            tracing::trace!(generation = self.generation, "Peer event dropped, owner gone");
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> MediaResult<()>;
    async fn create_offer(&self) -> MediaResult<SessionDescription>;
    async fn create_answer(&self) -> MediaResult<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> MediaResult<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> MediaResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MediaResult<()>;
    async fn close(&self) -> MediaResult<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> MediaResult<Box<dyn PeerConnection>>;
}
