//! In-process stand-ins for the capture provider and peer connections.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::media::{
    CaptureError, ConnectionState, LocalStream, LocalTrack, MediaConstraints, MediaDevices,
    MediaError, MediaResult, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink,
    TrackKind,
};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

/// Calls recorded by a fake peer, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    AddTrack(TrackKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    /// A candidate was applied before any remote description
    CandidateBeforeRemote(String),
    Close,
}

pub type PeerLog = Arc<Mutex<Vec<PeerCall>>>;

pub fn calls(log: &PeerLog) -> Vec<PeerCall> {
    log.lock().unwrap().clone()
}

pub struct FakeDevices {
    pub supported: bool,
    pub secure: bool,
    pub failure: Option<CaptureError>,
    pub acquisitions: AtomicUsize,
}

impl FakeDevices {
    pub fn working() -> Self {
        Self {
            supported: true,
            secure: true,
            failure: None,
            acquisitions: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: CaptureError) -> Self {
        Self {
            failure: Some(error),
            ..Self::working()
        }
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn is_secure_context(&self) -> bool {
        self.secure
    }

    async fn acquire(&self, _constraints: &MediaConstraints) -> Result<LocalStream, CaptureError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let (audio, _) = LocalTrack::new(TrackKind::Audio, "fake-mic");
        let (video, _) = LocalTrack::new(TrackKind::Video, "fake-cam");
        Ok(LocalStream::new(vec![audio, video]))
    }
}

/// Creates [`FakePeer`]s sharing one call log.
pub struct FakePeerFactory {
    pub log: PeerLog,
    pub label: String,
    refuse: bool,
}

impl FakePeerFactory {
    pub fn new(label: &str) -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            label: label.to_string(),
            refuse: false,
        }
    }

    /// Factory that cannot create connections at all.
    pub fn refusing(label: &str) -> Self {
        Self {
            refuse: true,
            ..Self::new(label)
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, events: PeerEventSink) -> MediaResult<Box<dyn PeerConnection>> {
        if self.refuse {
            return Err(MediaError::WebRtc("no transport available".to_string()));
        }
        Ok(Box::new(FakePeer {
            log: self.log.clone(),
            label: self.label.clone(),
            events,
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            candidates: AtomicUsize::new(0),
        }))
    }
}

/// Peer that behaves like a browser connection without any network: it
/// gathers one candidate per local description and reports `connected` once
/// both descriptions are set.
pub struct FakePeer {
    log: PeerLog,
    label: String,
    events: PeerEventSink,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    candidates: AtomicUsize,
}

impl FakePeer {
    fn record(&self, call: PeerCall) {
        self.log.lock().unwrap().push(call);
    }

    fn report_connected_if_negotiated(&self) {
        if self.has_local.load(Ordering::SeqCst) && self.has_remote.load(Ordering::SeqCst) {
            self.events
                .emit(PeerEvent::StateChange(ConnectionState::Connected));
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: &LocalTrack) -> MediaResult<()> {
        self.record(PeerCall::AddTrack(track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> MediaResult<SessionDescription> {
        self.record(PeerCall::CreateOffer);
        Ok(SessionDescription::offer(format!("v=0 offer from {}", self.label)))
    }

    async fn create_answer(&self) -> MediaResult<SessionDescription> {
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(MediaError::InvalidNegotiationState("answer without remote offer"));
        }
        self.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer(format!("v=0 answer from {}", self.label)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> MediaResult<()> {
        self.record(PeerCall::SetLocal(desc.sdp_type));
        self.has_local.store(true, Ordering::SeqCst);

        let n = self.candidates.fetch_add(1, Ordering::SeqCst);
        self.events.emit(PeerEvent::IceCandidate(IceCandidate::new(format!(
            "candidate:{}-{}",
            self.label, n
        ))));
        self.events
            .emit(PeerEvent::StateChange(ConnectionState::Connecting));
        self.report_connected_if_negotiated();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> MediaResult<()> {
        self.record(PeerCall::SetRemote(desc.sdp_type));
        self.has_remote.store(true, Ordering::SeqCst);
        self.report_connected_if_negotiated();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MediaResult<()> {
        if !self.has_remote.load(Ordering::SeqCst) {
            self.record(PeerCall::CandidateBeforeRemote(candidate.candidate));
            return Err(MediaError::InvalidNegotiationState(
                "candidate before remote description",
            ));
        }
        self.record(PeerCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> MediaResult<()> {
        self.record(PeerCall::Close);
        Ok(())
    }
}

/// Factory whose connections fail to close, for teardown tests.
pub struct BrokenCloseFactory;

struct BrokenClosePeer;

#[async_trait]
impl PeerConnectionFactory for BrokenCloseFactory {
    async fn create(&self, _events: PeerEventSink) -> MediaResult<Box<dyn PeerConnection>> {
        Ok(Box::new(BrokenClosePeer))
    }
}

#[async_trait]
impl PeerConnection for BrokenClosePeer {
    async fn add_track(&self, _track: &LocalTrack) -> MediaResult<()> {
        Ok(())
    }

    async fn create_offer(&self) -> MediaResult<SessionDescription> {
        Ok(SessionDescription::offer("v=0"))
    }

    async fn create_answer(&self) -> MediaResult<SessionDescription> {
        Ok(SessionDescription::answer("v=0"))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> MediaResult<()> {
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> MediaResult<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> MediaResult<()> {
        Ok(())
    }

    async fn close(&self) -> MediaResult<()> {
        Err(MediaError::WebRtc("transport already gone".to_string()))
    }
}
