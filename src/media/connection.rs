use std::sync::Arc;

use tokio::sync::mpsc;

use crate::media::{
    LocalStream, LocalTrack, MediaError, MediaResult, PeerConnection, PeerConnectionFactory,
    PeerEventSink, PeerNotification, RemoteStream, RemoteTrack, TrackKind,
};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

/// Offer/answer progress of the current connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiation {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Complete,
}

impl Negotiation {
    fn has_remote_description(self) -> bool {
        matches!(self, Negotiation::HaveRemoteOffer | Negotiation::Complete)
    }
}

/// What happened to a received candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered,
}

/// Owns the peer connection, the local capture stream and the remote stream
/// of the current call.
///
/// Remote candidates that arrive before a remote description are buffered
/// and applied in arrival order right after the description is set.
pub struct ConnectionManager {
    factory: Arc<dyn PeerConnectionFactory>,
    events: mpsc::UnboundedSender<PeerNotification>,
    peer: Option<Box<dyn PeerConnection>>,
    generation: u64,
    negotiation: Negotiation,
    local_stream: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    pending_candidates: Vec<IceCandidate>,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        events: mpsc::UnboundedSender<PeerNotification>,
    ) -> Self {
        Self {
            factory,
            events,
            peer: None,
            generation: 0,
            negotiation: Negotiation::Stable,
            local_stream: None,
            remote_stream: None,
            pending_candidates: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.peer.is_some()
    }

    /// Whether `generation` belongs to the connection that is open now.
    pub fn is_current(&self, generation: u64) -> bool {
        self.peer.is_some() && generation == self.generation
    }

    pub fn has_local_media(&self) -> bool {
        self.local_stream.is_some()
    }

    pub fn local_tracks(&self) -> &[LocalTrack] {
        self.local_stream
            .as_ref()
            .map(LocalStream::tracks)
            .unwrap_or_default()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    #[cfg(test)]
    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    /// Create a new connection and attach every track of `stream` to it.
    pub async fn open(&mut self, stream: LocalStream) -> MediaResult<()> {
        if self.peer.is_some() || self.local_stream.is_some() {
            stream.stop_all();
            return Err(MediaError::AlreadyOpen);
        }

        self.generation += 1;
        let sink = PeerEventSink::new(self.generation, self.events.clone());
        let peer = match self.factory.create(sink).await {
            Ok(peer) => peer,
            Err(e) => {
                stream.stop_all();
                return Err(e);
            }
        };

        self.peer = Some(peer);
        self.local_stream = Some(stream);
        self.negotiation = Negotiation::Stable;

        let tracks = self.local_tracks().to_vec();
        for track in &tracks {
            let attached = self.peer()?.add_track(track).await;
            if let Err(e) = attached {
                tracing::warn!(kind = %track.kind(), error = %e, "Failed to attach local track");
                self.teardown().await;
                return Err(e);
            }
        }

        tracing::debug!(generation = self.generation, tracks = tracks.len(), "Peer connection opened");
        Ok(())
    }

    fn peer(&self) -> MediaResult<&dyn PeerConnection> {
        self.peer.as_deref().ok_or(MediaError::NoConnection)
    }

    /// Create an offer and set it as the local description.
    pub async fn create_offer(&mut self) -> MediaResult<SessionDescription> {
        if self.negotiation != Negotiation::Stable {
            return Err(MediaError::InvalidNegotiationState("offer already in progress"));
        }
        let peer = self.peer()?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.negotiation = Negotiation::HaveLocalOffer;
        Ok(offer)
    }

    /// Apply a remote offer and answer it.
    pub async fn accept_offer(&mut self, offer: SessionDescription) -> MediaResult<SessionDescription> {
        if offer.sdp_type != SdpType::Offer {
            return Err(MediaError::InvalidNegotiationState("expected an offer"));
        }
        if self.negotiation != Negotiation::Stable {
            return Err(MediaError::InvalidNegotiationState("offer received mid-negotiation"));
        }

        self.peer()?.set_remote_description(offer).await?;
        self.negotiation = Negotiation::HaveRemoteOffer;
        self.flush_pending_candidates().await;

        let peer = self.peer()?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.negotiation = Negotiation::Complete;
        Ok(answer)
    }

    /// Apply the remote answer to our offer.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> MediaResult<()> {
        if answer.sdp_type != SdpType::Answer {
            return Err(MediaError::InvalidNegotiationState("expected an answer"));
        }
        if self.negotiation != Negotiation::HaveLocalOffer {
            return Err(MediaError::InvalidNegotiationState("answer without a local offer"));
        }

        self.peer()?.set_remote_description(answer).await?;
        self.negotiation = Negotiation::Complete;
        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until a remote description
    /// exists.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> MediaResult<CandidateDisposition> {
        if self.peer.is_none() || !self.negotiation.has_remote_description() {
            tracing::debug!(buffered = self.pending_candidates.len() + 1, "Buffering remote candidate");
            self.pending_candidates.push(candidate);
            return Ok(CandidateDisposition::Buffered);
        }

        self.peer()?.add_ice_candidate(candidate).await?;
        Ok(CandidateDisposition::Applied)
    }

    async fn flush_pending_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if pending.is_empty() {
            return;
        }
        tracing::debug!(count = pending.len(), "Flushing buffered candidates");

        let Some(peer) = self.peer.as_deref() else {
            return;
        };
        for candidate in pending {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Failed to apply buffered candidate");
            }
        }
    }

    pub fn on_remote_track(&mut self, track: RemoteTrack) {
        self.remote_stream
            .get_or_insert_with(RemoteStream::default)
            .add_track(track);
    }

    /// Flip the first local track of `kind`; `false` when there is none.
    pub fn toggle(&self, kind: TrackKind) -> bool {
        self.local_stream
            .as_ref()
            .map(|stream| stream.toggle(kind))
            .unwrap_or(false)
    }

    /// Stop local media, close the connection and drop both streams.
    /// Returns false when there was nothing to release. Close errors are
    /// logged and swallowed.
    pub async fn teardown(&mut self) -> bool {
        let had_anything = self.peer.is_some()
            || self.local_stream.is_some()
            || self.remote_stream.is_some()
            || !self.pending_candidates.is_empty();

        if let Some(stream) = self.local_stream.take() {
            stream.stop_all();
        }
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!(generation = self.generation, error = %e, "Error closing peer connection");
            }
        }
        self.remote_stream = None;
        self.pending_candidates.clear();
        self.negotiation = Negotiation::Stable;

        if had_anything {
            tracing::debug!(generation = self.generation, "Connection torn down");
        }
        had_anything
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fake::{calls, BrokenCloseFactory, FakePeerFactory, PeerCall};
    use pretty_assertions::assert_eq;

    fn stream() -> (LocalStream, LocalTrack, LocalTrack) {
        let (audio, _) = LocalTrack::new(TrackKind::Audio, "mic");
        let (video, _) = LocalTrack::new(TrackKind::Video, "cam");
        (
            LocalStream::new(vec![audio.clone(), video.clone()]),
            audio,
            video,
        )
    }

    fn manager(factory: Arc<dyn PeerConnectionFactory>) -> (ConnectionManager, mpsc::UnboundedReceiver<PeerNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionManager::new(factory, tx), rx)
    }

    #[tokio::test]
    async fn candidates_before_remote_description_flush_in_arrival_order() {
        let factory = Arc::new(FakePeerFactory::new("bob"));
        let log = factory.log.clone();
        let (mut conn, _events) = manager(factory);
        conn.open(stream().0).await.unwrap();

        for n in 0..3 {
            let disposition = conn
                .add_remote_candidate(IceCandidate::new(format!("c{}", n)))
                .await
                .unwrap();
            assert_eq!(disposition, CandidateDisposition::Buffered);
        }
        assert_eq!(conn.pending_candidates().len(), 3);
        assert!(!calls(&log).iter().any(|c| matches!(c, PeerCall::AddCandidate(_))));

        conn.accept_offer(SessionDescription::offer("v=0")).await.unwrap();

        let recorded = calls(&log);
        let set_remote = recorded
            .iter()
            .position(|c| *c == PeerCall::SetRemote(SdpType::Offer))
            .unwrap();
        let applied: Vec<(usize, &PeerCall)> = recorded
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, PeerCall::AddCandidate(_)))
            .collect();
        assert_eq!(
            applied.iter().map(|(_, c)| (*c).clone()).collect::<Vec<_>>(),
            vec![
                PeerCall::AddCandidate("c0".to_string()),
                PeerCall::AddCandidate("c1".to_string()),
                PeerCall::AddCandidate("c2".to_string()),
            ]
        );
        assert!(applied.iter().all(|(i, _)| *i > set_remote));
        assert!(!recorded.iter().any(|c| matches!(c, PeerCall::CandidateBeforeRemote(_))));
        assert!(conn.pending_candidates().is_empty());

        // after the remote description, candidates apply immediately
        assert_eq!(
            conn.add_remote_candidate(IceCandidate::new("c3")).await.unwrap(),
            CandidateDisposition::Applied
        );
    }

    #[tokio::test]
    async fn answer_without_local_offer_is_refused() {
        let factory = Arc::new(FakePeerFactory::new("alice"));
        let log = factory.log.clone();
        let (mut conn, _events) = manager(factory);
        conn.open(stream().0).await.unwrap();

        let err = conn
            .accept_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidNegotiationState(_)));
        assert!(!calls(&log).iter().any(|c| matches!(c, PeerCall::SetRemote(_))));
    }

    #[tokio::test]
    async fn initiator_flushes_candidates_after_answer() {
        let factory = Arc::new(FakePeerFactory::new("alice"));
        let log = factory.log.clone();
        let (mut conn, _events) = manager(factory);
        conn.open(stream().0).await.unwrap();

        conn.create_offer().await.unwrap();
        conn.add_remote_candidate(IceCandidate::new("early")).await.unwrap();
        conn.accept_answer(SessionDescription::answer("v=0")).await.unwrap();

        let recorded = calls(&log);
        assert_eq!(
            &recorded[recorded.len() - 2..],
            &[
                PeerCall::SetRemote(SdpType::Answer),
                PeerCall::AddCandidate("early".to_string())
            ]
        );
        // a second offer on a negotiated connection is refused
        assert!(conn.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn teardown_releases_everything_and_is_idempotent() {
        let factory = Arc::new(FakePeerFactory::new("alice"));
        let log = factory.log.clone();
        let (mut conn, _events) = manager(factory);
        let (stream, audio, video) = stream();
        conn.open(stream).await.unwrap();
        conn.on_remote_track(RemoteTrack {
            id: "r1".to_string(),
            stream_id: "s1".to_string(),
            kind: TrackKind::Video,
        });

        assert!(conn.teardown().await);
        assert!(!audio.is_live());
        assert!(!video.is_live());
        assert!(conn.remote_stream().is_none());
        assert!(!conn.is_open());
        assert!(!conn.teardown().await);
        assert_eq!(
            calls(&log).iter().filter(|c| **c == PeerCall::Close).count(),
            1
        );
    }

    #[tokio::test]
    async fn close_errors_do_not_abort_teardown() {
        let (mut conn, _events) = manager(Arc::new(BrokenCloseFactory));
        let (stream, audio, _video) = stream();
        conn.open(stream).await.unwrap();

        assert!(conn.teardown().await);
        assert!(!audio.is_live());
        assert!(!conn.has_local_media());
    }

    #[tokio::test]
    async fn generations_identify_the_open_connection() {
        let (mut conn, _events) = manager(Arc::new(FakePeerFactory::new("alice")));
        conn.open(stream().0).await.unwrap();
        assert!(conn.is_current(1));
        conn.teardown().await;
        assert!(!conn.is_current(1));

        conn.open(stream().0).await.unwrap();
        assert!(!conn.is_current(1));
        assert!(conn.is_current(2));
        assert!(matches!(
            conn.open(stream().0).await,
            Err(MediaError::AlreadyOpen)
        ));
    }

    #[tokio::test]
    async fn toggle_without_media_reports_false() {
        let (mut conn, _events) = manager(Arc::new(FakePeerFactory::new("alice")));
        assert!(!conn.toggle(TrackKind::Audio));
        assert!(!conn.toggle(TrackKind::Audio));

        conn.open(stream().0).await.unwrap();
        assert!(!conn.toggle(TrackKind::Audio));
        assert!(conn.toggle(TrackKind::Audio));
    }
}
