use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::Config;
use crate::media::sample_forwarder::SampleForwarder;
use crate::media::{
    ConnectionState, LocalTrack, MediaError, MediaResult, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventSink, RemoteTrack, TrackKind,
};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn to_rtc_description(desc: SessionDescription) -> MediaResult<RTCSessionDescription> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc_description(desc: RTCSessionDescription) -> MediaResult<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        _ => Err(MediaError::InvalidNegotiationState(
            "unsupported session description type",
        )),
    }
}

/// Peer connection factory backed by webrtc-rs
pub struct WebRtcPeerFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerFactory {
    pub fn new(config: &Config) -> MediaResult<Self> {
        // Configure media engine
        let mut media_engine = MediaEngine::default();

        // Register audio codec (Opus)
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: opus_capability(),
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        // Register video codec (VP8)
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: vp8_capability(),
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(SettingEngine::default())
            .build();

        let ice_servers = vec![RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        }];

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }

    fn create_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(&self, events: PeerEventSink) -> MediaResult<Box<dyn PeerConnection>> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.create_config()).await?);

        // Trickle every local candidate to the owner
        let ice_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = ice_events.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.emit(PeerEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize ICE candidate"),
                }
            })
        }));

        // Surface remote tracks and drain their RTP
        let track_events = events.clone();
        peer_connection.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                tracing::info!(
                    kind = %kind,
                    codec = %track.codec().capability.mime_type,
                    "Received remote track"
                );
                events.emit(PeerEvent::Track(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                }));

                tokio::spawn(async move {
                    let mut packets: u64 = 0;
                    while track.read_rtp().await.is_ok() {
                        packets += 1;
                    }
                    tracing::debug!(kind = %kind, packets, "Remote track ended");
                });
            })
        }));

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            tracing::info!(state = ?state, "Peer connection state changed");
            state_events.emit(PeerEvent::StateChange(connection_state(state)));
            Box::pin(async {})
        }));

        Ok(Box::new(WebRtcPeer {
            peer_connection,
            forwarders: Mutex::new(Vec::new()),
        }))
    }
}

/// One webrtc-rs peer connection with the forwarders feeding its tracks
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    forwarders: Mutex<Vec<Arc<SampleForwarder>>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_track(&self, track: &LocalTrack) -> MediaResult<()> {
        let capability = match track.kind() {
            TrackKind::Audio => opus_capability(),
            TrackKind::Video => vp8_capability(),
        };
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            format!("duochat-{}", track.label()),
        ));

        let rtp_sender = self
            .peer_connection
            .add_track(Arc::clone(&rtc_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Read RTCP so interceptors keep running
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
        });

        if let Some(feed) = track.take_feed().await {
            let forwarder = Arc::new(SampleForwarder::new(track.clone(), rtc_track));
            forwarder.start(feed);
            self.forwarders.lock().await.push(forwarder);
        }

        tracing::debug!(kind = %track.kind(), track_id = %track.id(), "Local track attached");
        Ok(())
    }

    async fn create_offer(&self) -> MediaResult<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> MediaResult<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> MediaResult<()> {
        self.peer_connection
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> MediaResult<()> {
        self.peer_connection
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MediaResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> MediaResult<()> {
        for forwarder in self.forwarders.lock().await.drain(..) {
            forwarder.stop();
        }
        self.peer_connection.close().await?;
        Ok(())
    }
}
