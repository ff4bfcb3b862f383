use serde::{Deserialize, Serialize};

/// Signal types exchanged over the room channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    CallRequest,
    CallAccepted,
    CallRejected,
    CallEnded,
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::CallRequest => "call-request",
            SignalKind::CallAccepted => "call-accepted",
            SignalKind::CallRejected => "call-rejected",
            SignalKind::CallEnded => "call-ended",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as exchanged on the wire (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Envelope for every entry on the call channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub sender: String,
    /// Absent means broadcast to the room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    /// Epoch milliseconds, stamped on publish
    #[serde(default)]
    pub timestamp: i64,
}

impl CallSignal {
    fn new(kind: SignalKind, sender: &str, target: &str, call_id: &str) -> Self {
        Self {
            kind,
            sender: sender.to_string(),
            target: Some(target.to_string()),
            call_id: Some(call_id.to_string()),
            offer: None,
            answer: None,
            candidate: None,
            timestamp: 0,
        }
    }

    pub fn call_request(sender: &str, target: &str, call_id: &str) -> Self {
        Self::new(SignalKind::CallRequest, sender, target, call_id)
    }

    pub fn call_accepted(sender: &str, target: &str, call_id: &str) -> Self {
        Self::new(SignalKind::CallAccepted, sender, target, call_id)
    }

    pub fn call_rejected(sender: &str, target: &str, call_id: &str) -> Self {
        Self::new(SignalKind::CallRejected, sender, target, call_id)
    }

    pub fn call_ended(sender: &str, target: &str, call_id: &str) -> Self {
        Self::new(SignalKind::CallEnded, sender, target, call_id)
    }

    pub fn offer(sender: &str, target: &str, call_id: &str, offer: SessionDescription) -> Self {
        Self {
            offer: Some(offer),
            ..Self::new(SignalKind::Offer, sender, target, call_id)
        }
    }

    pub fn answer(sender: &str, target: &str, call_id: &str, answer: SessionDescription) -> Self {
        Self {
            answer: Some(answer),
            ..Self::new(SignalKind::Answer, sender, target, call_id)
        }
    }

    pub fn ice_candidate(
        sender: &str,
        target: &str,
        call_id: &str,
        candidate: IceCandidate,
    ) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::new(SignalKind::IceCandidate, sender, target, call_id)
        }
    }

    /// True when `user` should process this signal: it was sent by someone
    /// else and is either targeted at `user` or broadcast.
    pub fn is_addressed_to(&self, user: &str) -> bool {
        self.sender != user && self.target.as_deref().map_or(true, |t| t == user)
    }

    pub fn matches_call(&self, call_id: Option<&str>) -> bool {
        call_id.is_some() && self.call_id.as_deref() == call_id
    }
}

/// Channel scopes under which signals are stored
pub mod scopes {
    /// Ringing flow: request / accept / reject / end
    pub const CALL_SIGNALS: &str = "call-signals";
    /// Negotiation flow: offer / answer / ice-candidate
    pub const VIDEO_CALLS: &str = "video-calls";
}
