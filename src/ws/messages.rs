use serde::{Deserialize, Serialize};

/// Wrapper for all WebSocket messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WsEnvelope {
    pub fn new(msg_type: &str, payload: serde_json::Value) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            request_id: None,
            payload,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn error(code: u16, message: &str, request_id: Option<String>) -> Self {
        Self {
            msg_type: msg_types::ERROR.to_string(),
            request_id,
            payload: serde_json::json!({
                "code": code,
                "message": message
            }),
        }
    }
}

// ==================== Client -> Server Messages ====================

/// typing message payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub is_typing: bool,
}

// ==================== Server -> Client Messages ====================

/// Reply to start_call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStartedPayload {
    pub call_id: String,
}

/// Reply to toggle_audio / toggle_video
#[derive(Debug, Clone, Serialize)]
pub struct TogglePayload {
    pub enabled: bool,
}

/// Message types enum for matching
pub mod msg_types {
    pub const START_CALL: &str = "start_call";
    pub const ACCEPT_CALL: &str = "accept_call";
    pub const REJECT_CALL: &str = "reject_call";
    pub const END_CALL: &str = "end_call";
    pub const TOGGLE_AUDIO: &str = "toggle_audio";
    pub const TOGGLE_VIDEO: &str = "toggle_video";
    pub const TYPING: &str = "typing";
    pub const PING: &str = "ping";

    // Server -> Client
    pub const CALL_SNAPSHOT: &str = "call_snapshot";
    pub const CALL_EVENT: &str = "call_event";
    pub const PRESENCE: &str = "presence";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const PONG: &str = "pong";
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn envelope_without_payload_parses() {
        let msg: WsEnvelope = serde_json::from_str(r#"{"type":"end_call"}"#).unwrap();
        assert_eq!(msg.msg_type, msg_types::END_CALL);
        assert_eq!(msg.request_id, None);
        assert_eq!(msg.payload, serde_json::Value::Null);
    }

    #[test]
    fn error_keeps_request_id() {
        let msg = WsEnvelope::error(409, "busy", Some("r-1".to_string()));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "error",
                "request_id": "r-1",
                "payload": { "code": 409, "message": "busy" }
            })
        );
    }
}
