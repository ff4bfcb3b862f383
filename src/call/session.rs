use serde::Serialize;

use crate::media::{CaptureError, ConnectionState};

/// Which side of the offer/answer exchange the local peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
    Undetermined,
}

/// Failure attached to the session for the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFailure {
    pub code: String,
    pub message: String,
    pub retry_available: bool,
}

impl SessionFailure {
    pub fn capture(err: &CaptureError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.user_message(),
            retry_available: false,
        }
    }

    /// The connection reported `failed`; the call can be retried from scratch.
    pub fn negotiation() -> Self {
        Self {
            code: "negotiation-failed".to_string(),
            message: "The connection to your partner failed. Try calling again.".to_string(),
            retry_available: true,
        }
    }

    pub fn media(message: impl Into<String>) -> Self {
        Self {
            code: "media-error".to_string(),
            message: message.into(),
            retry_available: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Cannot move call from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Only the initiator may create an offer")]
    NotInitiator,

    #[error("Only the responder may create an answer")]
    NotResponder,
}

/// One call attempt with explicit, validated transitions.
#[derive(Debug, Clone)]
pub struct CallSession {
    state: ConnectionState,
    role: Role,
    call_id: Option<String>,
    partner: Option<String>,
    failure: Option<SessionFailure>,
}

impl Default for CallSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSession {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::New,
            role: Role::Undetermined,
            call_id: None,
            partner: None,
            failure: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    pub fn partner(&self) -> Option<&str> {
        self.partner.as_deref()
    }

    pub fn failure(&self) -> Option<&SessionFailure> {
        self.failure.as_ref()
    }

    /// A call is in progress and owns local media.
    pub fn is_active(&self) -> bool {
        self.call_id.is_some()
            && matches!(
                self.state,
                ConnectionState::New
                    | ConnectionState::Connecting
                    | ConnectionState::Connected
                    | ConnectionState::Disconnected
            )
    }

    /// Start over for a fresh attempt.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn connecting(&mut self, call_id: &str, partner: &str, role: Role) -> Result<(), SessionError> {
        if self.state != ConnectionState::New {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: ConnectionState::Connecting,
            });
        }
        self.state = ConnectionState::Connecting;
        self.role = role;
        self.call_id = Some(call_id.to_string());
        self.partner = Some(partner.to_string());
        Ok(())
    }

    /// The partner accepted our request. Returns false when the role was
    /// already decided.
    pub fn assume_initiator(&mut self) -> bool {
        if self.role != Role::Undetermined || !self.is_active() {
            return false;
        }
        self.role = Role::Initiator;
        true
    }

    pub fn ensure_can_offer(&self) -> Result<(), SessionError> {
        match self.role {
            Role::Initiator => Ok(()),
            _ => Err(SessionError::NotInitiator),
        }
    }

    pub fn ensure_can_answer(&self) -> Result<(), SessionError> {
        match self.role {
            Role::Responder => Ok(()),
            _ => Err(SessionError::NotResponder),
        }
    }

    /// Mirror a state reported by the connection. Returns true when the
    /// state changed. Nothing is mirrored once the session is closed.
    pub fn mirror(&mut self, state: ConnectionState) -> bool {
        if self.state == ConnectionState::Closed || self.state == state {
            return false;
        }
        self.state = state;
        if state == ConnectionState::Failed && self.failure.is_none() {
            self.failure = Some(SessionFailure::negotiation());
        }
        true
    }

    pub fn fail(&mut self, failure: SessionFailure) -> Result<(), SessionError> {
        if !matches!(self.state, ConnectionState::New | ConnectionState::Connecting) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: ConnectionState::Failed,
            });
        }
        self.state = ConnectionState::Failed;
        self.failure = Some(failure);
        Ok(())
    }

    /// Close from any state. Returns false when already closed.
    pub fn close(&mut self) -> bool {
        let changed = self.state != ConnectionState::Closed || self.call_id.is_some();
        self.state = ConnectionState::Closed;
        self.role = Role::Undetermined;
        self.call_id = None;
        self.partner = None;
        self.failure = None;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn only_the_initiator_offers_and_only_the_responder_answers() {
        let mut caller = CallSession::new();
        caller.connecting("c1", "bob", Role::Undetermined).unwrap();
        assert_eq!(caller.ensure_can_offer(), Err(SessionError::NotInitiator));
        assert!(caller.assume_initiator());
        assert!(!caller.assume_initiator());
        assert!(caller.ensure_can_offer().is_ok());
        assert_eq!(caller.ensure_can_answer(), Err(SessionError::NotResponder));

        let mut callee = CallSession::new();
        callee.connecting("c1", "alice", Role::Responder).unwrap();
        assert!(!callee.assume_initiator());
        assert!(callee.ensure_can_answer().is_ok());
        assert_eq!(callee.ensure_can_offer(), Err(SessionError::NotInitiator));
    }

    #[test]
    fn capture_failure_fails_from_new() {
        let mut session = CallSession::new();
        session
            .fail(SessionFailure::capture(&CaptureError::PermissionDenied))
            .unwrap();
        assert_eq!(session.state(), ConnectionState::Failed);
        assert_eq!(session.failure().unwrap().code, "permission-denied");
        assert!(!session.is_active());
        assert!(session.connecting("c1", "bob", Role::Undetermined).is_err());
    }

    #[test]
    fn mirrored_failure_offers_retry() {
        let mut session = CallSession::new();
        session.connecting("c1", "bob", Role::Responder).unwrap();
        assert!(session.mirror(ConnectionState::Connected));
        assert!(!session.mirror(ConnectionState::Connected));
        assert!(session.mirror(ConnectionState::Disconnected));
        assert!(session.is_active());
        assert!(session.mirror(ConnectionState::Failed));
        assert!(session.failure().unwrap().retry_available);
        assert!(session.fail(SessionFailure::negotiation()).is_err());
    }

    #[test]
    fn close_is_idempotent_and_stops_mirroring() {
        let mut session = CallSession::new();
        assert!(session.close());
        assert!(!session.close());

        session.reset();
        session.connecting("c1", "bob", Role::Responder).unwrap();
        assert!(session.close());
        assert_eq!(session.call_id(), None);
        assert!(!session.mirror(ConnectionState::Connected));
        assert_eq!(session.state(), ConnectionState::Closed);
    }
}
