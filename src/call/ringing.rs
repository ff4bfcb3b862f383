use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

/// Fresh identifier for one call attempt
pub fn new_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingCall {
    pub call_id: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub caller: String,
    pub call_id: String,
    pub timestamp: i64,
}

/// A freshly recorded invitation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvitation {
    pub call: IncomingCall,
    /// The invitation that was ringing before, now dropped
    pub displaced: Option<IncomingCall>,
}

/// A ringing timer that ran out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// Nobody answered our call; handled locally.
    Outgoing(OutgoingCall),
    /// We did not answer in time; the caller is told with `call-rejected`.
    Incoming(IncomingCall),
}

/// Tracks the outstanding outgoing and incoming invitation and their
/// deadlines. Publishing is left to the caller, this type only decides.
#[derive(Debug)]
pub struct RingingController {
    timeout: Duration,
    outgoing: Option<(OutgoingCall, Instant)>,
    incoming: Option<(IncomingCall, Instant)>,
}

impl RingingController {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            outgoing: None,
            incoming: None,
        }
    }

    pub fn outgoing(&self) -> Option<&OutgoingCall> {
        self.outgoing.as_ref().map(|(call, _)| call)
    }

    pub fn incoming(&self) -> Option<&IncomingCall> {
        self.incoming.as_ref().map(|(call, _)| call)
    }

    /// Start ringing `target` under a fresh call id.
    pub fn initiate(&mut self, target: &str) -> OutgoingCall {
        let call = OutgoingCall {
            call_id: new_call_id(),
            target: target.to_string(),
        };
        self.outgoing = Some((call.clone(), Instant::now() + self.timeout));
        call
    }

    /// Record a `call-request`. Returns `None` for a repeat of the invitation
    /// already ringing.
    pub fn on_request(&mut self, caller: &str, call_id: &str, timestamp: i64) -> Option<NewInvitation> {
        if self.incoming().is_some_and(|call| call.call_id == call_id) {
            return None;
        }

        let call = IncomingCall {
            caller: caller.to_string(),
            call_id: call_id.to_string(),
            timestamp,
        };
        let displaced = self
            .incoming
            .replace((call.clone(), Instant::now() + self.timeout))
            .map(|(previous, _)| previous);
        if let Some(previous) = &displaced {
            tracing::debug!(previous = %previous.call_id, call_id = %call_id, "Incoming call replaced");
        }
        Some(NewInvitation { call, displaced })
    }

    pub fn accept(&mut self) -> Option<IncomingCall> {
        self.incoming.take().map(|(call, _)| call)
    }

    pub fn reject(&mut self) -> Option<IncomingCall> {
        self.incoming.take().map(|(call, _)| call)
    }

    /// `call-accepted` for our outstanding call id clears the outgoing ring.
    pub fn on_accepted(&mut self, call_id: Option<&str>) -> Option<OutgoingCall> {
        self.take_outgoing_matching(call_id)
    }

    pub fn on_rejected(&mut self, call_id: Option<&str>) -> Option<OutgoingCall> {
        self.take_outgoing_matching(call_id)
    }

    /// The caller hung up before we answered.
    pub fn on_ended(&mut self, call_id: Option<&str>) -> Option<IncomingCall> {
        let matches = call_id.is_some()
            && self.incoming().map(|call| call.call_id.as_str()) == call_id;
        if !matches {
            return None;
        }
        self.incoming.take().map(|(call, _)| call)
    }

    pub fn cancel_outgoing(&mut self) -> Option<OutgoingCall> {
        self.outgoing.take().map(|(call, _)| call)
    }

    fn take_outgoing_matching(&mut self, call_id: Option<&str>) -> Option<OutgoingCall> {
        let matches = call_id.is_some()
            && self.outgoing().map(|call| call.call_id.as_str()) == call_id;
        if !matches {
            return None;
        }
        self.outgoing.take().map(|(call, _)| call)
    }

    /// Nearest pending deadline, if any ring is outstanding.
    pub fn next_deadline(&self) -> Option<Instant> {
        let outgoing = self.outgoing.as_ref().map(|(_, at)| *at);
        let incoming = self.incoming.as_ref().map(|(_, at)| *at);
        match (outgoing, incoming) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Remove and return every ring whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Expiry> {
        let mut expired = Vec::new();
        if self.outgoing.as_ref().is_some_and(|(_, at)| *at <= now) {
            if let Some((call, _)) = self.outgoing.take() {
                expired.push(Expiry::Outgoing(call));
            }
        }
        if self.incoming.as_ref().is_some_and(|(_, at)| *at <= now) {
            if let Some((call, _)) = self.incoming.take() {
                expired.push(Expiry::Incoming(call));
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RING: Duration = Duration::from_secs(30);

    #[test]
    fn call_ids_are_unique_and_prefixed() {
        let a = new_call_id();
        let b = new_call_id();
        assert!(a.starts_with("call_"));
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_acceptance_leaves_outgoing_call_untouched() {
        let mut ringing = RingingController::new(RING);
        let call = ringing.initiate("bob");

        assert_eq!(ringing.on_accepted(Some("call_old")), None);
        assert_eq!(ringing.on_accepted(None), None);
        assert_eq!(ringing.on_rejected(Some("call_old")), None);
        assert_eq!(ringing.outgoing(), Some(&call));
        assert!(ringing.next_deadline().is_some());

        assert_eq!(ringing.on_accepted(Some(&call.call_id)), Some(call));
        assert_eq!(ringing.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn outgoing_ring_expires_after_timeout() {
        let mut ringing = RingingController::new(RING);
        let call = ringing.initiate("bob");

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(ringing.expire(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ringing.expire(Instant::now()), vec![Expiry::Outgoing(call)]);
        assert_eq!(ringing.outgoing(), None);
        assert!(ringing.expire(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn answering_clears_the_incoming_timer() {
        let mut ringing = RingingController::new(RING);
        let incoming = ringing.on_request("alice", "c1", 1).unwrap().call;
        assert_eq!(ringing.on_request("alice", "c1", 1), None);

        assert_eq!(ringing.accept(), Some(incoming));
        assert_eq!(ringing.next_deadline(), None);

        tokio::time::advance(RING * 2).await;
        assert!(ringing.expire(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_request_displaces_the_ringing_invitation() {
        let mut ringing = RingingController::new(RING);
        let first = ringing.on_request("alice", "c1", 1).unwrap();
        assert_eq!(first.displaced, None);

        tokio::time::advance(Duration::from_secs(10)).await;
        let second = ringing.on_request("carol", "c2", 2).unwrap();

        assert_eq!(second.displaced, Some(first.call));
        assert_eq!(ringing.incoming(), Some(&second.call));
        // the new invitation gets a full ring of its own
        assert_eq!(ringing.next_deadline(), Some(Instant::now() + RING));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_hangup_only_clears_matching_invitation() {
        let mut ringing = RingingController::new(RING);
        ringing.on_request("alice", "c1", 1).unwrap();

        assert_eq!(ringing.on_ended(Some("c0")), None);
        assert!(ringing.incoming().is_some());
        assert_eq!(ringing.on_ended(Some("c1")).unwrap().caller, "alice");
        assert!(ringing.incoming().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn nearest_deadline_wins() {
        let mut ringing = RingingController::new(RING);
        ringing.initiate("bob");
        tokio::time::advance(Duration::from_secs(10)).await;
        ringing.on_request("bob", "c2", 1).unwrap();

        let outgoing_deadline = ringing.next_deadline().unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(outgoing_deadline, Instant::now());

        let expired = ringing.expire(Instant::now());
        assert!(matches!(expired.as_slice(), [Expiry::Outgoing(_)]));
        assert!(ringing.incoming().is_some());
    }
}
