//! Call negotiation: invitations, the per-call state machine and the agent
//! task that drives both.

pub mod agent;
pub mod ringing;
pub mod session;

pub use agent::{CallAgent, CallEvent, CallHandle, CallSettings, CallSnapshot, ClearReason};
pub use ringing::{IncomingCall, NewInvitation, OutgoingCall, RingingController};
pub use session::{CallSession, Role, SessionError, SessionFailure};
