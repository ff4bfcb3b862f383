//! WebSocket control surface: call commands in, call events and presence out.
//! Captured media frames come in on a separate socket per track kind.

pub mod handler;
pub mod media;
pub mod messages;

pub use handler::ws_routes;
pub use messages::*;
