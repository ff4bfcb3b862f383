pub mod channel;
pub mod messages;

pub use channel::*;
pub use messages::*;
