pub mod api;
pub mod call;
pub mod chat;
pub mod config;
pub mod error;
pub mod media;
pub mod presence;
pub mod signaling;
pub mod state;
pub mod storage;
pub mod store;
pub mod ws;

pub use config::Config;
pub use error::{AppError, CallError, Result};
pub use state::AppState;
