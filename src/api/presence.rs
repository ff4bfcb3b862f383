use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::presence::{Participant, PresenceTracker};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    pub user_id: String,
    pub username: String,
    pub partner: Option<String>,
    pub partner_online: bool,
    pub partner_typing: Option<String>,
    pub participants: Vec<Participant>,
}

impl PresenceResponse {
    pub fn from_tracker(presence: &PresenceTracker) -> Self {
        Self {
            user_id: presence.user_id().to_string(),
            username: presence.username().to_string(),
            partner: presence.partner(),
            partner_online: presence.partner_online(),
            partner_typing: presence.partner_typing(),
            participants: presence.roster(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    pub is_typing: bool,
}

pub fn presence_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_presence))
        .route("/typing", post(set_typing))
}

/// GET /api/v1/presence - Roster and partner status
async fn get_presence(State(state): State<AppState>) -> Json<PresenceResponse> {
    Json(PresenceResponse::from_tracker(&state.presence))
}

/// POST /api/v1/presence/typing - Update the local typing flag
async fn set_typing(
    State(state): State<AppState>,
    Json(request): Json<TypingRequest>,
) -> Result<StatusCode> {
    state.presence.set_typing(request.is_typing).await?;
    Ok(StatusCode::NO_CONTENT)
}
