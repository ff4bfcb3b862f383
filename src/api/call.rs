use axum::{extract::State, routing::get, Json, Router};

use crate::call::CallSnapshot;
use crate::error::Result;
use crate::state::AppState;

pub fn call_routes() -> Router<AppState> {
    Router::new().route("/", get(get_call))
}

/// GET /api/v1/call - Current call state
async fn get_call(State(state): State<AppState>) -> Result<Json<CallSnapshot>> {
    Ok(Json(state.calls.snapshot().await?))
}
