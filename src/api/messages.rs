use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::chat::{ChatMessage, NewMessage};
use crate::error::{AppError, Result};
use crate::storage::StorageError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub url: String,
    pub file_name: String,
}

pub fn message_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_messages).post(send_message))
        .route("/{message_id}/reactions", post(add_reaction))
}

pub fn upload_routes() -> Router<AppState> {
    Router::new().route("/", post(upload))
}

/// GET /api/v1/messages - All messages, oldest first
async fn list_messages(State(state): State<AppState>) -> Json<Vec<ChatMessage>> {
    Json(state.chat.messages())
}

/// POST /api/v1/messages - Send a message
async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<NewMessage>,
) -> Result<(StatusCode, Json<ChatMessage>)> {
    if request.text.trim().is_empty() && request.file_url.is_none() {
        return Err(AppError::BadRequest("Message is empty".to_string()));
    }
    let message = state.chat.send(request).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// POST /api/v1/messages/{message_id}/reactions - React to a message
async fn add_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(request): Json<ReactionRequest>,
) -> Result<Json<ChatMessage>> {
    if request.emoji.is_empty() {
        return Err(AppError::BadRequest("Reaction is empty".to_string()));
    }
    Ok(Json(state.chat.add_reaction(&message_id, &request.emoji).await?))
}

/// POST /api/v1/uploads?name= - Store an attachment and return its public URL
async fn upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>)> {
    let storage = state.storage.as_ref().ok_or(StorageError::NotConfigured)?;
    if body.is_empty() {
        return Err(AppError::BadRequest("Upload is empty".to_string()));
    }

    let url = storage.upload(&params.name, body.to_vec()).await?;
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            url,
            file_name: params.name,
        }),
    ))
}
