use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::api::presence::PresenceResponse;
use crate::error::AppError;
use crate::state::AppState;
use crate::ws::{msg_types, CallStartedPayload, TogglePayload, TypingPayload, WsEnvelope};

/// WebSocket routes
pub fn ws_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/ws/media/{kind}", get(crate::ws::media::feed_upgrade))
}

/// WebSocket upgrade handler
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, "WebSocket connected");

    // Create message channel for sending to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<WsEnvelope>();

    // Initial view so the client doesn't wait for the first change
    match state.calls.snapshot().await {
        Ok(snapshot) => match serde_json::to_value(snapshot) {
            Ok(payload) => {
                let _ = tx.send(WsEnvelope::new(msg_types::CALL_SNAPSHOT, payload));
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode call snapshot"),
        },
        Err(e) => tracing::warn!(error = %e, "Call agent unavailable"),
    }
    let _ = tx.send(presence_message(&state));

    let event_task = tokio::spawn(forward_call_events(state.calls.subscribe(), tx.clone()));
    let presence_task = tokio::spawn(forward_presence(state.clone(), tx.clone()));

    // Split socket into sender and receiver
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task for sending messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Process incoming messages
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if tx.send(handle_message(&text, &state).await).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close received");
                break;
            }
            Err(e) => {
                tracing::error!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");

    event_task.abort();
    presence_task.abort();
    send_task.abort();
}

async fn forward_call_events(
    mut events: broadcast::Receiver<crate::call::CallEvent>,
    tx: mpsc::UnboundedSender<WsEnvelope>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let payload = match serde_json::to_value(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode call event");
                        continue;
                    }
                };
                if tx.send(WsEnvelope::new(msg_types::CALL_EVENT, payload)).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Client fell behind on call events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn forward_presence(state: AppState, tx: mpsc::UnboundedSender<WsEnvelope>) {
    let mut roster = state.presence.watch();
    while roster.changed().await.is_ok() {
        if tx.send(presence_message(&state)).is_err() {
            break;
        }
    }
}

fn presence_message(state: &AppState) -> WsEnvelope {
    let payload = serde_json::to_value(PresenceResponse::from_tracker(&state.presence))
        .unwrap_or(Value::Null);
    WsEnvelope::new(msg_types::PRESENCE, payload)
}

/// Run one client command and build the reply, success or error.
pub(crate) async fn handle_message(text: &str, state: &AppState) -> WsEnvelope {
    let msg: WsEnvelope = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => return WsEnvelope::error(400, &format!("Invalid message: {}", e), None),
    };
    let request_id = msg.request_id.clone();

    tracing::debug!(msg_type = %msg.msg_type, "Received message");

    match dispatch(msg, state).await {
        Ok(reply) => reply.with_request_id(request_id),
        Err(e) => {
            tracing::debug!(error = %e, "Command failed");
            WsEnvelope::error(e.status().as_u16(), e.message(), request_id)
        }
    }
}

async fn dispatch(msg: WsEnvelope, state: &AppState) -> Result<WsEnvelope, AppError> {
    let payload = match msg.msg_type.as_str() {
        msg_types::START_CALL => {
            let call_id = state.calls.start_call().await?;
            serde_json::to_value(CallStartedPayload { call_id })?
        }
        msg_types::ACCEPT_CALL => {
            state.calls.accept_call().await?;
            Value::Null
        }
        msg_types::REJECT_CALL => {
            state.calls.reject_call().await?;
            Value::Null
        }
        msg_types::END_CALL => {
            state.calls.end_call().await?;
            Value::Null
        }
        msg_types::TOGGLE_AUDIO => {
            let enabled = state.calls.toggle_audio().await?;
            serde_json::to_value(TogglePayload { enabled })?
        }
        msg_types::TOGGLE_VIDEO => {
            let enabled = state.calls.toggle_video().await?;
            serde_json::to_value(TogglePayload { enabled })?
        }
        msg_types::TYPING => {
            let typing: TypingPayload = serde_json::from_value(msg.payload)?;
            state.presence.set_typing(typing.is_typing).await?;
            Value::Null
        }
        msg_types::PING => return Ok(WsEnvelope::new(msg_types::PONG, Value::Null)),
        other => {
            tracing::warn!(msg_type = %other, "Unknown message type");
            return Err(AppError::BadRequest("Unknown message type".to_string()));
        }
    };

    Ok(WsEnvelope::new(msg_types::RESULT, payload))
}
