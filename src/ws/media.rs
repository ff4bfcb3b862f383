use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::StreamExt;
use tokio::sync::mpsc::error::TrySendError;

use crate::media::{FeedDevices, Frame, TrackKind};
use crate::state::AppState;

/// Upgrade a capture source pushing encoded `kind` frames, one per binary
/// message.
pub async fn feed_upgrade(
    ws: WebSocketUpgrade,
    Path(kind): Path<TrackKind>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_feed(socket, state, kind))
}

async fn handle_feed(mut socket: WebSocket, state: AppState, kind: TrackKind) {
    tracing::info!(kind = %kind, "Media feed connected");

    let mut dropped = 0u64;
    while let Some(result) = socket.next().await {
        match result {
            Ok(Message::Binary(frame)) => {
                if !ingest_frame(&state.feeds, kind, frame).await {
                    dropped += 1;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Media feed error");
                break;
            }
            _ => {}
        }
    }

    tracing::info!(kind = %kind, dropped, "Media feed disconnected");
}

/// Hand `frame` to the live track of `kind`. Returns false when the frame was
/// dropped: no call is capturing that kind, or the track is not keeping up.
pub(crate) async fn ingest_frame(feeds: &FeedDevices, kind: TrackKind, frame: Frame) -> bool {
    let Some(tx) = feeds.frame_sender(kind).await else {
        return false;
    };
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::trace!(kind = %kind, "Track feed full, dropping frame");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaDevices};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn frames_reach_the_captured_track() {
        let feeds = FeedDevices::new(true, true);
        assert!(!ingest_frame(&feeds, TrackKind::Video, Bytes::from_static(b"early")).await);

        let stream = feeds
            .acquire(&MediaConstraints::for_viewport(1280))
            .await
            .unwrap();
        let video = stream.first_track(TrackKind::Video).unwrap();
        let mut feed = video.take_feed().await.unwrap();

        assert!(ingest_frame(&feeds, TrackKind::Video, Bytes::from_static(b"vp8")).await);
        assert_eq!(feed.recv().await, Some(Bytes::from_static(b"vp8")));

        stream.stop_all();
        assert!(!ingest_frame(&feeds, TrackKind::Video, Bytes::from_static(b"late")).await);
    }

    #[tokio::test]
    async fn full_feed_drops_frames() {
        let feeds = FeedDevices::new(true, false);
        let constraints = MediaConstraints {
            audio: MediaConstraints::for_viewport(1280).audio,
            video: None,
        };
        let _stream = feeds.acquire(&constraints).await.unwrap();

        let mut accepted = 0;
        for _ in 0..100 {
            if ingest_frame(&feeds, TrackKind::Audio, Bytes::from_static(b"opus")).await {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 64);
    }
}
