pub mod call;
pub mod health;
pub mod messages;
pub mod presence;

use axum::Router;

use crate::state::AppState;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_routes())
        .merge(health::health_routes())
        .with_state(state)
}

/// API v1 routes
fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/call", call::call_routes())
        .nest("/presence", presence::presence_routes())
        .nest("/messages", messages::message_routes())
        .nest("/uploads", messages::upload_routes())
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::test_support::test_state;
    use super::*;
    use crate::storage::{BlobStore, StorageError};
    use crate::store::MemoryStore;

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[derive(Default)]
    struct RecordingBlobStore {
        uploads: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl BlobStore for RecordingBlobStore {
        async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
            self.uploads.lock().unwrap().push((name.to_string(), bytes.len()));
            Ok(format!("https://files.test/{}", name))
        }
    }

    #[tokio::test]
    async fn health_reports_store_and_agent() {
        let router = create_router(test_state(Arc::new(MemoryStore::new()), "alice", None).await);

        let (status, body) = send(&router, Method::GET, "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["call_agent"], "running");
    }

    #[tokio::test]
    async fn call_snapshot_starts_idle() {
        let router = create_router(test_state(Arc::new(MemoryStore::new()), "alice", None).await);

        let (status, body) = send(&router, Method::GET, "/api/v1/call", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "new");
        assert_eq!(body["role"], "undetermined");
        assert_eq!(body["callId"], Value::Null);
    }

    #[tokio::test]
    async fn messages_are_shared_between_peers() {
        let store = Arc::new(MemoryStore::new());
        let alice = create_router(test_state(store.clone(), "alice", None).await);
        let bob = create_router(test_state(store, "bob", None).await);

        let (status, sent) = send(
            &alice,
            Method::POST,
            "/api/v1/messages",
            Some(json!({ "text": "hi bob" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sent["sender"], "alice");
        assert_eq!(sent["type"], "text");

        let (status, listed) = send(&bob, Method::GET, "/api/v1/messages", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().map(Vec::len), Some(1));
        assert_eq!(listed[0]["text"], "hi bob");

        let id = listed[0]["id"].as_str().unwrap().to_string();
        let uri = format!("/api/v1/messages/{}/reactions", id);
        let (status, reacted) = send(&bob, Method::POST, &uri, Some(json!({ "emoji": "👍" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reacted["reactions"].as_object().map(|r| r.len()), Some(1));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let router = create_router(test_state(Arc::new(MemoryStore::new()), "alice", None).await);

        let (status, body) = send(
            &router,
            Method::POST,
            "/api/v1/messages",
            Some(json!({ "text": "   " })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn reaction_to_unknown_message_is_not_found() {
        let router = create_router(test_state(Arc::new(MemoryStore::new()), "alice", None).await);

        let (status, _) = send(
            &router,
            Method::POST,
            "/api/v1/messages/missing/reactions",
            Some(json!({ "emoji": "🎉" })),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn presence_lists_partner_and_typing() {
        let store = Arc::new(MemoryStore::new());
        let alice = create_router(test_state(store.clone(), "alice", None).await);
        let bob = create_router(test_state(store, "bob", None).await);

        let (status, _) = send(
            &bob,
            Method::POST,
            "/api/v1/presence/typing",
            Some(json!({ "isTyping": true })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&alice, Method::GET, "/api/v1/presence", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["username"], "alice");
        assert_eq!(body["partner"], "bob");
        assert_eq!(body["partnerOnline"], true);
        assert_eq!(body["partnerTyping"], "bob");
        assert_eq!(body["participants"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn upload_without_storage_is_unavailable() {
        let router = create_router(test_state(Arc::new(MemoryStore::new()), "alice", None).await);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/uploads?name=photo.png")
            .body(Body::from(vec![1u8, 2, 3]))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn upload_returns_public_url() {
        let blobs = Arc::new(RecordingBlobStore::default());
        let storage: Arc<dyn BlobStore> = blobs.clone();
        let router =
            create_router(test_state(Arc::new(MemoryStore::new()), "alice", Some(storage)).await);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/uploads?name=photo.png")
            .body(Body::from(vec![7u8; 16]))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["url"], "https://files.test/photo.png");
        assert_eq!(body["fileName"], "photo.png");
        assert_eq!(
            blobs.uploads.lock().unwrap().clone(),
            vec![("photo.png".to_string(), 16)]
        );
    }
}
