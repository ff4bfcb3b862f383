use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use duochat::api;
use duochat::call::{CallAgent, CallSettings};
use duochat::chat::ChatRoom;
use duochat::config::{Config, LogFormat};
use duochat::media::{FeedDevices, WebRtcPeerFactory};
use duochat::presence::PresenceTracker;
use duochat::state::AppState;
use duochat::storage::{BlobStore, HttpBlobStore};
use duochat::store::{BroadcastStore, MemoryStore, RedisStore};
use duochat::ws::ws_routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
    }

    tracing::info!(
        host = %config.server_host,
        port = %config.server_port,
        room = %config.room_code,
        username = %config.username,
        "Starting Duochat peer..."
    );

    // Shared broadcast store
    let store: Arc<dyn BroadcastStore> = match &config.redis_url {
        Some(url) => {
            let redis = RedisStore::connect_with_lease_ttl(url, config.store_lease_ttl()).await?;
            match redis.health_check().await {
                Ok(true) => tracing::info!("Redis connection established"),
                Ok(false) => tracing::warn!("Redis health check returned false"),
                Err(e) => tracing::error!(error = %e, "Failed to reach Redis"),
            }
            Arc::new(redis)
        }
        None => {
            tracing::warn!("REDIS_URL not set, using an in-process store");
            Arc::new(MemoryStore::new())
        }
    };

    let presence = PresenceTracker::join(store.clone(), &config.room_code, &config.username).await?;
    let chat = ChatRoom::open(
        store.clone(),
        &config.room_code,
        presence.user_id(),
        &config.username,
    )
    .await?;

    // Call agent
    let devices = Arc::new(FeedDevices::new(config.capture_audio, config.capture_video));
    let factory = Arc::new(WebRtcPeerFactory::new(&config)?);
    let calls = CallAgent::spawn(
        store.clone(),
        presence.clone(),
        devices.clone(),
        factory,
        CallSettings::from_config(&config),
    )
    .await?;
    tracing::info!("Call agent started");

    let storage: Option<Arc<dyn BlobStore>> = match HttpBlobStore::from_config(&config) {
        Ok(blobs) => Some(Arc::new(blobs)),
        Err(e) => {
            tracing::info!(reason = %e, "Attachments disabled");
            None
        }
    };

    let addr: SocketAddr = config.server_addr().parse()?;

    // Create application state
    let state = AppState::new(
        config,
        store.clone(),
        calls.clone(),
        presence.clone(),
        chat,
        devices,
        storage,
    );

    // Build router
    let app = Router::new()
        .merge(api::create_router(state.clone()))
        .merge(ws_routes().with_state(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Hang up and leave the room before dropping the store connection
    if let Err(e) = calls.end_call().await {
        tracing::warn!(error = %e, "Failed to end call during shutdown");
    }
    if let Err(e) = presence.leave().await {
        tracing::warn!(error = %e, "Failed to leave room during shutdown");
    }
    if let Err(e) = store.disconnect().await {
        tracing::warn!(error = %e, "Failed to disconnect store");
    }

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Handle shutdown signals
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down...");
        },
    }
}
