//! # palaver-server
//!
//! Real-time chat backend for the support platform.
//!
//! This binary provides:
//! - **WebSocket delivery** of chat events: room-scoped message fan-out,
//!   typing indicators, read receipts, and global presence broadcasts
//! - **Offline notifications** durably queued for participants who are not
//!   reachable live, drained on their next connection
//! - **REST API** (axum) for conversation/message/notification CRUD
//! - **Bearer-credential verification** against the two upstream identity
//!   authorities, with a short-TTL cache

mod api;
mod auth;
mod chat;
mod config;
mod error;
mod registry;
mod rooms;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use palaver_store::Database;

use crate::api::AppState;
use crate::auth::{AuthService, HttpVerifier};
use crate::config::ServerConfig;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,palaver_server=debug")),
        )
        .init();

    info!("Starting palaver chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Arc::new(Mutex::new(Database::open_at(&config.database_path)?));

    let verifier = HttpVerifier::new(
        &config.auth_api_url,
        Duration::from_secs(config.auth_timeout_secs),
    )?;
    let auth = Arc::new(AuthService::new(
        Arc::new(verifier),
        Duration::from_secs(config.auth_cache_ttl_secs),
    ));

    let state = AppState {
        db: db.clone(),
        auth: auth.clone(),
        registry: Arc::new(ConnectionRegistry::new()),
        rooms: Arc::new(RoomRegistry::new()),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic token-cache purge (every minute).
    {
        let auth = auth.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                auth.purge_expired().await;
            }
        });
    }

    // Periodic presence purge: records idle beyond the TTL are dropped even
    // if no disconnect was ever processed for them.
    {
        let db = db.clone();
        let ttl = chrono::Duration::seconds(config.presence_ttl_secs as i64);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            loop {
                interval.tick().await;
                let cutoff = Utc::now() - ttl;
                let purged = db.lock().await.purge_stale_presence(cutoff);
                match purged {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "purged stale presence records"),
                    Err(e) => tracing::warn!(error = %e, "presence purge failed"),
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // 5. Run the HTTP/WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
