//! # huddle-server
//!
//! Chat and message state engine for an organization's internal messenger.
//!
//! This binary provides:
//! - **Chat Directory** for direct and group chats, membership, join
//!   requests, blocks and moderation, with an append-only audit log
//! - **Message Store Adapter** that seals message text through the
//!   Encryption Gateway before it reaches SQLite
//! - **Presence & Typing Hub** tracking live connections per user
//! - **Realtime Dispatcher** serving the WebSocket protocol
//! - **REST API** (axum) for every chat and message operation

mod api;
mod auth;
mod config;
mod directory;
mod dispatcher;
mod error;
mod hub;
mod messaging;
mod ws;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use huddle_shared::clock::SystemClock;
use huddle_shared::crypto::ChatKeyGateway;
use huddle_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,huddle_server=debug")),
        )
        .init();

    info!("Starting Huddle chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.auth_server_pubkey == [0u8; 32] {
        tracing::warn!("AUTH_SERVER_PUBKEY is not set; every request will be rejected");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Arc::new(Database::open_at(&config.database_path)?);
    let gateway = Arc::new(ChatKeyGateway::new(config.message_master_key));
    let http_addr = config.http_addr;
    let app_state = AppState::new(config, db, Arc::new(SystemClock), gateway);

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API and WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
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
