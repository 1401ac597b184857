//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use huddle_shared::constants::{
    DEFAULT_CONNECTION_BUFFER, DEFAULT_HTTP_PORT, DELETE_FOR_ALL_WINDOW_SECS, SYMMETRIC_KEY_SIZE,
};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP API and the WebSocket endpoint.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite file holding chats, messages and the audit log.
    /// Env: `DATABASE_PATH`
    /// Default: `./huddle.db`
    pub database_path: PathBuf,

    /// Ed25519 public key of the identity service (hex-encoded, 64 chars).
    /// Env: `AUTH_SERVER_PUBKEY`
    /// Default: all-zeros, which verifies no token.
    pub auth_server_pubkey: [u8; 32],

    /// Master key of the message Encryption Gateway (hex-encoded, 64 chars).
    /// Env: `MESSAGE_MASTER_KEY`
    /// Default: all-zeros (development only).
    pub message_master_key: [u8; SYMMETRIC_KEY_SIZE],

    /// How long after sending a message its author may delete it for everyone.
    /// Env: `DELETE_FOR_ALL_WINDOW_SECS`
    /// Default: `600`
    pub delete_for_all_window_secs: i64,

    /// Outbound event queue per realtime connection. Events for a full
    /// queue are dropped.
    /// Env: `CONNECTION_BUFFER`
    /// Default: `256`
    pub connection_buffer: usize,

    /// Allowed browser origin for CORS.
    /// Env: `CORS_ORIGIN`
    /// Default: unset (any origin).
    pub cors_origin: Option<String>,
}

// Keys stay out of the logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("auth_server_pubkey", &hex::encode(self.auth_server_pubkey))
            .field("message_master_key", &"<redacted>")
            .field("delete_for_all_window_secs", &self.delete_for_all_window_secs)
            .field("connection_buffer", &self.connection_buffer)
            .field("cors_origin", &self.cors_origin)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./huddle.db"),
            auth_server_pubkey: [0u8; 32],
            message_master_key: [0u8; SYMMETRIC_KEY_SIZE],
            delete_for_all_window_secs: DELETE_FOR_ALL_WINDOW_SECS,
            connection_buffer: DEFAULT_CONNECTION_BUFFER,
            cors_origin: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(hex_key) = var("AUTH_SERVER_PUBKEY") {
            match parse_hex_32(&hex_key) {
                Ok(key) => config.auth_server_pubkey = key,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid AUTH_SERVER_PUBKEY, no token will verify");
                }
            }
        }

        match var("MESSAGE_MASTER_KEY").map(|hex_key| parse_hex_32(&hex_key)) {
            Some(Ok(key)) => config.message_master_key = key,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Invalid MESSAGE_MASTER_KEY, using all-zero key (dev-only)");
            }
            None => {
                tracing::warn!("MESSAGE_MASTER_KEY not set, using all-zero key (dev-only)");
            }
        }

        if let Some(val) = var("DELETE_FOR_ALL_WINDOW_SECS") {
            match val.parse::<i64>() {
                Ok(secs) if secs >= 0 => config.delete_for_all_window_secs = secs,
                _ => tracing::warn!(value = %val, "Invalid DELETE_FOR_ALL_WINDOW_SECS, using default"),
            }
        }

        if let Some(val) = var("CONNECTION_BUFFER") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.connection_buffer = n,
                _ => tracing::warn!(value = %val, "Invalid CONNECTION_BUFFER, using default"),
            }
        }

        if let Some(origin) = var("CORS_ORIGIN") {
            if !origin.is_empty() {
                config.cors_origin = Some(origin);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

/// Parse a 64-character hex string into a 32-byte array.
fn parse_hex_32(hex: &str) -> Result<[u8; 32], String> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex.len()));
    }

    let bytes = hex::decode(hex).map_err(|e| format!("invalid hex: {e}"))?;
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}
