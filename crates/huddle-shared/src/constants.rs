/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Algorithm label recorded in the metadata of every sealed message
pub const MESSAGE_CIPHER: &str = "xchacha20poly1305";

/// Key version written by the current gateway
pub const MESSAGE_KEY_VERSION: u32 = 1;

/// Key derivation context (BLAKE3) for per-chat message keys
pub const KDF_CONTEXT_CHAT_KEY: &str = "huddle-chat-key-v1";

/// How long after sending the sender may still delete a message for everyone
pub const DELETE_FOR_ALL_WINDOW_SECS: i64 = 10 * 60;

/// Trailing window over which `rateLimitPerMinute` is counted
pub const RATE_LIMIT_WINDOW_SECS: i64 = 60;

/// Maximum message length in characters
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Maximum number of attachments on a single message
pub const MAX_ATTACHMENTS: usize = 10;

/// Maximum group title length in characters
pub const MAX_TITLE_CHARS: usize = 120;

/// Maximum reaction emoji size in bytes
pub const MAX_EMOJI_BYTES: usize = 32;

/// Cookie carrying the bearer token
pub const AUTH_COOKIE: &str = "access_token";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default capacity of a connection's outbound event queue
pub const DEFAULT_CONNECTION_BUFFER: usize = 256;
