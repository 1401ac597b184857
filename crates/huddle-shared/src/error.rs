use thiserror::Error;

/// Every failure the chat engine surfaces to a caller.
///
/// Authorization and validation variants carry a caller-safe message that is
/// returned verbatim. `Internal` carries diagnostic detail that must only be
/// logged, never shown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Rate limit exceeded: at most {limit} messages per minute")]
    RateLimited { limit: u32 },

    #[error("{0}")]
    Expired(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    Expired,
    Internal,
}

impl ErrorKind {
    /// HTTP status carrying this kind. `Expired` is Forbidden-class.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden | ErrorKind::Expired => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::RateLimited => 429,
            ErrorKind::Internal => 500,
        }
    }
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ChatError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            ChatError::Forbidden(_) => ErrorKind::Forbidden,
            ChatError::NotFound(_) => ErrorKind::NotFound,
            ChatError::Conflict(_) => ErrorKind::Conflict,
            ChatError::RateLimited { .. } => ErrorKind::RateLimited,
            ChatError::Expired(_) => ErrorKind::Expired,
            ChatError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to hand back to the caller.
    pub fn public_message(&self) -> String {
        match self {
            ChatError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ChatError::Forbidden(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        ChatError::InvalidRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ChatError::NotFound(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Plaintext is not valid UTF-8")]
    InvalidUtf8,
}

impl From<CryptoError> for ChatError {
    fn from(err: CryptoError) -> Self {
        ChatError::Internal(err.to_string())
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
