use huddle_shared::ChatError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the database directory failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found")]
    NotFound,

    #[error("migration failed: {0}")]
    Migration(String),

    /// A chat document or JSON column did not round-trip.
    #[error("malformed document: {0}")]
    Document(#[from] serde_json::Error),

    #[error("malformed id: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("timestamp out of range: {0} ms")]
    Timestamp(i64),
}

/// Store failures are never the caller's fault. The cause is logged here and
/// the caller only learns that something went wrong.
impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ChatError::NotFound("Record not found".into()),
            other => {
                tracing::error!(error = %other, "store operation failed");
                ChatError::Internal(other.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
