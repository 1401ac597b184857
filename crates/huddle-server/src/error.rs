use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use huddle_shared::{ChatError, ErrorKind};

/// A [`ChatError`] on its way out of an HTTP handler.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl From<huddle_store::StoreError> for ApiError {
    fn from(err: huddle_store::StoreError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        if kind == ErrorKind::Internal {
            tracing::error!(error = %self.0, "Request failed");
        }

        let status = StatusCode::from_u16(kind.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.0.public_message(),
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
