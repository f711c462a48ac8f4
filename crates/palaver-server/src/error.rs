use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use palaver_store::StoreError;

use crate::auth::AuthError;

/// Failure taxonomy shared by the REST surface and the WebSocket event
/// handlers. Validation, not-found and forbidden failures happen before any
/// side effect; storage failures on the primary write surface to the
/// caller.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Map a store-level `NotFound` to a user-facing 404 for `what`, leaving
/// other storage failures untouched.
pub fn or_not_found(what: &'static str) -> impl Fn(StoreError) -> ServerError {
    move |err| match err {
        StoreError::NotFound => ServerError::NotFound(format!("{what} not found")),
        other => ServerError::Storage(other),
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Auth(AuthError::ServiceUnavailable) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            ServerError::Auth(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Storage(StoreError::NotFound) => {
                (StatusCode::NOT_FOUND, "Record not found".to_string())
            }
            ServerError::Storage(_) | ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "success": false,
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
