use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
///
/// Unauthorized access to a non-public view is reported as `NotFound` by the
/// callers, never as a dedicated variant: existence must not leak through the
/// status code.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::vault::CryptoError),

    #[error("Provider error (status {status}): {message}")]
    Provider {
        status: u16,
        message: String,
        user_action: Option<String>,
    },

    #[error("Processing error: {message}")]
    Processing {
        message: String,
        user_action: Option<String>,
    },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Neutral not-found error used for every unresolved or unauthorized view
    /// lookup, so that the body is byte-identical to the unknown-slug case.
    pub fn view_not_found() -> Self {
        AppError::NotFound("view not found".to_string())
    }

    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        AppError::Provider {
            status,
            message: message.into(),
            user_action: None,
        }
    }

    pub fn processing(message: impl Into<String>, user_action: impl Into<String>) -> Self {
        AppError::Processing {
            message: message.into(),
            user_action: Some(user_action.into()),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        // The record-store collaborator's error taxonomy is never exposed.
        AppError::Store(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "authentication required" }),
            ),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({ "error": msg })),
            AppError::RateLimited { retry_after } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({ "error": "too many requests" })),
                )
                    .into_response();
                if let Ok(value) = retry_after.to_string().parse() {
                    response.headers_mut().insert("Retry-After", value);
                }
                return response;
            }
            AppError::Crypto(e) => {
                tracing::error!("Crypto error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "an internal error occurred" }),
                )
            }
            AppError::Provider {
                status,
                message,
                user_action,
            } => {
                tracing::error!("Provider error (status {status}): {message}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error": message,
                        "action": user_action,
                    }),
                )
            }
            AppError::Processing {
                message,
                user_action,
            } => {
                tracing::error!("Processing error: {message}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error": message,
                        "action": user_action,
                    }),
                )
            }
            AppError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": msg }))
            }
            AppError::Store(e) => {
                tracing::error!("Record store error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "a storage error occurred" }),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "an internal server error occurred" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
