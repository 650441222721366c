//! Owner authentication.
//!
//! The owner signs in with an allowlisted email and the configured password
//! hash, receiving a short-lived session token. Owner-only endpoints require
//! that token via the [`Owner`] extractor.

use async_trait::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::AppError;
use crate::state::AppState;

const SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// POST /api/auth/login
///
/// Failures are uniform 401s: the response never distinguishes an unknown
/// email from a wrong password.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let email = req.email.trim().to_lowercase();

    let allowed = state.config.admin_emails.iter().any(|e| e == &email);
    let hash = state.config.admin_password_hash.as_deref().unwrap_or("");
    if !allowed || hash.is_empty() || !state.vault.check_password(&req.password, hash) {
        warn!("Rejected owner login attempt");
        return Err(AppError::Unauthorized);
    }

    let (token, expires_at) = state
        .vault
        .issue_owner_jwt(&email, Duration::hours(SESSION_TTL_HOURS))?;
    info!(%email, "Owner logged in");
    Ok(Json(LoginResponse { token, expires_at }))
}

/// Extracts and validates the owner session token from the Authorization
/// header. Rejects with 401 when missing or invalid.
pub struct Owner {
    pub email: String,
}

#[async_trait]
impl FromRequestParts<AppState> for Owner {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let token = bearer_token(&parts.headers).ok_or(AppError::Unauthorized)?;
        let email = state
            .vault
            .validate_owner_jwt(token)
            .ok_or(AppError::Unauthorized)?;
        Ok(Owner { email })
    }
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert(AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }
}
