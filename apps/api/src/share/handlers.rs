use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::Owner;
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub view_id: String,
    pub name: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<i64>,
}

/// POST /api/share/generate
pub async fn generate(
    State(state): State<AppState>,
    _owner: Owner,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    let issued = super::issue(
        &store,
        &state.vault,
        &req.view_id,
        req.name,
        req.expires_at,
        req.max_uses,
    )
    .await?;

    info!(token_id = %issued.id, "Share token issued");

    let share_url = state
        .config
        .public_base_url()
        .map(|base| format!("{base}/s/{}", issued.token));

    Ok(Json(json!({
        "id": issued.id,
        "token": issued.token,
        "name": issued.name,
        "share_url": share_url,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    #[serde(default)]
    pub token: String,
}

/// POST /api/share/validate
///
/// Always 200. Unknown, expired, exhausted, and revoked tokens all produce
/// the identical invalid body.
pub async fn validate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    match super::validate(&store, &state.vault, &req.token).await? {
        Some(valid) => Ok(Json(json!({
            "valid": true,
            "view_id": valid.view_id,
            "view_slug": valid.view_slug,
        }))),
        None => Ok(Json(json!({"valid": false, "error": "invalid token"}))),
    }
}

/// POST /api/share/revoke/{id}
pub async fn revoke(
    State(state): State<AppState>,
    _owner: Owner,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    super::revoke(&store, &id).await?;
    info!(token_id = %id, "Share token revoked");
    Ok(Json(json!({"revoked": true})))
}
