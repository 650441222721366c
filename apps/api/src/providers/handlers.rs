use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{ProviderKind, COLLECTION, KEY_UNCHANGED_SENTINEL};
use crate::auth::Owner;
use crate::errors::AppError;
use crate::resume::convert;
use crate::state::{AppState, PROVIDER_TIMEOUT};
use crate::store::{Filter, Record, StoreView};

#[derive(Debug, Deserialize)]
pub struct ProviderRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Serialization for owner responses. The encrypted key never leaves the
/// server; its presence is reported as the sentinel.
fn serialize_provider(record: &Record) -> Value {
    let mut out = Map::new();
    out.insert("id".into(), Value::String(record.id.clone()));
    for (key, value) in &record.data {
        if key == "api_key_encrypted" {
            continue;
        }
        out.insert(key.clone(), value.clone());
    }
    let has_key = !record.get_str("api_key_encrypted").is_empty();
    out.insert(
        "api_key".into(),
        if has_key {
            Value::String(KEY_UNCHANGED_SENTINEL.into())
        } else {
            Value::String(String::new())
        },
    );
    Value::Object(out)
}

/// POST /api/providers
pub async fn create(
    State(state): State<AppState>,
    _owner: Owner,
    headers: HeaderMap,
    Json(req): Json<ProviderRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    ProviderKind::parse(&req.kind)?;

    let plaintext = req.api_key.unwrap_or_default();
    if plaintext == KEY_UNCHANGED_SENTINEL {
        return Err(AppError::Validation("api_key must be a real key".into()));
    }
    let encrypted = state.vault.encrypt(&plaintext)?;

    let data = json!({
        "type": req.kind,
        "api_key_encrypted": encrypted,
        "base_url": req.base_url.unwrap_or_default(),
        "model": req.model.unwrap_or_default(),
        "is_active": req.is_active.unwrap_or(true),
        "test_status": "",
        "last_test": "",
    });
    let Value::Object(data) = data else {
        return Err(AppError::Internal(anyhow::anyhow!("provider payload not an object")));
    };

    let store = state.view_for(&headers);
    let record = store.insert(COLLECTION, data).await?;
    info!(provider_id = %record.id, kind = %req.kind, "AI provider created");
    Ok((StatusCode::CREATED, Json(serialize_provider(&record))))
}

#[derive(Debug, Deserialize)]
pub struct ProviderPatch {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub is_active: Option<bool>,
}

/// PATCH /api/providers/{id}
pub async fn update(
    State(state): State<AppState>,
    _owner: Owner,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ProviderPatch>,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    let Some(mut record) = store.get(COLLECTION, &id).await? else {
        return Err(AppError::NotFound("provider not found".into()));
    };

    if let Some(kind) = req.kind {
        ProviderKind::parse(&kind)?;
        record.set("type", kind);
    }
    if let Some(base_url) = req.base_url {
        record.set("base_url", base_url);
    }
    if let Some(model) = req.model {
        record.set("model", model);
    }
    if let Some(is_active) = req.is_active {
        record.set("is_active", is_active);
    }
    // The sentinel means "keep the stored key"; anything else replaces it.
    if let Some(api_key) = req.api_key {
        if api_key != KEY_UNCHANGED_SENTINEL {
            record.set("api_key_encrypted", state.vault.encrypt(&api_key)?);
        }
    }

    store.update(&record).await?;
    info!(provider_id = %record.id, "AI provider updated");
    Ok(Json(serialize_provider(&record)))
}

/// POST /api/ai/test/{id}
///
/// Sends a fixed probe prompt through the adapter and persists the outcome
/// on the provider record.
pub async fn test_connection(
    State(state): State<AppState>,
    _owner: Owner,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    let Some(mut record) = store.get(COLLECTION, &id).await? else {
        return Err(AppError::NotFound("provider not found".into()));
    };

    let outcome = super::call(
        &state.http,
        &state.vault,
        &record,
        "Respond with exactly: OK",
        PROVIDER_TIMEOUT,
    )
    .await;

    let success = outcome.is_ok();
    record.set("test_status", if success { "success" } else { "error" });
    record.set_now("last_test");
    store.update(&record).await?;

    match outcome {
        Ok(content) => Ok(Json(json!({"success": true, "response": content}))),
        Err(e) => {
            warn!(provider_id = %id, "Provider test failed: {e}");
            Ok(Json(json!({"success": false, "error": e.to_string()})))
        }
    }
}

/// GET /api/ai/status, a public probe: is any active provider configured?
pub async fn ai_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    let configured = has_active_provider(&store).await?;
    Ok(Json(json!({"configured": configured})))
}

/// GET /api/ai-print/status, a public probe for the document pipeline.
pub async fn print_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    Ok(Json(json!({
        "available": convert::pandoc_available(),
        "pdf_engine": convert::preferred_pdf_engine(),
        "configured": has_active_provider(&store).await?,
    })))
}

async fn has_active_provider(store: &StoreView) -> Result<bool, AppError> {
    Ok(store
        .find_first(COLLECTION, Filter::new().eq("is_active", true))
        .await?
        .is_some())
}
