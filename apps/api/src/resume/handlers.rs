use axum::extract::{ConnectInfo, Multipart, Path, State};
use axum::http::HeaderMap;
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::{info, warn};

use super::{convert, extract, parse, prompt, EXPORTS_COLLECTION, IMPORTS_COLLECTION};
use crate::auth::{bearer_token, Owner};
use crate::errors::AppError;
use crate::providers;
use crate::ratelimit::client_ip;
use crate::state::{AppState, PROVIDER_TIMEOUT};
use crate::store::{Filter, StoreView};
use crate::views;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub format: String,
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub target_role: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub length: Option<String>,
    #[serde(default)]
    pub emphasis: Option<String>,
}

/// POST /api/view/{slug}/generate
pub async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(slug): Path<String>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    let Some(view) = views::find_active_by_slug(&store, &slug).await? else {
        return Err(AppError::view_not_found());
    };

    let is_owner = bearer_token(&headers)
        .and_then(|t| state.vault.validate_owner_jwt(t))
        .is_some();

    if !is_owner {
        let visibility = views::view_visibility(&view);
        if !matches!(
            visibility,
            views::Visibility::Public | views::Visibility::Unlisted
        ) {
            return Err(AppError::Forbidden(
                "resume generation is not available for this view".into(),
            ));
        }

        let transport = connect_info.map(|ci| ci.0);
        let ip = client_ip(&headers, transport.as_ref(), state.config.trust_proxy);
        if !state.generate_window.allow(&ip) {
            warn!(%ip, "Hourly resume generation budget exhausted");
            return Err(AppError::RateLimited { retry_after: 3600 });
        }
    }

    let format = convert::Format::parse(&req.format)?;
    let config = prompt::GenerationConfig {
        target_role: req.target_role,
        style: req.style.unwrap_or_else(|| "chronological".to_string()),
        length: req.length.unwrap_or_else(|| "two-page".to_string()),
        emphasis: req.emphasis,
    };

    let outcome = super::generate(&state, &store, &view, &req.provider_id, format, &config).await?;
    Ok(Json(json!({
        "export_id": outcome.export_id,
        "status": "completed",
        "file": outcome.file_name,
        "download_url": outcome.download_url,
    })))
}

/// GET /api/view/{slug}/exports
pub async fn list_exports(
    State(state): State<AppState>,
    _owner: Owner,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    let Some(view) = store
        .find_first(views::COLLECTION, Filter::new().eq("slug", slug))
        .await?
    else {
        return Err(AppError::NotFound("view not found".into()));
    };

    let exports = store
        .list(
            EXPORTS_COLLECTION,
            &Filter::new().eq("view_id", view.id.as_str()).sort_desc("created"),
        )
        .await?;

    let rows: Vec<Value> = exports
        .iter()
        .map(|e| {
            let file = e.get_str("file");
            let download_url = if e.get_str("status") == "completed" && !file.is_empty() {
                Some(format!("/api/files/{EXPORTS_COLLECTION}/{}/{file}", e.id))
            } else {
                None
            };
            json!({
                "id": e.id,
                "format": e.get_str("format"),
                "status": e.get_str("status"),
                "error_message": e.get_str("error_message"),
                "generated_at": e.get_str("generated_at"),
                "generation_config": e.data.get("generation_config"),
                "download_url": download_url,
                "created": e.created,
            })
        })
        .collect();

    Ok(Json(json!({"exports": rows})))
}

/// DELETE /api/view/{slug}/exports/{id}
pub async fn delete_export(
    State(state): State<AppState>,
    _owner: Owner,
    headers: HeaderMap,
    Path((slug, export_id)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    let Some(view) = store
        .find_first(views::COLLECTION, Filter::new().eq("slug", slug))
        .await?
    else {
        return Err(AppError::NotFound("view not found".into()));
    };
    let Some(export) = store.get(EXPORTS_COLLECTION, &export_id).await? else {
        return Err(AppError::NotFound("export not found".into()));
    };
    if export.get_str("view_id") != view.id {
        return Err(AppError::NotFound("export not found".into()));
    }

    crate::files::remove_record_files(&state.storage_root(), EXPORTS_COLLECTION, &export.id).await;
    store.delete(EXPORTS_COLLECTION, &export.id).await?;
    info!(export_id = %export.id, "Resume export deleted");
    Ok(Json(json!({"deleted": true})))
}

struct Upload {
    filename: String,
    bytes: Bytes,
    provider_id: String,
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, AppError> {
    let mut filename = String::new();
    let mut bytes = None;
    let mut provider_id = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or("") {
            "file" => {
                filename = field.file_name().unwrap_or("upload").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("failed to read upload: {e}")))?;
                if data.len() > extract::MAX_UPLOAD_BYTES {
                    return Err(AppError::Validation("file exceeds the 5 MiB limit".into()));
                }
                bytes = Some(data);
            }
            "provider_id" => {
                provider_id = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("failed to read provider_id: {e}")))?;
            }
            _ => {}
        }
    }

    let bytes = bytes.ok_or_else(|| AppError::Validation("missing file field".into()))?;
    Ok(Upload {
        filename,
        bytes,
        provider_id,
    })
}

async fn mark_import_failed(store: &StoreView, import_id: &str, message: &str) {
    let result = async {
        let Some(mut import) = store.get(IMPORTS_COLLECTION, import_id).await? else {
            return Ok(());
        };
        import.set("status", "failed");
        import.set("error_message", message);
        store.update(&import).await
    }
    .await;
    if let Err(e) = result {
        warn!(import_id, "Failed to record import failure: {e}");
    }
}

/// POST /api/resume/upload
///
/// Re-uploading identical bytes returns the existing import instead of
/// duplicating records.
pub async fn upload(
    State(state): State<AppState>,
    _owner: Owner,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let upload = read_upload(multipart).await?;
    let kind = extract::detect_kind(&upload.filename, &upload.bytes)?;
    let file_hash = parse::sha256_hex(&upload.bytes);

    let store = state.view_for(&headers);
    if let Some(existing) = store
        .find_first(
            IMPORTS_COLLECTION,
            Filter::new().eq("file_hash", file_hash.as_str()),
        )
        .await?
    {
        info!(import_id = %existing.id, "Duplicate resume upload deduped");
        return Ok(Json(json!({
            "deduped": true,
            "import_id": existing.id,
            "status": existing.get_str("status"),
            "counts": existing.data.get("counts"),
        })));
    }

    let text = extract::extract_text(kind, &upload.bytes)?;
    let provider = super::pick_provider(&store, &upload.provider_id).await?;

    let import = store
        .insert(
            IMPORTS_COLLECTION,
            json!({
                "file_hash": file_hash,
                "filename": upload.filename.clone(),
                "status": "processing",
                "error_message": "",
                "counts": {},
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        )
        .await?;

    let outcome = async {
        let response = providers::call(
            &state.http,
            &state.vault,
            &provider,
            &prompt::build_import_prompt(&text),
            PROVIDER_TIMEOUT,
        )
        .await?;
        let parsed = parse::parse_resume_json(&response)?;
        parse::import_parsed(&store, &parsed, &import.id, &upload.filename).await
    };

    let counts = match tokio::time::timeout(super::PIPELINE_DEADLINE, outcome).await {
        Ok(Ok(counts)) => counts,
        Ok(Err(e)) => {
            mark_import_failed(&store, &import.id, &e.to_string()).await;
            return Err(e);
        }
        Err(_) => {
            mark_import_failed(&store, &import.id, "canceled").await;
            return Err(AppError::processing(
                "Resume import timed out.",
                "Try again with a faster provider.",
            ));
        }
    };

    let mut import_row = store
        .get(IMPORTS_COLLECTION, &import.id)
        .await?
        .ok_or_else(|| AppError::Store("import row vanished".into()))?;
    import_row.set("status", "completed");
    import_row.set("counts", Value::Object(counts.inserted.clone()));
    import_row.set("duplicate_count", counts.duplicates as i64);
    store.update(&import_row).await?;

    info!(
        import_id = %import.id,
        total = counts.total,
        duplicates = counts.duplicates,
        "Resume import completed"
    );
    Ok(Json(json!({
        "deduped": false,
        "import_id": import.id,
        "status": "completed",
        "counts": counts.inserted,
        "duplicates": counts.duplicates,
    })))
}
