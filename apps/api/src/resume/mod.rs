//! AI-assisted resume generation and ingest.
//!
//! Generation: collect the view payload, prompt the configured provider for
//! Markdown, convert it to PDF or DOCX through pandoc, and attach the result
//! to an export row. The provider call and conversion together run under a
//! hard deadline; every failure path lands the export in `failed` with a
//! user-facing message.

pub mod convert;
pub mod extract;
pub mod handlers;
pub mod parse;
pub mod prompt;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::errors::AppError;
use crate::providers;
use crate::state::{AppState, PROVIDER_TIMEOUT};
use crate::store::{Filter, Record, RecordStore, StoreView};
use crate::views::sections;

pub const EXPORTS_COLLECTION: &str = "resume_exports";
pub const IMPORTS_COLLECTION: &str = "resume_imports";

/// Budget for the provider call plus document conversion combined.
pub const PIPELINE_DEADLINE: Duration = Duration::from_secs(120);

/// Completed exports are kept this long before the garbage collector
/// removes them and their files.
const EXPORT_RETENTION_DAYS: i64 = 7;

pub struct GenerateOutcome {
    pub export_id: String,
    pub file_name: String,
    pub download_url: String,
}

pub(crate) async fn pick_provider(store: &StoreView, provider_id: &str) -> Result<Record, AppError> {
    let provider = if provider_id.is_empty() {
        store
            .find_first(providers::COLLECTION, Filter::new().eq("is_active", true))
            .await?
    } else {
        store.get(providers::COLLECTION, provider_id).await?
    };
    let provider = provider
        .ok_or_else(|| AppError::Unavailable("no AI provider is configured".into()))?;
    if !provider.get_bool("is_active") {
        return Err(AppError::Unavailable("the AI provider is disabled".into()));
    }
    Ok(provider)
}

async fn mark_failed(store: &StoreView, export_id: &str, message: &str) {
    let result = async {
        let Some(mut export) = store.get(EXPORTS_COLLECTION, export_id).await? else {
            return Ok(());
        };
        export.set("status", "failed");
        export.set("error_message", message);
        store.update(&export).await
    }
    .await;
    if let Err(e) = result {
        error!(export_id, "Failed to record export failure: {e}");
    }
}

/// Runs the full generation pipeline for one already access-checked view.
pub async fn generate(
    state: &AppState,
    store: &StoreView,
    view: &Record,
    provider_id: &str,
    format: convert::Format,
    config: &prompt::GenerationConfig,
) -> Result<GenerateOutcome, AppError> {
    if !convert::pandoc_available() {
        return Err(AppError::Unavailable(
            "document processor is not installed".into(),
        ));
    }
    let provider = pick_provider(store, provider_id).await?;

    let export = store
        .insert(
            EXPORTS_COLLECTION,
            json!({
                "view_id": view.id,
                "format": format.extension(),
                "status": "processing",
                "provider_id": provider.id,
                "generation_config": config.to_value(),
                "file": "",
                "error_message": "",
                "generated_at": "",
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        )
        .await?;

    let pipeline = run_pipeline(state, store, view, &provider, format, config);
    let bytes = match tokio::time::timeout(PIPELINE_DEADLINE, pipeline).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            mark_failed(store, &export.id, &e.to_string()).await;
            return Err(e);
        }
        Err(_) => {
            mark_failed(store, &export.id, "canceled").await;
            return Err(AppError::processing(
                "Resume generation timed out.",
                "Try again with a faster provider.",
            ));
        }
    };

    let file_name = format!("resume.{}", format.extension());
    files_save(state, &export.id, &file_name, &bytes).await?;

    let mut export = store
        .get(EXPORTS_COLLECTION, &export.id)
        .await?
        .ok_or_else(|| AppError::Store("export row vanished".into()))?;
    export.set("status", "completed");
    export.set("file", file_name.clone());
    export.set_now("generated_at");
    store.update(&export).await?;

    info!(export_id = %export.id, view_id = %view.id, "Resume export completed");
    Ok(GenerateOutcome {
        download_url: format!("/api/files/{EXPORTS_COLLECTION}/{}/{file_name}", export.id),
        export_id: export.id,
        file_name,
    })
}

async fn files_save(
    state: &AppState,
    export_id: &str,
    file_name: &str,
    bytes: &[u8],
) -> Result<(), AppError> {
    crate::files::save(
        &state.storage_root(),
        EXPORTS_COLLECTION,
        export_id,
        file_name,
        bytes,
    )
    .await?;
    Ok(())
}

async fn run_pipeline(
    state: &AppState,
    store: &StoreView,
    view: &Record,
    provider: &Record,
    format: convert::Format,
    config: &prompt::GenerationConfig,
) -> Result<Vec<u8>, AppError> {
    let configs = sections::parse_sections(view.data.get("sections"));
    let assembled = sections::assemble(store, &configs).await?;

    let mut pairs = Vec::new();
    for value in assembled {
        let name = value
            .get("section_name")
            .and_then(Value::as_str)
            .unwrap_or("");
        if let Some(cfg) = configs.iter().find(|c| c.section_name == name) {
            let items = value
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            pairs.push((cfg.clone(), items));
        }
    }

    let profile = store
        .find_first("profile", Filter::new())
        .await?
        .map(|r| sections::serialize_record(&r, None, &[]));

    let envelope = json!({
        "hero_headline": view.get_str("hero_headline"),
        "hero_summary": view.get_str("hero_summary"),
    });
    let prompt_text =
        prompt::build_generation_prompt(profile.as_ref(), &envelope, &pairs, config);

    let markdown = providers::call(
        &state.http,
        &state.vault,
        provider,
        &prompt_text,
        PROVIDER_TIMEOUT,
    )
    .await?;
    let markdown = parse::strip_code_fences(&markdown).to_string();
    if markdown.is_empty() {
        return Err(AppError::processing(
            "The AI returned an empty resume.",
            "Try again or use a different provider.",
        ));
    }

    Ok(convert::markdown_to_document(&markdown, format).await?)
}

/// Hourly garbage collector for stale export rows and their files. Operates
/// on the live namespace only.
pub fn spawn_export_gc(
    store: Arc<dyn RecordStore>,
    storage_root: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let store = StoreView::new(store, false);
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = collect_stale_exports(&store, &storage_root).await {
                warn!("Export GC pass failed: {e}");
            }
        }
    })
}

async fn collect_stale_exports(
    store: &StoreView,
    storage_root: &std::path::Path,
) -> Result<(), AppError> {
    let cutoff = Utc::now() - ChronoDuration::days(EXPORT_RETENTION_DAYS);
    let exports = store.list(EXPORTS_COLLECTION, &Filter::new()).await?;
    for export in exports {
        if export.created >= cutoff {
            continue;
        }
        crate::files::remove_record_files(storage_root, EXPORTS_COLLECTION, &export.id).await;
        if let Err(e) = store.delete(EXPORTS_COLLECTION, &export.id).await {
            warn!(export_id = %export.id, "Export GC delete failed: {e}");
        } else {
            info!(export_id = %export.id, "Export GC removed stale export");
        }
    }
    Ok(())
}
