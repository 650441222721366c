//! On-disk file storage for generated exports and uploads.
//!
//! Files live under `{data_dir}/storage/{collection}/{record_id}/{name}`.
//! Record ids are server-generated UUIDs, so the path is unguessable.

use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::AppError;
use crate::state::AppState;

/// Rejects path components that could escape the storage tree.
fn sanitize_component(component: &str) -> Result<&str, AppError> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(AppError::Validation("invalid file path".into()));
    }
    Ok(component)
}

fn record_dir(root: &Path, collection: &str, record_id: &str) -> Result<PathBuf, AppError> {
    Ok(root
        .join(sanitize_component(collection)?)
        .join(sanitize_component(record_id)?))
}

pub async fn save(
    root: &Path,
    collection: &str,
    record_id: &str,
    name: &str,
    bytes: &[u8],
) -> Result<PathBuf, AppError> {
    let dir = record_dir(root, collection, record_id)?;
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
    let path = dir.join(sanitize_component(name)?);
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
    Ok(path)
}

/// Removes every file stored for one record. A missing directory is not an
/// error; deletion must be idempotent.
pub async fn remove_record_files(root: &Path, collection: &str, record_id: &str) {
    let Ok(dir) = record_dir(root, collection, record_id) else {
        return;
    };
    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove stored files at {}: {e}", dir.display());
        }
    }
}

/// GET /api/files/{collection}/{record}/{name}
pub async fn serve(
    State(state): State<AppState>,
    AxumPath((collection, record_id, name)): AxumPath<(String, String, String)>,
) -> Result<Response, AppError> {
    let root = state.storage_root();
    let path = record_dir(&root, &collection, &record_id)?.join(sanitize_component(&name)?);

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound("file not found".into()));
        }
        Err(e) => return Err(AppError::Internal(e.into())),
    };

    let content_type = mime_guess::from_path(&name)
        .first_or_octet_stream()
        .to_string();
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}
