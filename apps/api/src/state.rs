use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;

use crate::config::Config;
use crate::ratelimit::{HourlyWindow, RateLimiter};
use crate::store::{RecordStore, StoreView};
use crate::vault::Vault;

/// Outbound-call budget for AI providers.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub vault: Arc<Vault>,
    pub limiter: Arc<RateLimiter>,
    /// Separate hourly budget for unauthenticated resume generation.
    pub generate_window: Arc<HourlyWindow>,
    pub http: reqwest::Client,
    pub config: Config,
}

impl AppState {
    /// Selects the live or demo record namespace for this request.
    pub fn view_for(&self, headers: &HeaderMap) -> StoreView {
        let demo = headers
            .get("x-demo-mode")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        StoreView::new(self.store.clone(), demo)
    }

    /// Root of the on-disk upload/export tree.
    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(&self.config.data_dir).join("storage")
    }
}
