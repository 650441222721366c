mod auth;
mod config;
mod db;
mod errors;
mod files;
mod providers;
mod ratelimit;
mod resume;
mod routes;
mod share;
mod state;
mod store;
mod vault;
mod views;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::create_pool;
use crate::ratelimit::{HourlyWindow, RateLimiter};
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::sqlite::SqliteStore;
use crate::store::{Filter, RecordStore, StoreView};
use crate::vault::Vault;

/// Hourly cap on unauthenticated resume generations per IP.
const GENERATE_PER_HOUR: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (panics on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Vitrine API v{}", env!("CARGO_PKG_VERSION"));
    if config.using_dev_key {
        tracing::warn!("ENCRYPTION_KEY is not set; using an insecure development key");
    }
    config.check_https();

    let pool = create_pool(&config.data_dir).await?;
    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::new(pool));

    let vault = Arc::new(Vault::new(&config.encryption_key));
    let limiter = Arc::new(RateLimiter::new());

    let http = reqwest::Client::builder()
        .timeout(state::PROVIDER_TIMEOUT)
        .build()?;

    if config.seed_data {
        seed_demo_content(&store).await?;
    }

    let generate_window = Arc::new(HourlyWindow::new(GENERATE_PER_HOUR));
    let state = AppState {
        store: store.clone(),
        vault,
        limiter: limiter.clone(),
        generate_window: generate_window.clone(),
        http,
        config: config.clone(),
    };

    ratelimit::spawn_sweeper(limiter, generate_window);
    resume::spawn_export_gc(store, state.storage_root());

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: tighten CORS in production

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// First-run demo seeding: a single public default view so the site renders
/// before the owner configures anything.
async fn seed_demo_content(store: &Arc<dyn RecordStore>) -> Result<()> {
    let live = StoreView::new(store.clone(), false);
    if !live.list(views::COLLECTION, &Filter::new()).await?.is_empty() {
        return Ok(());
    }

    let data = serde_json::json!({
        "slug": "portfolio",
        "name": "Portfolio",
        "visibility": "public",
        "is_active": true,
        "is_default": true,
        "view_count": 0,
        "hero_headline": "Welcome",
        "sections": [
            {"section_name": "experience", "enabled": true},
            {"section_name": "projects", "enabled": true},
            {"section_name": "skills", "enabled": true},
        ],
    });
    if let Some(data) = data.as_object() {
        live.insert(views::COLLECTION, data.clone()).await?;
        info!("Seeded default view 'portfolio'");
    }
    Ok(())
}
