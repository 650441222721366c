use anyhow::{Context, Result};
use tracing::warn;

/// Dev fallback for `ENCRYPTION_KEY`. Only ever used when the variable is
/// missing; `using_dev_key` is set so startup can log a warning once the
/// subscriber is installed.
const DEV_ENCRYPTION_KEY: &str = "dev-only-insecure-encryption-key";

/// Application configuration loaded from environment variables once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Process-wide secret the vault derives its keys from.
    pub encryption_key: String,
    /// True when `ENCRYPTION_KEY` was absent and the dev fallback is in use.
    pub using_dev_key: bool,
    /// Comma-separated email allowlist for owner login.
    pub admin_emails: Vec<String>,
    /// bcrypt hash of the owner password.
    pub admin_password_hash: Option<String>,
    /// If true, trust CF-Connecting-IP / X-Real-IP / X-Forwarded-For.
    pub trust_proxy: bool,
    pub app_url: Option<String>,
    pub public_app_url: Option<String>,
    /// Seed demo content on first run.
    pub seed_data: bool,
    /// Data directory holding the record store and the storage/ file tree.
    pub data_dir: String,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let (encryption_key, using_dev_key) = match std::env::var("ENCRYPTION_KEY") {
            Ok(key) if !key.is_empty() => (key, false),
            _ => (DEV_ENCRYPTION_KEY.to_string(), true),
        };

        let admin_emails = std::env::var("ADMIN_EMAILS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            encryption_key,
            using_dev_key,
            admin_emails,
            admin_password_hash: std::env::var("ADMIN_PASSWORD_HASH").ok().filter(|s| !s.is_empty()),
            trust_proxy: std::env::var("TRUST_PROXY").as_deref() == Ok("true"),
            app_url: std::env::var("APP_URL").ok().filter(|s| !s.is_empty()),
            public_app_url: std::env::var("PUBLIC_APP_URL").ok().filter(|s| !s.is_empty()),
            seed_data: std::env::var("SEED_DATA").as_deref() == Ok("true"),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Canonical public origin for building share URLs, without a trailing
    /// slash.
    pub fn public_base_url(&self) -> Option<String> {
        self.public_app_url
            .as_deref()
            .or(self.app_url.as_deref())
            .map(|u| u.trim_end_matches('/').to_string())
    }

    /// Logs whether the configured canonical URLs use HTTPS. Informational
    /// only; requests are never blocked.
    pub fn check_https(&self) {
        let is_dev = self.app_url.is_none()
            || self.app_url.as_deref() == Some("http://localhost:8080")
            || std::env::var("DEV_MODE").as_deref() == Ok("true");
        if is_dev {
            tracing::info!("Running in development mode, HTTPS check skipped");
            return;
        }

        let uses_https = [&self.app_url, &self.public_app_url]
            .iter()
            .any(|u| u.as_deref().is_some_and(|u| u.starts_with("https://")));

        if uses_https {
            tracing::info!("HTTPS detected, connection security: OK");
        } else {
            warn!("APP_URL or PUBLIC_APP_URL should start with https:// in production");
        }
    }
}
