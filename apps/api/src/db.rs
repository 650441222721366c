use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Opens the embedded SQLite database and ensures the records table exists.
pub async fn create_pool(data_dir: &str) -> Result<SqlitePool> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = Path::new(data_dir).join("vitrine.db");
    info!("Opening SQLite database at {}", db_path.display());

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS records (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            created TEXT NOT NULL,
            updated TEXT NOT NULL,
            PRIMARY KEY (collection, id)
        )",
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_collection ON records (collection)")
        .execute(&pool)
        .await?;

    info!("SQLite connection pool established");
    Ok(pool)
}
