//! SQLite-backed record store.
//!
//! Records live in a single `records` table keyed by (collection, id) with
//! the field payload stored as a JSON text column. Filtering happens in
//! process after narrowing to the collection; the collections this service
//! manages are small, single-owner datasets.

use super::{Filter, Record, RecordStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<Record, StoreError> {
    let data: String = row.get("data");
    let data: Map<String, Value> = serde_json::from_str(&data)
        .map_err(|e| StoreError::Backend(format!("corrupt record payload: {e}")))?;
    let created: String = row.get("created");
    let updated: String = row.get("updated");
    Ok(Record {
        id: row.get("id"),
        collection: row.get("collection"),
        data,
        created: parse_ts(&created)?,
        updated: parse_ts(&updated)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("corrupt record timestamp: {e}")))
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn list(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query("SELECT collection, id, data, created, updated FROM records WHERE collection = ?")
            .bind(collection)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut matched = Vec::new();
        for row in &rows {
            let record = row_to_record(row)?;
            if filter.matches(&record) {
                matched.push(record);
            }
        }
        Ok(filter.finish(matched))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query("SELECT collection, id, data, created, updated FROM records WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn insert(
        &self,
        collection: &str,
        data: Map<String, Value>,
    ) -> Result<Record, StoreError> {
        let record = Record::new(collection, data);
        let payload = serde_json::to_string(&record.data)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query("INSERT INTO records (collection, id, data, created, updated) VALUES (?, ?, ?, ?, ?)")
            .bind(&record.collection)
            .bind(&record.id)
            .bind(payload)
            .bind(record.created.to_rfc3339())
            .bind(record.updated.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(record)
    }

    async fn update(&self, record: &Record) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&record.data)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let result = sqlx::query("UPDATE records SET data = ?, updated = ? WHERE collection = ? AND id = ?")
            .bind(payload)
            .bind(Utc::now().to_rfc3339())
            .bind(&record.collection)
            .bind(&record.id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
