//! In-memory record store used by tests and demo seeding.

use super::{Filter, Record, RecordStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        let matched = collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| filter.matches(r))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(filter.finish(matched))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        Ok(collections
            .get(collection)
            .and_then(|records| records.iter().find(|r| r.id == id))
            .cloned())
    }

    async fn insert(
        &self,
        collection: &str,
        data: Map<String, Value>,
    ) -> Result<Record, StoreError> {
        let record = Record::new(collection, data);
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        collections
            .entry(collection.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn update(&self, record: &Record) -> Result<(), StoreError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        let records = collections
            .get_mut(&record.collection)
            .ok_or(StoreError::NotFound)?;
        let stored = records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(StoreError::NotFound)?;
        stored.data = record.data.clone();
        stored.updated = Utc::now();
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        let records = collections.get_mut(collection).ok_or(StoreError::NotFound)?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_get_update_delete() {
        let store = MemoryStore::new();
        let mut record = store
            .insert("views", fields(json!({"slug": "main", "is_default": false})))
            .await
            .unwrap();

        let fetched = store.get("views", &record.id).await.unwrap().unwrap();
        assert_eq!(fetched.get_str("slug"), "main");

        record.set("is_default", true);
        store.update(&record).await.unwrap();
        let fetched = store.get("views", &record.id).await.unwrap().unwrap();
        assert!(fetched.get_bool("is_default"));

        store.delete("views", &record.id).await.unwrap();
        assert!(store.get("views", &record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_record_is_not_found() {
        let store = MemoryStore::new();
        let record = Record::new("views", Map::new());
        assert!(matches!(
            store.update(&record).await,
            Err(StoreError::NotFound)
        ));
    }
}
