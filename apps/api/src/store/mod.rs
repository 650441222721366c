//! Record-store collaborator seam.
//!
//! The generic record/collection store is an external collaborator: its only
//! contract is "given a collection name and filter, return matching records;
//! given a record, persist it". Everything behind [`RecordStore`] is
//! replaceable; the embedded SQLite implementation in [`sqlite`] is the
//! production backing, [`memory`] backs tests and demo seeding.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for crate::errors::AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => crate::errors::AppError::NotFound("record not found".into()),
            StoreError::Backend(msg) => crate::errors::AppError::Store(msg),
        }
    }
}

/// One persisted record: an id plus a JSON object of fields.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: String,
    pub collection: String,
    pub data: Map<String, Value>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Record {
    pub fn new(collection: &str, data: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            collection: collection.to_string(),
            data,
            created: now,
            updated: now,
        }
    }

    pub fn get_str(&self, field: &str) -> &str {
        self.data.get(field).and_then(Value::as_str).unwrap_or("")
    }

    pub fn get_bool(&self, field: &str) -> bool {
        self.data.get(field).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_i64(&self, field: &str) -> i64 {
        self.data.get(field).and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn get_datetime(&self, field: &str) -> Option<DateTime<Utc>> {
        self.data
            .get(field)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.data.insert(field.to_string(), value.into());
    }

    pub fn set_now(&mut self, field: &str) {
        self.set(field, Value::String(Utc::now().to_rfc3339()));
    }
}

#[derive(Debug, Clone)]
enum Condition {
    Eq(String, Value),
    Ne(String, Value),
    /// Field is missing, null, or the empty string.
    Empty(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Asc,
    Desc,
}

/// Declarative record filter understood by every [`RecordStore`]
/// implementation. Field comparisons are exact JSON-value matches.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    conditions: Vec<Condition>,
    sort: Vec<(String, Direction)>,
    limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field.to_string(), value.into()));
        self
    }

    pub fn ne(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Ne(field.to_string(), value.into()));
        self
    }

    pub fn empty(mut self, field: &str) -> Self {
        self.conditions.push(Condition::Empty(field.to_string()));
        self
    }

    pub fn sort_asc(mut self, field: &str) -> Self {
        self.sort.push((field.to_string(), Direction::Asc));
        self
    }

    pub fn sort_desc(mut self, field: &str) -> Self {
        self.sort.push((field.to_string(), Direction::Desc));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| match c {
            Condition::Eq(field, value) => record.data.get(field) == Some(value),
            Condition::Ne(field, value) => record.data.get(field) != Some(value),
            Condition::Empty(field) => match record.data.get(field) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            },
        })
    }

    /// Applies sort and limit to an already condition-filtered set.
    pub fn finish(&self, mut records: Vec<Record>) -> Vec<Record> {
        if !self.sort.is_empty() {
            records.sort_by(|a, b| {
                for (field, direction) in &self.sort {
                    let ord = compare_field(a, b, field);
                    let ord = match direction {
                        Direction::Asc => ord,
                        Direction::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
        records
    }
}

fn compare_field(a: &Record, b: &Record, field: &str) -> Ordering {
    // "created" sorts on the record envelope, not a data field.
    if field == "created" {
        return a.created.cmp(&b.created);
    }
    match (a.data.get(field), b.data.get(field)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>, StoreError>;

    /// Inserts a new record, assigning id and timestamps. Returns the stored
    /// record.
    async fn insert(&self, collection: &str, data: Map<String, Value>)
        -> Result<Record, StoreError>;

    /// Persists an existing record's fields by id.
    async fn update(&self, record: &Record) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;
}

/// Request-scoped namespace selector. When a request opts into demo mode the
/// same handler code reads and writes the `demo_*` shadow collections; there
/// is no handler duplication.
#[derive(Clone)]
pub struct StoreView {
    store: Arc<dyn RecordStore>,
    demo: bool,
}

impl StoreView {
    pub fn new(store: Arc<dyn RecordStore>, demo: bool) -> Self {
        Self { store, demo }
    }

    fn collection(&self, name: &str) -> String {
        if self.demo {
            format!("demo_{name}")
        } else {
            name.to_string()
        }
    }

    pub async fn list(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        self.store.list(&self.collection(collection), filter).await
    }

    pub async fn find_first(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Result<Option<Record>, StoreError> {
        let records = self.list(collection, &filter.limit(1)).await?;
        Ok(records.into_iter().next())
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>, StoreError> {
        self.store.get(&self.collection(collection), id).await
    }

    pub async fn insert(
        &self,
        collection: &str,
        data: Map<String, Value>,
    ) -> Result<Record, StoreError> {
        self.store.insert(&self.collection(collection), data).await
    }

    pub async fn update(&self, record: &Record) -> Result<(), StoreError> {
        self.store.update(record).await
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.store.delete(&self.collection(collection), id).await
    }
}
