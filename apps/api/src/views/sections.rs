//! Section assembly for view data delivery.
//!
//! A view's `sections` configuration is an ordered list of section entries.
//! Each enabled entry maps to one content collection, optionally pinning
//! explicit record ids and overriding a small allowlisted set of fields
//! per record.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::errors::AppError;
use crate::store::{Filter, Record, StoreView};

/// Closed map from section name to backing collection. Unknown names are
/// skipped rather than treated as errors so stale configs degrade quietly.
pub fn section_collection(section_name: &str) -> Option<&'static str> {
    match section_name {
        "experience" => Some("experience"),
        "projects" => Some("projects"),
        "education" => Some("education"),
        "certifications" => Some("certifications"),
        "skills" => Some("skills"),
        "posts" => Some("posts"),
        "talks" => Some("talks"),
        _ => None,
    }
}

/// Fields a view may override per record. Everything else, `id` included,
/// always comes from the record itself.
pub fn overridable_fields(section_name: &str) -> &'static [&'static str] {
    match section_name {
        "experience" => &["title", "description", "bullets"],
        "projects" => &["title", "summary", "description"],
        "education" => &["degree", "field", "description"],
        "talks" => &["title", "description"],
        _ => &[],
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectionConfig {
    pub section_name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub items: Option<Vec<String>>,
    #[serde(default)]
    pub item_config: Option<HashMap<String, Map<String, Value>>>,
}

pub fn parse_sections(value: Option<&Value>) -> Vec<SectionConfig> {
    value
        .and_then(|v| serde_json::from_value::<Vec<SectionConfig>>(v.clone()).ok())
        .unwrap_or_default()
}

/// Public-delivery visibility for one content record.
pub fn is_visible_record(record: &Record) -> bool {
    record.get_str("visibility") != "private" && !record.get_bool("is_draft")
}

/// Serializes one record for delivery: id plus all data fields except
/// `password_hash`, with allowlisted overrides applied.
pub fn serialize_record(
    record: &Record,
    overrides: Option<&Map<String, Value>>,
    allowlist: &[&str],
) -> Value {
    let mut out = Map::new();
    out.insert("id".into(), Value::String(record.id.clone()));
    for (key, value) in &record.data {
        if key == "password_hash" {
            continue;
        }
        out.insert(key.clone(), value.clone());
    }

    if let Some(overrides) = overrides {
        for (field, value) in overrides {
            if !allowlist.contains(&field.as_str()) {
                continue;
            }
            let empty = matches!(value, Value::Null)
                || matches!(value, Value::String(s) if s.is_empty());
            if !empty {
                out.insert(field.clone(), value.clone());
            }
        }
    }
    Value::Object(out)
}

/// Builds the delivered section list for one view, in configured order.
pub async fn assemble(
    store: &StoreView,
    sections: &[SectionConfig],
) -> Result<Vec<Value>, AppError> {
    let mut out = Vec::new();
    for section in sections {
        if !section.enabled {
            continue;
        }
        let Some(collection) = section_collection(&section.section_name) else {
            continue;
        };
        let allowlist = overridable_fields(&section.section_name);

        let records = match &section.items {
            Some(ids) => {
                let mut picked = Vec::new();
                for id in ids {
                    if let Some(record) = store.get(collection, id).await? {
                        if is_visible_record(&record) {
                            picked.push(record);
                        }
                    }
                }
                picked
            }
            None => store
                .list(
                    collection,
                    &Filter::new()
                        .ne("visibility", "private")
                        .ne("is_draft", true)
                        .sort_asc("sort_order"),
                )
                .await?,
        };

        let items: Vec<Value> = records
            .iter()
            .map(|r| {
                let overrides = section
                    .item_config
                    .as_ref()
                    .and_then(|cfg| cfg.get(&r.id));
                serialize_record(r, overrides, allowlist)
            })
            .collect();

        out.push(serde_json::json!({
            "section_name": section.section_name,
            "items": items,
        }));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn fields(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_serialize_strips_password_hash_and_protects_id() {
        let record = Record::new(
            "experience",
            fields(json!({"title": "Engineer", "password_hash": "$2b$12$x"})),
        );
        let overrides = fields(json!({"id": "evil", "title": "Principal Engineer"}));
        let out = serialize_record(&record, Some(&overrides), &["title"]);

        assert_eq!(out["id"], Value::String(record.id.clone()));
        assert_eq!(out["title"], "Principal Engineer");
        assert!(out.get("password_hash").is_none());
    }

    #[test]
    fn test_overrides_skip_empty_and_unlisted_fields() {
        let record = Record::new(
            "experience",
            fields(json!({"title": "Engineer", "company": "Acme"})),
        );
        let overrides = fields(json!({"title": "", "description": null, "company": "Evil Corp"}));
        let out = serialize_record(&record, Some(&overrides), &["title", "description"]);

        assert_eq!(out["title"], "Engineer");
        assert_eq!(out["company"], "Acme");
        assert!(out.get("description").is_none());
    }

    #[tokio::test]
    async fn test_assemble_filters_drafts_and_private_sorted() {
        let store = StoreView::new(Arc::new(MemoryStore::new()), false);
        for (title, sort, vis, draft) in [
            ("Second", 2, "public", false),
            ("First", 1, "public", false),
            ("Hidden", 0, "private", false),
            ("Draft", 0, "public", true),
        ] {
            store
                .insert(
                    "projects",
                    fields(json!({
                        "title": title, "sort_order": sort,
                        "visibility": vis, "is_draft": draft,
                    })),
                )
                .await
                .unwrap();
        }

        let sections = parse_sections(Some(&json!([
            {"section_name": "projects", "enabled": true},
            {"section_name": "unknown", "enabled": true},
            {"section_name": "skills", "enabled": false},
        ])));
        let out = assemble(&store, &sections).await.unwrap();

        assert_eq!(out.len(), 1);
        let items = out[0]["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["title"], "First");
        assert_eq!(items[1]["title"], "Second");
    }

    #[tokio::test]
    async fn test_assemble_explicit_items_preserve_order() {
        let store = StoreView::new(Arc::new(MemoryStore::new()), false);
        let a = store
            .insert("talks", fields(json!({"title": "A", "visibility": "public"})))
            .await
            .unwrap();
        let b = store
            .insert("talks", fields(json!({"title": "B", "visibility": "public"})))
            .await
            .unwrap();
        let hidden = store
            .insert("talks", fields(json!({"title": "H", "visibility": "private"})))
            .await
            .unwrap();

        let sections = parse_sections(Some(&json!([{
            "section_name": "talks",
            "enabled": true,
            "items": [b.id, hidden.id, a.id, "missing"],
            "item_config": {(a.id.clone()): {"title": "A overridden"}},
        }])));
        let out = assemble(&store, &sections).await.unwrap();

        let items = out[0]["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["title"], "B");
        assert_eq!(items[1]["title"], "A overridden");
    }
}
