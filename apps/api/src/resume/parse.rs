//! Parsing and ingesting the provider's structured-resume response.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::AppError;
use crate::store::StoreView;

/// Removes a leading/trailing Markdown code fence if present. Models often
/// wrap output in ```json fences despite instructions.
pub fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parses the provider response into a JSON object, tolerating one layer of
/// code fencing.
pub fn parse_resume_json(raw: &str) -> Result<Map<String, Value>, AppError> {
    let attempt = |s: &str| serde_json::from_str::<Value>(s).ok();
    let parsed = attempt(raw.trim())
        .or_else(|| attempt(strip_code_fences(raw)))
        .ok_or_else(|| {
            AppError::processing(
                "The AI response was not valid JSON.",
                "Try again or use a different provider.",
            )
        })?;
    match parsed {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::processing(
            "The AI response was not a JSON object.",
            "Try again or use a different provider.",
        )),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Sections of the parsed payload that map 1:1 onto content collections.
const IMPORT_SECTIONS: &[(&str, &str)] = &[
    ("experience", "experience"),
    ("education", "education"),
    ("skills", "skills"),
    ("certifications", "certifications"),
    ("projects", "projects"),
    ("awards", "awards"),
    ("talks", "talks"),
];

#[derive(Debug, Default)]
pub struct ImportCounts {
    pub inserted: Map<String, Value>,
    pub total: usize,
    pub duplicates: usize,
}

/// Fields that identify a duplicate within a section. Empty incoming values
/// are treated as wildcards, matching the original filters that omit unset
/// date fields.
fn dedup_keys(section: &str) -> &'static [&'static str] {
    match section {
        "experience" => &["company", "title", "start_date"],
        "education" => &["institution", "degree", "field", "end_date"],
        "skills" => &["name"],
        "certifications" => &["name", "issuer"],
        "projects" => &["title"],
        "awards" => &["title", "issuer", "awarded_at"],
        _ => &[],
    }
}

/// Experience and projects dedupe only against records from the same source
/// file: the same role on a different resume is a different facet, not a
/// duplicate. Skills, education, certifications, and awards are the same
/// fact wherever they appear, so those dedupe globally.
fn per_file_dedup(section: &str) -> bool {
    matches!(section, "experience" | "projects")
}

fn field_str(value: Option<&Value>) -> &str {
    match value {
        Some(Value::String(s)) if s != "null" => s.as_str(),
        _ => "",
    }
}

async fn is_duplicate(
    store: &StoreView,
    collection: &str,
    section: &str,
    incoming: &Map<String, Value>,
    filename: &str,
) -> Result<bool, AppError> {
    let keys = dedup_keys(section);
    if keys.is_empty() {
        return Ok(false);
    }
    if keys.iter().all(|k| field_str(incoming.get(*k)).is_empty()) {
        return Ok(false);
    }
    let mut filter = crate::store::Filter::new();
    if per_file_dedup(section) {
        filter = filter.eq("import_filename", filename);
    }
    let existing = store.list(collection, &filter).await?;
    Ok(existing.iter().any(|record| {
        keys.iter().all(|key| {
            let incoming_value = field_str(incoming.get(*key));
            if incoming_value.is_empty() {
                return true;
            }
            // Skill names match case-insensitively: "python" is "Python".
            if section == "skills" {
                incoming_value.eq_ignore_ascii_case(record.get_str(key))
            } else {
                incoming_value == record.get_str(key)
            }
        })
    }))
}

/// Inserts the parsed entities as private records linked to one import row,
/// skipping entities that already exist per the section's dedup rule.
/// Profile fields are merged into the singleton profile record.
pub async fn import_parsed(
    store: &StoreView,
    parsed: &Map<String, Value>,
    import_id: &str,
    filename: &str,
) -> Result<ImportCounts, AppError> {
    let mut counts = ImportCounts::default();

    for (section, collection) in IMPORT_SECTIONS {
        let Some(Value::Array(items)) = parsed.get(*section) else {
            continue;
        };
        let mut inserted = 0usize;
        for (sort_order, item) in items.iter().enumerate() {
            let Value::Object(fields) = item else {
                continue;
            };
            if is_duplicate(store, collection, section, fields, filename).await? {
                debug!(section, "Skipping duplicate entity from resume import");
                counts.duplicates += 1;
                continue;
            }
            let mut data = fields.clone();
            data.insert("visibility".into(), Value::String("private".into()));
            data.insert("is_draft".into(), Value::Bool(false));
            data.insert("sort_order".into(), Value::from(sort_order as i64));
            data.insert("resume_import_id".into(), Value::String(import_id.into()));
            data.insert("import_filename".into(), Value::String(filename.into()));
            store.insert(collection, data).await?;
            inserted += 1;
        }
        counts.inserted.insert((*section).into(), Value::from(inserted));
        counts.total += inserted;
    }

    if let Some(Value::Object(profile)) = parsed.get("profile") {
        merge_profile(store, profile, import_id).await?;
        counts.inserted.insert("profile".into(), Value::from(1));
    }

    debug!(import_id, total = counts.total, "Resume import inserted records");
    Ok(counts)
}

/// Fills empty profile fields from the import without clobbering anything
/// the owner already wrote.
async fn merge_profile(
    store: &StoreView,
    incoming: &Map<String, Value>,
    import_id: &str,
) -> Result<(), AppError> {
    let existing = store
        .list("profile", &crate::store::Filter::new().limit(1))
        .await?
        .into_iter()
        .next();

    match existing {
        Some(mut record) => {
            for (key, value) in incoming {
                let current_empty = match record.data.get(key) {
                    None | Some(Value::Null) => true,
                    Some(Value::String(s)) => s.is_empty(),
                    Some(_) => false,
                };
                if current_empty && !matches!(value, Value::Null) {
                    record.data.insert(key.clone(), value.clone());
                }
            }
            record.set("resume_import_id", import_id);
            store.update(&record).await?;
        }
        None => {
            let mut data = incoming.clone();
            data.insert("resume_import_id".into(), Value::String(import_id.into()));
            store.insert("profile", data).await?;
        }
    }
    Ok(())
}
