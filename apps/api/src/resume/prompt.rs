//! Prompt construction for resume generation and resume import.

use serde_json::Value;
use std::fmt::Write;

use crate::views::sections::SectionConfig;

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub target_role: Option<String>,
    pub style: String,
    pub length: String,
    pub emphasis: Option<String>,
}

impl GenerationConfig {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "target_role": self.target_role,
            "style": self.style,
            "length": self.length,
            "emphasis": self.emphasis,
        })
    }
}

fn push_record(out: &mut String, record: &Value) {
    let Some(fields) = record.as_object() else {
        return;
    };
    for (key, value) in fields {
        if key == "id" || key == "resume_import_id" {
            continue;
        }
        match value {
            Value::String(s) if !s.is_empty() => {
                let _ = writeln!(out, "  {key}: {s}");
            }
            Value::Array(items) if !items.is_empty() => {
                let _ = writeln!(out, "  {key}:");
                for item in items {
                    if let Some(s) = item.as_str() {
                        let _ = writeln!(out, "    - {s}");
                    }
                }
            }
            _ => {}
        }
    }
}

/// Builds the generation prompt from the already access-checked view payload.
pub fn build_generation_prompt(
    profile: Option<&Value>,
    envelope: &Value,
    sections: &[(SectionConfig, Vec<Value>)],
    config: &GenerationConfig,
) -> String {
    let mut out = String::from(
        "You are an expert resume writer. Produce a complete resume in clean Markdown.\n\
         Output only the resume Markdown. No code fences, no commentary, no preamble.\n\
         Never invent numbers, dates, or facts that are not present in the data below.\n\n",
    );

    if let Some(role) = config.target_role.as_deref().filter(|r| !r.is_empty()) {
        let _ = writeln!(out, "Target role: {role}");
    }
    let _ = writeln!(out, "Style: {}", config.style);
    let _ = writeln!(out, "Length: {}", config.length);
    if let Some(emphasis) = config.emphasis.as_deref().filter(|e| !e.is_empty()) {
        let _ = writeln!(out, "Emphasize: {emphasis}");
    }
    out.push('\n');

    if let Some(profile) = profile {
        out.push_str("Profile:\n");
        push_record(&mut out, profile);
        out.push('\n');
    }

    if let Some(fields) = envelope.as_object() {
        for field in ["hero_headline", "hero_summary"] {
            if let Some(value) = fields.get(field).and_then(Value::as_str) {
                if !value.is_empty() {
                    let _ = writeln!(out, "{field}: {value}");
                }
            }
        }
    }
    out.push('\n');

    for (section, items) in sections {
        if items.is_empty() {
            continue;
        }
        let _ = writeln!(out, "## {}", section.section_name);
        for item in items {
            out.push_str("- item:\n");
            push_record(&mut out, item);
        }
        out.push('\n');
    }

    out
}

/// Builds the structured-extraction prompt for an uploaded resume.
pub fn build_import_prompt(resume_text: &str) -> String {
    format!(
        "Extract the following resume into strict JSON. Respond with a single JSON object \
         and nothing else. Use exactly this schema; omit no keys, use empty arrays or \
         empty strings when data is absent:\n\
         {{\n\
           \"profile\": {{\"name\": \"\", \"headline\": \"\", \"email\": \"\", \"phone\": \"\", \"location\": \"\", \"summary\": \"\"}},\n\
           \"experience\": [{{\"title\": \"\", \"company\": \"\", \"location\": \"\", \"start_date\": \"\", \"end_date\": \"\", \"description\": \"\", \"bullets\": []}}],\n\
           \"education\": [{{\"institution\": \"\", \"degree\": \"\", \"field\": \"\", \"start_date\": \"\", \"end_date\": \"\", \"description\": \"\"}}],\n\
           \"skills\": [{{\"name\": \"\", \"category\": \"\", \"level\": \"\"}}],\n\
           \"certifications\": [{{\"name\": \"\", \"issuer\": \"\", \"date\": \"\"}}],\n\
           \"projects\": [{{\"title\": \"\", \"summary\": \"\", \"description\": \"\", \"url\": \"\"}}],\n\
           \"awards\": [{{\"title\": \"\", \"issuer\": \"\", \"date\": \"\", \"description\": \"\"}}],\n\
           \"talks\": [{{\"title\": \"\", \"event\": \"\", \"date\": \"\", \"description\": \"\"}}],\n\
           \"metadata\": {{\"confidence\": 0.0, \"notes\": \"\"}}\n\
         }}\n\
         Dates stay as written in the resume. Do not invent any data.\n\n\
         Resume text:\n{resume_text}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generation_prompt_forbids_fences_and_invention() {
        let config = GenerationConfig {
            target_role: Some("Staff Engineer".into()),
            style: "chronological".into(),
            length: "two-page".into(),
            emphasis: None,
        };
        let sections = vec![(
            crate::views::sections::SectionConfig {
                section_name: "experience".into(),
                enabled: true,
                items: None,
                item_config: None,
            },
            vec![json!({"title": "Engineer", "bullets": ["Shipped X"]})],
        )];
        let prompt = build_generation_prompt(
            Some(&json!({"name": "Jane"})),
            &json!({"hero_headline": "Builder"}),
            &sections,
            &config,
        );

        assert!(prompt.contains("No code fences"));
        assert!(prompt.contains("Never invent numbers"));
        assert!(prompt.contains("Target role: Staff Engineer"));
        assert!(prompt.contains("hero_headline: Builder"));
        assert!(prompt.contains("- Shipped X"));
    }

    #[test]
    fn test_import_prompt_carries_schema_and_text() {
        let prompt = build_import_prompt("Jane Doe\nEngineer at Acme");
        assert!(prompt.contains("\"certifications\""));
        assert!(prompt.contains("\"metadata\""));
        assert!(prompt.contains("Jane Doe"));
        assert!(prompt.contains("single JSON object"));
    }
}
