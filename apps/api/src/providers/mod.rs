//! Uniform façade over the supported AI provider APIs.
//!
//! This module is the only place provider API keys exist in plaintext:
//! decryption happens at the call boundary and the value does not outlive
//! the call.

pub mod handlers;

use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::errors::AppError;
use crate::store::Record;
use crate::vault::Vault;

pub const COLLECTION: &str = "ai_providers";

/// Sentinel an update sends to mean "keep the stored key".
pub const KEY_UNCHANGED_SENTINEL: &str = "********";

pub const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
pub const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
pub const OLLAMA_DEFAULT_BASE: &str = "http://localhost:11434";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
    Custom,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "ollama" => Ok(ProviderKind::Ollama),
            "custom" => Ok(ProviderKind::Custom),
            other => Err(AppError::Validation(format!(
                "unknown provider type '{other}'"
            ))),
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::OpenAi | ProviderKind::Custom => "gpt-4o-mini",
            ProviderKind::Anthropic => "claude-3-haiku-20240307",
            ProviderKind::Ollama => "llama3.2",
        }
    }
}

fn chosen_model(kind: ProviderKind, record: &Record) -> String {
    let model = record.get_str("model");
    if model.is_empty() {
        kind.default_model().to_string()
    } else {
        model.to_string()
    }
}

fn base_url(record: &Record, default: &str) -> String {
    let configured = record.get_str("base_url");
    let base = if configured.is_empty() { default } else { configured };
    base.trim_end_matches('/').to_string()
}

/// Sends one prompt through the provider and returns the text completion.
pub async fn call(
    http: &reqwest::Client,
    vault: &Vault,
    provider: &Record,
    prompt: &str,
    timeout: Duration,
) -> Result<String, AppError> {
    let kind = ProviderKind::parse(provider.get_str("type"))?;
    let model = chosen_model(kind, provider);
    let api_key = vault.decrypt(provider.get_str("api_key_encrypted"))?;

    let request = match kind {
        ProviderKind::OpenAi | ProviderKind::Custom => {
            let url = format!("{}/chat/completions", base_url(provider, OPENAI_DEFAULT_BASE));
            http.post(url).bearer_auth(&api_key).json(&json!({
                "model": model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": 0.7,
            }))
        }
        ProviderKind::Anthropic => http
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": model,
                "max_tokens": 2048,
                "messages": [{"role": "user", "content": prompt}],
            })),
        ProviderKind::Ollama => {
            let url = format!("{}/api/generate", base_url(provider, OLLAMA_DEFAULT_BASE));
            http.post(url).json(&json!({
                "model": model,
                "prompt": prompt,
                "stream": false,
            }))
        }
    };

    debug!(provider_id = %provider.id, "Calling AI provider");
    let response = request
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| AppError::provider(502, format!("provider unreachable: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AppError::provider(502, format!("provider response unreadable: {e}")))?;

    if !status.is_success() {
        return Err(AppError::provider(
            status.as_u16(),
            truncate_for_log(&body, 400),
        ));
    }

    let parsed: Value = serde_json::from_str(&body)
        .map_err(|_| AppError::provider(status.as_u16(), "provider returned non-JSON body"))?;
    extract_content(kind, &parsed)
        .ok_or_else(|| AppError::provider(status.as_u16(), "provider returned no content"))
}

fn extract_content(kind: ProviderKind, body: &Value) -> Option<String> {
    let pointer = match kind {
        ProviderKind::OpenAi | ProviderKind::Custom => "/choices/0/message/content",
        ProviderKind::Anthropic => "/content/0/text",
        ProviderKind::Ollama => "/response",
    };
    body.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
