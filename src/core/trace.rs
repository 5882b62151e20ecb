//! Append-only audit log of discovery activity (`discovery.events.jsonl`).
//!
//! Probe facts can carry anything an external system hands back, so every
//! detail payload is redacted before it is written.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::LazyLock;

use crate::core::error::DiscoveryError;
use crate::core::store::Store;
use crate::core::time;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    pub ts: String,
    pub event_id: String,
    pub op: String,
    pub target: String,
    pub status: String,
    #[serde(default)]
    pub detail: Value,
}

impl DiscoveryEvent {
    pub fn new(op: &str, target: &str, status: &str, detail: Value) -> Self {
        Self {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            op: op.to_string(),
            target: target.to_string(),
            status: status.to_string(),
            detail,
        }
    }
}

/// Patterns that detect secrets in string content.
static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    let table: [(&str, &'static str); 7] = [
        (
            r"(A3T[A-Z0-9]|AKIA|AGPA|AIDA|AROA|AIPA|ANPA|ANVA|ASIA)[0-9A-Z]{16}",
            "[AWS_KEY_REDACTED]",
        ),
        (
            r"(ghp|gho|ghu|ghs|ghr)_[a-zA-Z0-9_]{36,255}",
            "[GITHUB_TOKEN_REDACTED]",
        ),
        // Supabase / generic JWTs
        (
            r"eyJ[a-zA-Z0-9_\-]{10,}\.[a-zA-Z0-9_\-]{10,}\.[a-zA-Z0-9_\-]{10,}",
            "[JWT_REDACTED]",
        ),
        (r"(?i)bearer\s+[a-zA-Z0-9_\-\.]{20,}", "[BEARER_REDACTED]"),
        (
            r"-----BEGIN (?:RSA |DSA |EC |OPENSSH )?PRIVATE KEY-----",
            "[PEM_KEY_REDACTED]",
        ),
        (
            r#"(?i)(postgres|postgresql|mysql|mongodb|redis)://[^\s'"]+:[^\s'"]+@[^\s'"]+"#,
            "[CONNECTION_STRING_REDACTED]",
        ),
        (
            r#"(?i)(api[_-]?key|apikey|secret[_-]?key|password|passwd)['"]?\s*[:=]\s*['"]?[^\s'"]{8,}['"]?"#,
            "[CREDENTIAL_REDACTED]",
        ),
    ];
    table
        .into_iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
        .collect()
});

/// Redact secrets from a plain string value.
pub fn redact_string(input: &str) -> String {
    let mut result = input.to_string();
    for (pattern, replacement) in SECRET_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    ["token", "secret", "password", "api_key", "apikey", "authorization"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Recursively redact a JSON value: sensitive keys wholesale, strings by pattern.
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, val)| {
                    let val = if is_sensitive_key(&key) {
                        Value::String("[REDACTED]".to_string())
                    } else {
                        redact(val)
                    };
                    (key, val)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        Value::String(s) => Value::String(redact_string(&s)),
        other => other,
    }
}

pub fn append_event(store: &Store, event: DiscoveryEvent) -> Result<(), DiscoveryError> {
    let path = store.events_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(DiscoveryError::IoError)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(DiscoveryError::IoError)?;

    let redacted = DiscoveryEvent {
        detail: redact(event.detail),
        target: redact_string(&event.target),
        ..event
    };
    let json = serde_json::to_string(&redacted)?;
    writeln!(file, "{}", json).map_err(DiscoveryError::IoError)?;
    Ok(())
}

/// Best-effort append: the audit log never fails a discovery.
pub fn record(store: &Store, event: DiscoveryEvent) {
    let op = event.op.clone();
    if let Err(e) = append_event(store, event) {
        tracing::warn!(op = %op, error = %e, "failed to append discovery event");
    }
}

pub fn last_events(store: &Store, n: usize) -> Result<Vec<DiscoveryEvent>, DiscoveryError> {
    let path = store.events_path();
    if !path.exists() {
        return Ok(vec![]);
    }
    let content = std::fs::read_to_string(path).map_err(DiscoveryError::IoError)?;
    let events: Vec<DiscoveryEvent> = content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    let start = events.len().saturating_sub(n);
    Ok(events[start..].to_vec())
}
