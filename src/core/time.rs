//! Shared timestamp/event helpers for discovery envelopes.
//!
//! Timestamps are unix-epoch seconds with a `Z` suffix (e.g. `1771220592Z`),
//! the same shape in cache documents, snapshots and the audit log.

use serde_json::{Map, Value as JsonValue};
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Current unix-epoch seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current unix-epoch nanoseconds, used only as hash input for identifiers.
pub fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    epoch_z(now_secs())
}

pub fn epoch_z(secs: u64) -> String {
    format!("{}Z", secs)
}

/// Parses an `epoch_z` string back into seconds. Anything else is `None`.
pub fn parse_epoch_z(raw: &str) -> Option<u64> {
    let digits = raw.strip_suffix('Z')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Version of the envelope every command prints on stdout.
pub const ENVELOPE_VERSION: &str = "1.0.0";

/// Wrap a command's payload in the standard response envelope.
///
/// The payload's top-level fields are merged beside `cmd` and `status`; a
/// payload that is not an object lands under `data`.
pub fn command_envelope(cmd: &str, status: &str, payload: JsonValue) -> JsonValue {
    let mut envelope = Map::new();
    envelope.insert("envelope_version".into(), ENVELOPE_VERSION.into());
    envelope.insert("ts".into(), now_epoch_z().into());
    envelope.insert("event_id".into(), new_event_id().into());
    envelope.insert("cmd".into(), cmd.into());
    envelope.insert("status".into(), status.into());
    match payload {
        JsonValue::Object(fields) => envelope.extend(fields),
        JsonValue::Null => {}
        other => {
            envelope.insert("data".into(), other);
        }
    }
    JsonValue::Object(envelope)
}
