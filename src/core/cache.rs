//! TTL cache for level results.
//!
//! The ladder only sees the `CacheStore` trait. `FileCacheStore` persists one
//! JSON document per (target, level) so cached results survive process
//! restarts within a session scope; `MemoryCacheStore` keeps entries in
//! process and is what tests and embedders use.
//!
//! Document format (extra fields are ignored on read):
//!
//! ```json
//! { "level": 2, "confidence": 0.9, "facts": {}, "warnings": [],
//!   "timestamp": "1771220592Z", "ttl_secs": 60, "key": { ... } }
//! ```
//!
//! A document without a parseable `timestamp` or `ttl_secs` is a miss.

use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::core::error::DiscoveryError;
use crate::core::model::{DiscoveryKey, LevelResult, Target};
use crate::core::store::{self, Store};
use crate::core::time;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: DiscoveryKey,
    pub payload: LevelResult,
    pub cached_at: u64,
    pub ttl_secs: u64,
}

impl CacheEntry {
    /// Valid while `now - cached_at < ttl`.
    pub fn is_fresh(&self, now_secs: u64) -> bool {
        now_secs.saturating_sub(self.cached_at) < self.ttl_secs
    }
}

pub trait CacheStore {
    /// Fresh cached result for `key`, marked `from_cache`, or `None`.
    fn get(&self, key: &DiscoveryKey, now_secs: u64) -> Option<LevelResult>;

    fn put(
        &mut self,
        key: &DiscoveryKey,
        payload: &LevelResult,
        ttl_secs: u64,
        now_secs: u64,
    ) -> Result<(), DiscoveryError>;

    fn invalidate(&mut self, key: &DiscoveryKey) -> Result<(), DiscoveryError>;

    /// Drop every level cached for `target`. Returns how many entries went away.
    fn invalidate_all(&mut self, target: &Target) -> Result<usize, DiscoveryError>;
}

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: HashMap<DiscoveryKey, CacheEntry>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, key: &DiscoveryKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &DiscoveryKey, now_secs: u64) -> Option<LevelResult> {
        let entry = self.entries.get(key)?;
        if !entry.is_fresh(now_secs) {
            return None;
        }
        let mut payload = entry.payload.clone();
        payload.from_cache = true;
        Some(payload)
    }

    fn put(
        &mut self,
        key: &DiscoveryKey,
        payload: &LevelResult,
        ttl_secs: u64,
        now_secs: u64,
    ) -> Result<(), DiscoveryError> {
        let mut stored = payload.clone();
        stored.from_cache = false;
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key: key.clone(),
                payload: stored,
                cached_at: now_secs,
                ttl_secs,
            },
        );
        Ok(())
    }

    fn invalidate(&mut self, key: &DiscoveryKey) -> Result<(), DiscoveryError> {
        self.entries.remove(key);
        Ok(())
    }

    fn invalidate_all(&mut self, target: &Target) -> Result<usize, DiscoveryError> {
        let before = self.entries.len();
        self.entries.retain(|k, _| &k.target != target);
        Ok(before - self.entries.len())
    }
}

/// One JSON document per key under `<store>/cache/`.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
    scope: String,
}

impl FileCacheStore {
    pub fn new(store: &Store, scope: impl Into<String>) -> Self {
        Self {
            dir: store.cache_dir(),
            scope: scope.into(),
        }
    }

    pub fn path_for(&self, key: &DiscoveryKey) -> PathBuf {
        let session = store::session_id(&key.target, &self.scope);
        self.dir.join(format!("{}.json", key.slug(&session)))
    }

    /// Read the raw entry regardless of freshness.
    pub fn read_entry(&self, key: &DiscoveryKey) -> Option<CacheEntry> {
        let path = self.path_for(key);
        let content = fs::read_to_string(&path).ok()?;
        let doc: Value = match serde_json::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable cache document");
                return None;
            }
        };
        let cached_at = doc
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(time::parse_epoch_z)?;
        let ttl_secs = doc.get("ttl_secs").and_then(Value::as_u64)?;
        let payload: LevelResult = serde_json::from_value(doc).ok()?;
        if payload.level != key.level {
            return None;
        }
        Some(CacheEntry {
            key: key.clone(),
            payload,
            cached_at,
            ttl_secs,
        })
    }
}

impl CacheStore for FileCacheStore {
    fn get(&self, key: &DiscoveryKey, now_secs: u64) -> Option<LevelResult> {
        let entry = self.read_entry(key)?;
        if !entry.is_fresh(now_secs) {
            tracing::debug!(level = key.level, "cache entry expired");
            return None;
        }
        let mut payload = entry.payload;
        payload.from_cache = true;
        Some(payload)
    }

    fn put(
        &mut self,
        key: &DiscoveryKey,
        payload: &LevelResult,
        ttl_secs: u64,
        now_secs: u64,
    ) -> Result<(), DiscoveryError> {
        let mut stored = payload.clone();
        stored.from_cache = false;
        let mut doc = serde_json::to_value(&stored)?;
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("timestamp".to_string(), Value::String(time::epoch_z(now_secs)));
            obj.insert("ttl_secs".to_string(), Value::from(ttl_secs));
            obj.insert("key".to_string(), serde_json::to_value(key)?);
        }
        let bytes = serde_json::to_vec_pretty(&doc)?;
        store::write_atomic(&self.path_for(key), &bytes)
    }

    fn invalidate(&mut self, key: &DiscoveryKey) -> Result<(), DiscoveryError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DiscoveryError::IoError(e)),
        }
    }

    fn invalidate_all(&mut self, target: &Target) -> Result<usize, DiscoveryError> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let session = store::session_id(target, &self.scope);
        let prefix = format!("{}_{}_level_", target.kind.prefix(), session);
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir).map_err(DiscoveryError::IoError)? {
            let entry = entry.map_err(DiscoveryError::IoError)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".json") {
                fs::remove_file(entry.path()).map_err(DiscoveryError::IoError)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
