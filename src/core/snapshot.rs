//! Snapshot manager: immutable, permanently retained copies of ladder output.
//!
//! Layout under `<store>/snapshots/`:
//! - `snapshot_<id>.json`: `{snapshot_id, timestamp, target, discovery_level, state, statistics}`
//! - `latest.json`: target (textual form) -> most recent snapshot id
//!
//! A snapshot file is written once. Nothing in this module rewrites one; the
//! only way a snapshot disappears is `prune`.
//!
//! `discovery_level` is the deepest level that completed, not the level asked
//! for. A capture whose ladder halted is kept but flagged through `halted`; it
//! never displaces a deeper `latest`, and two snapshots are only diffed when
//! they reached the same level, since a level that never ran says nothing
//! about the entities it would have reported.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::diff::{self, ChangeSet};
use crate::core::error::DiscoveryError;
use crate::core::ladder::DiscoveryLadder;
use crate::core::lock;
use crate::core::model::{Facts, Halt, LadderResult, Target};
use crate::core::store::{self, Store};
use crate::core::time;
use crate::core::trace::{self, DiscoveryEvent};

const LATEST_FILE: &str = "latest.json";
const SNAPSHOT_PREFIX: &str = "snapshot_";
const SNAPSHOT_ID_LEN: usize = 16;
/// Lock guarding read-modify-write of `latest.json`, which all sessions share.
const INDEX_LOCK: &str = "snapshot-index";

/// Per-process nonce mixed into snapshot ids.
static PROCESS_NONCE: LazyLock<String> = LazyLock::new(time::new_event_id);
static CAPTURE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One tracked entity inside a snapshot: a file, table, pull request, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub fingerprint: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub metadata: Facts,
}

impl EntityRecord {
    pub fn new(fingerprint: impl Into<String>, size: u64) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            size,
            metadata: Facts::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Record fingerprinted from its observable fields, for API-backed entities.
    pub fn from_fields(fields: &Value) -> Self {
        Self::new(fingerprint_value(fields), 0)
    }
}

/// SHA-256 hex of raw bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 hex of a JSON value's serialized form. Object keys serialize
/// sorted, so equal values always fingerprint equally.
pub fn fingerprint_value(value: &Value) -> String {
    fingerprint_bytes(value.to_string().as_bytes())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub entities: BTreeMap<String, EntityRecord>,
    #[serde(default)]
    pub level_confidence: BTreeMap<u8, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStatistics {
    pub entity_count: usize,
    pub total_size: u64,
    pub overall_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub timestamp: String,
    pub target: Target,
    pub discovery_level: u8,
    #[serde(default)]
    pub requested_level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted: Option<Halt>,
    pub state: SnapshotState,
    pub statistics: SnapshotStatistics,
}

impl Snapshot {
    /// Freeze a ladder result and its flattened entities.
    pub fn from_ladder(
        result: &LadderResult,
        entities: BTreeMap<String, EntityRecord>,
        captured_at: u64,
    ) -> Self {
        let level_confidence = result
            .levels
            .iter()
            .map(|(level, r)| (*level, r.confidence))
            .collect();
        let statistics = SnapshotStatistics {
            entity_count: entities.len(),
            total_size: entities.values().map(|e| e.size).sum(),
            overall_confidence: result.overall_confidence,
        };
        Self {
            snapshot_id: snapshot_id(&result.target),
            timestamp: time::epoch_z(captured_at),
            target: result.target.clone(),
            discovery_level: result.completed_level(),
            requested_level: result.max_level_requested,
            halted: result.halted.clone(),
            state: SnapshotState {
                entities,
                level_confidence,
            },
            statistics,
        }
    }

    pub fn entities(&self) -> &BTreeMap<String, EntityRecord> {
        &self.state.entities
    }

    /// True when the ladder stopped before the requested level.
    pub fn is_partial(&self) -> bool {
        self.halted.is_some()
    }

    /// Whether a diff between `self` and `other` reflects real change.
    pub fn comparable_with(&self, other: &Snapshot) -> bool {
        self.target == other.target && self.discovery_level == other.discovery_level
    }

    /// Capture instant in epoch seconds; 0 if the stored timestamp is unreadable.
    pub fn captured_at(&self) -> u64 {
        time::parse_epoch_z(&self.timestamp).unwrap_or(0)
    }
}

/// Lightweight listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub snapshot_id: String,
    pub timestamp: String,
    pub target: Target,
    pub discovery_level: u8,
    pub entity_count: usize,
    pub overall_confidence: f64,
    #[serde(default)]
    pub partial: bool,
}

impl From<&Snapshot> for SnapshotSummary {
    fn from(s: &Snapshot) -> Self {
        Self {
            snapshot_id: s.snapshot_id.clone(),
            timestamp: s.timestamp.clone(),
            target: s.target.clone(),
            discovery_level: s.discovery_level,
            entity_count: s.statistics.entity_count,
            overall_confidence: s.statistics.overall_confidence,
            partial: s.is_partial(),
        }
    }
}

/// Hash of (target, capture instant, per-process nonce, capture counter).
fn snapshot_id(target: &Target) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(time::now_nanos().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(PROCESS_NONCE.as_bytes());
    hasher.update(b"|");
    hasher.update(
        CAPTURE_COUNTER
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
            .as_bytes(),
    );
    let digest = format!("{:x}", hasher.finalize());
    digest[..SNAPSHOT_ID_LEN].to_string()
}

fn validate_id(id: &str) -> Result<(), DiscoveryError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(DiscoveryError::ValidationError(format!(
            "invalid snapshot id '{}'",
            id
        )));
    }
    Ok(())
}

pub struct SnapshotManager {
    store: Store,
}

impl SnapshotManager {
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
        }
    }

    fn dir(&self) -> PathBuf {
        self.store.snapshots_dir()
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir().join(format!("{}{}.json", SNAPSHOT_PREFIX, id))
    }

    fn latest_path(&self) -> PathBuf {
        self.dir().join(LATEST_FILE)
    }

    /// Run (or reuse through the ladder's cache) discovery up to `level` and
    /// persist the result as a new snapshot.
    pub fn capture(
        &self,
        ladder: &mut DiscoveryLadder<'_>,
        target: &Target,
        level: u8,
    ) -> Result<Snapshot, DiscoveryError> {
        let result = ladder.discover(target, level)?;
        let entities = ladder.probe().entities(&result);
        let snapshot = Snapshot::from_ladder(&result, entities, time::now_secs());
        self.save(&snapshot)?;
        Ok(snapshot)
    }

    /// Persist a snapshot built elsewhere and point `latest` at it, unless it
    /// is a partial capture shallower than the current latest.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), DiscoveryError> {
        validate_id(&snapshot.snapshot_id)?;
        let path = self.path_for(&snapshot.snapshot_id);
        if path.exists() {
            return Err(DiscoveryError::ValidationError(format!(
                "snapshot {} already exists and is immutable",
                snapshot.snapshot_id
            )));
        }
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        store::write_atomic(&path, &bytes)?;

        let key = snapshot.target.to_string();
        let became_latest = lock::with_session_lock(&self.store, INDEX_LOCK, || {
            let mut latest = self.read_latest()?;
            if snapshot.is_partial() {
                if let Some(current) = self.resolve_pointer(latest.get(&key))? {
                    if current.discovery_level > snapshot.discovery_level {
                        return Ok(false);
                    }
                }
            }
            latest.insert(key.clone(), snapshot.snapshot_id.clone());
            self.write_latest(&latest)?;
            Ok(true)
        })?;
        if !became_latest {
            tracing::warn!(
                snapshot_id = %snapshot.snapshot_id,
                target = %snapshot.target,
                level = snapshot.discovery_level,
                "partial snapshot kept; latest pointer unchanged"
            );
        }

        tracing::info!(
            snapshot_id = %snapshot.snapshot_id,
            target = %snapshot.target,
            entities = snapshot.statistics.entity_count,
            "snapshot captured"
        );
        trace::record(
            &self.store,
            DiscoveryEvent::new(
                "snapshot.capture",
                &snapshot.target.to_string(),
                "ok",
                json!({
                    "snapshot_id": snapshot.snapshot_id,
                    "level": snapshot.discovery_level,
                    "partial": snapshot.is_partial(),
                    "latest": became_latest,
                    "entity_count": snapshot.statistics.entity_count,
                    "overall_confidence": snapshot.statistics.overall_confidence,
                }),
            ),
        );
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Snapshot, DiscoveryError> {
        validate_id(id)?;
        let path = self.path_for(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DiscoveryError::NotFound(format!("snapshot {}", id)));
            }
            Err(e) => return Err(DiscoveryError::IoError(e)),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Most recent snapshot of `target`, if any has been captured.
    pub fn latest(&self, target: &Target) -> Result<Option<Snapshot>, DiscoveryError> {
        self.resolve_pointer(self.read_latest()?.get(&target.to_string()))
    }

    fn resolve_pointer(&self, id: Option<&String>) -> Result<Option<Snapshot>, DiscoveryError> {
        let Some(id) = id else {
            return Ok(None);
        };
        match self.load(id) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(DiscoveryError::NotFound(_)) => {
                tracing::warn!(snapshot_id = %id, "latest pointer is dangling");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Stored snapshots, oldest first, optionally restricted to one target.
    pub fn list(&self, target: Option<&Target>) -> Result<Vec<SnapshotSummary>, DiscoveryError> {
        let mut rows = self
            .load_all()?
            .iter()
            .filter(|s| target.is_none_or(|t| &s.target == t))
            .map(SnapshotSummary::from)
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            let at = time::parse_epoch_z(&a.timestamp).unwrap_or(0);
            let bt = time::parse_epoch_z(&b.timestamp).unwrap_or(0);
            at.cmp(&bt).then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
        });
        Ok(rows)
    }

    /// Delete a snapshot. If it was its target's latest, the pointer moves to
    /// the newest remaining snapshot of that target or is dropped.
    pub fn prune(&self, id: &str) -> Result<Snapshot, DiscoveryError> {
        let snapshot = self.load(id)?;
        fs::remove_file(self.path_for(id)).map_err(DiscoveryError::IoError)?;

        let key = snapshot.target.to_string();
        lock::with_session_lock(&self.store, INDEX_LOCK, || {
            let mut latest = self.read_latest()?;
            if latest.get(&key).map(String::as_str) != Some(id) {
                return Ok(());
            }
            match self.list(Some(&snapshot.target))?.pop() {
                Some(newest) => {
                    latest.insert(key.clone(), newest.snapshot_id);
                }
                None => {
                    latest.remove(&key);
                }
            }
            self.write_latest(&latest)
        })?;

        tracing::info!(snapshot_id = %id, target = %snapshot.target, "snapshot pruned");
        trace::record(
            &self.store,
            DiscoveryEvent::new(
                "snapshot.prune",
                &snapshot.target.to_string(),
                "ok",
                json!({ "snapshot_id": id }),
            ),
        );
        Ok(snapshot)
    }

    /// Capture a new snapshot and diff it against the target's previous latest.
    ///
    /// The change-set is `None` on a target's first capture, and also when the
    /// two captures reached different levels (typically because this run
    /// halted early).
    pub fn compare_with_latest(
        &self,
        ladder: &mut DiscoveryLadder<'_>,
        target: &Target,
        level: u8,
    ) -> Result<(Snapshot, Option<ChangeSet>), DiscoveryError> {
        let previous = self.latest(target)?;
        let current = self.capture(ladder, target, level)?;
        let changes = match previous {
            Some(base) if base.comparable_with(&current) => Some(diff::diff(&base, &current)?),
            Some(base) => {
                tracing::warn!(
                    base = %base.snapshot_id,
                    base_level = base.discovery_level,
                    current = %current.snapshot_id,
                    current_level = current.discovery_level,
                    "snapshots reached different levels; diff skipped"
                );
                trace::record(
                    &self.store,
                    DiscoveryEvent::new(
                        "snapshot.compare",
                        &target.to_string(),
                        "skipped",
                        json!({
                            "base": base.snapshot_id,
                            "base_level": base.discovery_level,
                            "target": current.snapshot_id,
                            "target_level": current.discovery_level,
                        }),
                    ),
                );
                None
            }
            None => None,
        };
        Ok((current, changes))
    }

    fn load_all(&self) -> Result<Vec<Snapshot>, DiscoveryError> {
        let dir = self.dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&dir).map_err(DiscoveryError::IoError)? {
            let entry = entry.map_err(DiscoveryError::IoError)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !(name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(".json")) {
                continue;
            }
            let content = fs::read_to_string(entry.path()).map_err(DiscoveryError::IoError)?;
            match serde_json::from_str::<Snapshot>(&content) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "skipping unreadable snapshot");
                }
            }
        }
        Ok(snapshots)
    }

    fn read_latest(&self) -> Result<BTreeMap<String, String>, DiscoveryError> {
        let path = self.latest_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&path).map_err(DiscoveryError::IoError)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_latest(&self, latest: &BTreeMap<String, String>) -> Result<(), DiscoveryError> {
        store::write_atomic(&self.latest_path(), &serde_json::to_vec_pretty(latest)?)
    }
}
