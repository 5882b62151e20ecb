//! Snapshot differ.
//!
//! `added`/`removed` are relative to moving from `base` to `target`; an entity
//! present in both is `modified` iff its fingerprint changed. Aggregate deltas
//! are `sum(target) - sum(base)` for entity size, entity count and every
//! integer metadata field seen in either snapshot. Sums and deltas saturate
//! at the `i64` bounds rather than wrapping.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::core::error::DiscoveryError;
use crate::core::snapshot::{EntityRecord, Snapshot};

pub const SIZE_DELTA: &str = "size";
pub const ENTITY_COUNT_DELTA: &str = "entity_count";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub base: String,
    pub target: String,
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub aggregate_deltas: BTreeMap<String, i64>,
}

impl ChangeSet {
    /// No entity was added, removed or modified.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

pub fn diff(base: &Snapshot, target: &Snapshot) -> Result<ChangeSet, DiscoveryError> {
    if base.target != target.target {
        return Err(DiscoveryError::TargetMismatch {
            base: base.target.to_string(),
            target: target.target.to_string(),
        });
    }

    let b = base.entities();
    let t = target.entities();

    let added = t.keys().filter(|p| !b.contains_key(*p)).cloned().collect();
    let removed = b.keys().filter(|p| !t.contains_key(*p)).cloned().collect();
    let modified = b
        .iter()
        .filter_map(|(path, before)| match t.get(path) {
            Some(after) if after.fingerprint != before.fingerprint => Some(path.clone()),
            _ => None,
        })
        .collect();

    let before = totals(b);
    let after = totals(t);
    let aggregate_deltas = before
        .keys()
        .chain(after.keys())
        .map(|k| {
            let delta = after
                .get(k)
                .copied()
                .unwrap_or(0)
                .saturating_sub(before.get(k).copied().unwrap_or(0));
            (k.clone(), delta)
        })
        .collect();

    Ok(ChangeSet {
        base: base.snapshot_id.clone(),
        target: target.snapshot_id.clone(),
        added,
        removed,
        modified,
        aggregate_deltas,
    })
}

fn totals(entities: &BTreeMap<String, EntityRecord>) -> BTreeMap<String, i64> {
    let mut sums = BTreeMap::new();
    sums.insert(
        ENTITY_COUNT_DELTA.to_string(),
        i64::try_from(entities.len()).unwrap_or(i64::MAX),
    );
    sums.insert(SIZE_DELTA.to_string(), 0i64);
    for record in entities.values() {
        let size = i64::try_from(record.size).unwrap_or(i64::MAX);
        let total = sums.entry(SIZE_DELTA.to_string()).or_insert(0);
        *total = total.saturating_add(size);
        for (key, value) in &record.metadata {
            if key == SIZE_DELTA || key == ENTITY_COUNT_DELTA {
                continue;
            }
            if let Some(n) = value.as_i64() {
                let total = sums.entry(key.clone()).or_insert(0);
                *total = total.saturating_add(n);
            }
        }
    }
    sums
}
