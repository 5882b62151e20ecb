//! The discovery ladder: levels run in order, each gated on the one before.
//!
//! For every level up to the requested maximum:
//! 1. check the gate against the previous level's confidence,
//! 2. reuse a fresh cache entry if there is one,
//! 3. otherwise invoke the probe, score it, and write successes through to the cache.
//!
//! The result always covers a contiguous prefix `1..=k` of levels. Probe
//! errors never escape; they become zero-confidence levels (or, for
//! permission denials, an omitted level) and stop the climb.

use serde_json::json;

use crate::core::cache::CacheStore;
use crate::core::config::Config;
use crate::core::error::DiscoveryError;
use crate::core::model::{
    DiscoveryKey, Facts, FailureKind, Halt, LadderResult, LevelResult, ProbeOutcome, Target,
};
use crate::core::probe::Probe;
use crate::core::store::Store;
use crate::core::time;
use crate::core::trace::{self, DiscoveryEvent};

pub struct DiscoveryLadder<'a> {
    probe: &'a dyn Probe,
    cache: &'a mut dyn CacheStore,
    config: &'a Config,
    audit: Option<&'a Store>,
}

impl<'a> DiscoveryLadder<'a> {
    pub fn new(probe: &'a dyn Probe, cache: &'a mut dyn CacheStore, config: &'a Config) -> Self {
        Self {
            probe,
            cache,
            config,
            audit: None,
        }
    }

    /// Record level executions in the store's audit log.
    pub fn with_audit(mut self, store: &'a Store) -> Self {
        self.audit = Some(store);
        self
    }

    pub fn probe(&self) -> &'a dyn Probe {
        self.probe
    }

    /// Deepest level both the probe and the calibration table support.
    pub fn max_level(&self) -> u8 {
        self.probe.max_level().min(self.config.max_defined_level())
    }

    pub fn discover(
        &mut self,
        target: &Target,
        max_level: u8,
    ) -> Result<LadderResult, DiscoveryError> {
        self.discover_at(target, max_level, time::now_secs())
    }

    /// `discover` with an explicit clock, for cache-expiry control.
    pub fn discover_at(
        &mut self,
        target: &Target,
        max_level: u8,
        now_secs: u64,
    ) -> Result<LadderResult, DiscoveryError> {
        self.validate(target, max_level)?;
        let mut result = LadderResult::new(target, max_level);
        tracing::info!(target = %target, max_level, "discovery started");

        for level in 1..=max_level {
            let calibration = *self.config.calibration(level).ok_or(
                DiscoveryError::LevelOutOfRange {
                    requested: level,
                    max: self.config.max_defined_level(),
                },
            )?;

            if let Some(reason) = self.gate_failure(&result, level, calibration.min_required) {
                tracing::info!(target = %target, level, %reason, "gate closed");
                result.halted = Some(Halt { level, reason });
                break;
            }

            let key = DiscoveryKey::new(target, level);
            if let Some(hit) = self.cache.get(&key, now_secs) {
                tracing::debug!(target = %target, level, confidence = hit.confidence, "cache hit");
                self.audit_level(target, &hit, "cached");
                result.push(hit);
                continue;
            }

            let outcome = self
                .probe
                .invoke(target, level, &result)
                .unwrap_or_else(|e| e.into_outcome());

            if let ProbeOutcome::Failure {
                kind: FailureKind::Permission,
                message,
            } = &outcome
            {
                // Not authorized for this depth: the level is not attempted.
                let reason = format!("{}: {}", FailureKind::Permission, message);
                tracing::info!(target = %target, level, %reason, "level not accessible");
                self.audit_event(
                    "ladder.level",
                    target,
                    "denied",
                    json!({ "level": level, "reason": reason }),
                );
                result.halted = Some(Halt { level, reason });
                break;
            }

            let confidence = self
                .config
                .confidence
                .score(&outcome, &calibration, &result);
            let level_result = build_level_result(level, confidence, outcome, now_secs);

            if confidence > 0.0 {
                if let Err(e) = self
                    .cache
                    .put(&key, &level_result, calibration.ttl_secs, now_secs)
                {
                    tracing::warn!(target = %target, level, error = %e, "cache write failed");
                }
            }

            let failed = level_result.failure;
            self.audit_level(
                target,
                &level_result,
                if failed.is_some() { "failed" } else { "probed" },
            );
            tracing::debug!(target = %target, level, confidence, "level probed");
            let warnings = level_result.warnings.clone();
            result.push(level_result);

            if let Some(kind) = failed {
                let reason = warnings
                    .first()
                    .cloned()
                    .unwrap_or_else(|| kind.to_string());
                result.halted = Some(Halt { level, reason });
                break;
            }
        }

        tracing::info!(
            target = %target,
            levels = result.levels.len(),
            overall_confidence = result.overall_confidence,
            "discovery finished"
        );
        self.audit_event(
            "ladder.discover",
            target,
            if result.overall_confidence > 0.0 { "ok" } else { "failed" },
            json!({
                "max_level": max_level,
                "levels": result.levels.len(),
                "overall_confidence": result.overall_confidence,
                "halted": result.halted,
            }),
        );
        Ok(result)
    }

    fn validate(&self, target: &Target, max_level: u8) -> Result<(), DiscoveryError> {
        if target.kind != self.probe.kind() {
            return Err(DiscoveryError::ValidationError(format!(
                "probe for {} cannot discover {} target {}",
                self.probe.kind(),
                target.kind,
                target
            )));
        }
        let max = self.max_level();
        if max_level == 0 || max_level > max {
            return Err(DiscoveryError::LevelOutOfRange {
                requested: max_level,
                max,
            });
        }
        Ok(())
    }

    fn gate_failure(&self, so_far: &LadderResult, level: u8, min_required: f64) -> Option<String> {
        if level == 1 {
            return None;
        }
        let prev = so_far.level(level - 1)?;
        if prev.confidence > 0.0 && prev.confidence >= min_required {
            return None;
        }
        Some(format!(
            "level {} confidence {:.2} below gate {:.2} for level {} ({})",
            level - 1,
            prev.confidence,
            min_required,
            level,
            self.probe.level_name(level)
        ))
    }

    fn audit_level(&self, target: &Target, level: &LevelResult, status: &str) {
        self.audit_event(
            "ladder.level",
            target,
            status,
            json!({
                "level": level.level,
                "name": self.probe.level_name(level.level),
                "confidence": level.confidence,
                "from_cache": level.from_cache,
                "warnings": level.warnings.len(),
            }),
        );
    }

    fn audit_event(&self, op: &str, target: &Target, status: &str, detail: serde_json::Value) {
        if let Some(store) = self.audit {
            trace::record(
                store,
                DiscoveryEvent::new(op, &target.to_string(), status, detail),
            );
        }
    }
}

fn build_level_result(
    level: u8,
    confidence: f64,
    outcome: ProbeOutcome,
    now_secs: u64,
) -> LevelResult {
    let (facts, warnings, failure) = match outcome {
        ProbeOutcome::Success { facts, warnings } => (facts, warnings, None),
        ProbeOutcome::Failure { kind, message } => {
            (Facts::new(), vec![format!("{}: {}", kind, message)], Some(kind))
        }
    };
    LevelResult {
        level,
        confidence,
        facts,
        warnings,
        from_cache: false,
        timestamp: time::epoch_z(now_secs),
        failure,
    }
}
