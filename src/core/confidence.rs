//! Confidence model: how far a probe outcome can be trusted as reality.
//!
//! Scores are step functions of the warning count, calibrated per level.
//! Earlier, cheaper levels may reach 1.0; deeper levels cap lower because
//! deeper inspection is less likely to be complete. All numbers here are
//! tunable defaults, overridable through `config.toml`.

use serde::{Deserialize, Serialize};

use crate::core::error::DiscoveryError;
use crate::core::model::{LadderResult, ProbeOutcome};

pub const FEW_WARNINGS_FACTOR: f64 = 0.7;
pub const MANY_WARNINGS_FACTOR: f64 = 0.5;
/// Warning count at which the "many warnings" factor applies.
pub const MANY_WARNINGS_THRESHOLD: usize = 5;

/// Per-level calibration constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelCalibration {
    pub level: u8,
    /// Score for a clean success at this level.
    pub max_confidence: f64,
    /// Confidence the previous level must reach before this one runs.
    /// Level 1 has no predecessor and ignores it.
    pub min_required: f64,
    /// Cache time-to-live for this level's result.
    pub ttl_secs: u64,
}

/// Default calibration: connection, structure, content, deep inspection, full history.
pub const DEFAULT_LEVELS: [LevelCalibration; 5] = [
    LevelCalibration {
        level: 1,
        max_confidence: 1.0,
        min_required: 0.0,
        ttl_secs: 60,
    },
    LevelCalibration {
        level: 2,
        max_confidence: 0.9,
        min_required: 0.0,
        ttl_secs: 60,
    },
    LevelCalibration {
        level: 3,
        max_confidence: 0.8,
        min_required: 0.3,
        ttl_secs: 300,
    },
    LevelCalibration {
        level: 4,
        max_confidence: 0.7,
        min_required: 0.3,
        ttl_secs: 300,
    },
    LevelCalibration {
        level: 5,
        max_confidence: 0.6,
        min_required: 0.3,
        ttl_secs: 3600,
    },
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidencePolicy {
    pub few_warnings_factor: f64,
    pub many_warnings_factor: f64,
    pub many_warnings_threshold: usize,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            few_warnings_factor: FEW_WARNINGS_FACTOR,
            many_warnings_factor: MANY_WARNINGS_FACTOR,
            many_warnings_threshold: MANY_WARNINGS_THRESHOLD,
        }
    }
}

impl ConfidencePolicy {
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        // A success must never score zero, so both factors stay strictly positive.
        let in_unit = |v: f64| v > 0.0 && v <= 1.0;
        if !in_unit(self.few_warnings_factor) || !in_unit(self.many_warnings_factor) {
            return Err(DiscoveryError::ValidationError(
                "confidence factors must be within (0, 1]".to_string(),
            ));
        }
        if self.many_warnings_factor > self.few_warnings_factor {
            return Err(DiscoveryError::ValidationError(
                "many_warnings_factor must not exceed few_warnings_factor".to_string(),
            ));
        }
        if self.many_warnings_threshold < 2 {
            return Err(DiscoveryError::ValidationError(
                "many_warnings_threshold must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Scores an outcome against its level's calibration.
    ///
    /// `_so_far` is the ladder state before this level; the default policy
    /// does not consult it, but it is part of the contract so alternative
    /// policies can.
    pub fn score(
        &self,
        outcome: &ProbeOutcome,
        calibration: &LevelCalibration,
        _so_far: &LadderResult,
    ) -> f64 {
        let max = calibration.max_confidence.clamp(0.0, 1.0);
        match outcome {
            ProbeOutcome::Failure { .. } => 0.0,
            ProbeOutcome::Success { warnings, .. } => {
                let factor = match warnings.len() {
                    0 => 1.0,
                    n if n < self.many_warnings_threshold => self.few_warnings_factor,
                    _ => self.many_warnings_factor,
                };
                max * factor
            }
        }
    }
}

/// Validates a calibration table: contiguous levels from 1, values in range.
pub fn validate_levels(levels: &[LevelCalibration]) -> Result<(), DiscoveryError> {
    if levels.is_empty() {
        return Err(DiscoveryError::ValidationError(
            "level table must define at least level 1".to_string(),
        ));
    }
    for (idx, cal) in levels.iter().enumerate() {
        let expected = idx + 1;
        if cal.level as usize != expected {
            return Err(DiscoveryError::ValidationError(format!(
                "level table must be contiguous from 1: found level {} at position {}",
                cal.level, expected
            )));
        }
        if !(cal.max_confidence > 0.0 && cal.max_confidence <= 1.0) {
            return Err(DiscoveryError::ValidationError(format!(
                "level {}: max_confidence must be within (0, 1]",
                cal.level
            )));
        }
        if !(0.0..=1.0).contains(&cal.min_required) {
            return Err(DiscoveryError::ValidationError(format!(
                "level {}: min_required must be within [0, 1]",
                cal.level
            )));
        }
    }
    Ok(())
}
