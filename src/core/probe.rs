//! The probe contract: one implementation per external system kind.
//!
//! Probes own their transport entirely. The ladder only ever sees a
//! `ProbeOutcome` or a `ProbeError`, and converts the latter into a failure.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::core::model::{FailureKind, LadderResult, ProbeOutcome, Target, TargetKind};
use crate::core::snapshot::EntityRecord;

/// Transport-level problems a probe may hit while talking to its target.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("connectivity: {0}")]
    Connectivity(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProbeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProbeError::Connectivity(_) | ProbeError::Timeout(_) => FailureKind::Connectivity,
            ProbeError::Permission(_) => FailureKind::Permission,
            ProbeError::Malformed(_) => FailureKind::MalformedResponse,
        }
    }

    pub fn into_outcome(self) -> ProbeOutcome {
        ProbeOutcome::failure(self.kind(), self.to_string())
    }
}

impl From<serde_json::Error> for ProbeError {
    fn from(e: serde_json::Error) -> Self {
        ProbeError::Malformed(e.to_string())
    }
}

pub trait Probe {
    fn kind(&self) -> TargetKind;

    /// Deepest level this probe knows how to inspect.
    fn max_level(&self) -> u8;

    /// Short human label for a level, used in reports and logs.
    fn level_name(&self, level: u8) -> &'static str;

    /// Inspect `target` at `level`. `so_far` holds the levels already completed
    /// in this run, for probes whose deeper levels build on earlier facts.
    fn invoke(
        &self,
        target: &Target,
        level: u8,
        so_far: &LadderResult,
    ) -> Result<ProbeOutcome, ProbeError>;

    /// Flatten a ladder result into snapshot entities keyed by entity path.
    fn entities(&self, result: &LadderResult) -> BTreeMap<String, EntityRecord>;
}
