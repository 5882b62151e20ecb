//! Discovery data model: targets, keys, probe outcomes and ladder results.
//!
//! Everything here is plain data. `LevelResult` and `LadderResult` are the
//! values handed back to callers; nothing in the engine keeps a hidden
//! "current level" field around between calls.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::core::error::DiscoveryError;

/// Raw facts reported by a probe. Keys are sorted, so serialized output is stable.
pub type Facts = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Filesystem,
    Forge,
    Database,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Filesystem => "filesystem",
            TargetKind::Forge => "forge",
            TargetKind::Database => "database",
        }
    }

    /// Short prefix used in locators and file names.
    pub fn prefix(self) -> &'static str {
        match self {
            TargetKind::Filesystem => "fs",
            TargetKind::Forge => "forge",
            TargetKind::Database => "db",
        }
    }

    fn parse_prefix(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "fs" | "file" | "filesystem" => Some(TargetKind::Filesystem),
            "forge" | "gh" | "github" => Some(TargetKind::Forge),
            "db" | "database" | "supabase" => Some(TargetKind::Database),
            _ => None,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An external system whose real state is being discovered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub locator: String,
}

impl Target {
    pub fn new(kind: TargetKind, locator: impl Into<String>) -> Self {
        Self {
            kind,
            locator: locator.into(),
        }
    }

    pub fn filesystem(locator: impl Into<String>) -> Self {
        Self::new(TargetKind::Filesystem, locator)
    }

    /// Build a target with its locator in canonical form.
    ///
    /// Path locators (`fs:`, `forge:`) become absolute, symlinks resolved when
    /// the path exists, so every spelling of one directory shares a key,
    /// session and snapshot history. Database URLs are kept verbatim.
    pub fn resolved(kind: TargetKind, locator: &str) -> Result<Self, DiscoveryError> {
        match kind {
            TargetKind::Filesystem | TargetKind::Forge => {
                Ok(Self::new(kind, canonical_path(locator)?))
            }
            TargetKind::Database => Ok(Self::new(kind, locator)),
        }
    }
}

fn canonical_path(raw: &str) -> Result<String, DiscoveryError> {
    let path = Path::new(raw);
    let resolved = match std::fs::canonicalize(path) {
        Ok(p) => p,
        // Missing targets still need a stable identity; the probe reports the absence.
        Err(_) => std::path::absolute(path).map_err(DiscoveryError::IoError)?,
    };
    Ok(resolved.to_string_lossy().into_owned())
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.locator)
    }
}

impl FromStr for Target {
    type Err = DiscoveryError;

    /// Accepts `fs:<path>`, `forge:<repo-path>` or `db:<url>`.
    /// A bare value without a known prefix is treated as a filesystem path.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DiscoveryError::ValidationError(
                "target locator must not be empty".to_string(),
            ));
        }
        if let Some((prefix, rest)) = raw.split_once(':') {
            if let Some(kind) = TargetKind::parse_prefix(prefix) {
                if rest.is_empty() {
                    return Err(DiscoveryError::ValidationError(format!(
                        "target '{}' has an empty locator",
                        raw
                    )));
                }
                return Target::resolved(kind, rest);
            }
        }
        Target::resolved(TargetKind::Filesystem, raw)
    }
}

/// One (target, level) pair. Namespaces cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryKey {
    pub target: Target,
    pub level: u8,
}

impl DiscoveryKey {
    pub fn new(target: &Target, level: u8) -> Self {
        Self {
            target: target.clone(),
            level,
        }
    }

    /// File-name safe identifier for this key within a session.
    pub fn slug(&self, session_id: &str) -> String {
        format!(
            "{}_{}_level_{}",
            self.target.kind.prefix(),
            session_id,
            self.level
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Target unreachable: process missing, timeout, connection refused.
    Connectivity,
    /// Reachable but not authorized for this level.
    Permission,
    /// The external system answered with data the probe could not parse.
    MalformedResponse,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Connectivity => "connectivity",
            FailureKind::Permission => "permission_denied",
            FailureKind::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fresh result of a single probe invocation. Never cached directly.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success { facts: Facts, warnings: Vec<String> },
    Failure { kind: FailureKind, message: String },
}

impl ProbeOutcome {
    pub fn success(facts: Facts) -> Self {
        ProbeOutcome::Success {
            facts,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(facts: Facts, warnings: Vec<String>) -> Self {
        ProbeOutcome::Success { facts, warnings }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        ProbeOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ProbeOutcome::Failure { .. })
    }
}

/// One level's durable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelResult {
    pub level: u8,
    pub confidence: f64,
    #[serde(default)]
    pub facts: Facts,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub from_cache: bool,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

/// Why a ladder stopped before `max_level_requested`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Halt {
    /// The first level that was not completed.
    pub level: u8,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderResult {
    pub target: Target,
    pub max_level_requested: u8,
    /// Ascending by level; always the contiguous prefix `1..=k`.
    pub levels: BTreeMap<u8, LevelResult>,
    pub overall_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted: Option<Halt>,
}

impl LadderResult {
    pub fn new(target: &Target, max_level_requested: u8) -> Self {
        Self {
            target: target.clone(),
            max_level_requested,
            levels: BTreeMap::new(),
            overall_confidence: 0.0,
            halted: None,
        }
    }

    pub fn level(&self, level: u8) -> Option<&LevelResult> {
        self.levels.get(&level)
    }

    /// Facts of an earlier level, for probes that build on what they found before.
    pub fn facts(&self, level: u8) -> Option<&Facts> {
        self.levels.get(&level).map(|l| &l.facts)
    }

    /// Highest level present in `levels`, or 0 when nothing was attempted.
    pub fn deepest_level(&self) -> u8 {
        self.levels.keys().next_back().copied().unwrap_or(0)
    }

    /// Highest level that completed without a failure; 0 when none did.
    pub fn completed_level(&self) -> u8 {
        self.levels
            .values()
            .take_while(|l| l.failure.is_none())
            .map(|l| l.level)
            .last()
            .unwrap_or(0)
    }

    pub(crate) fn push(&mut self, result: LevelResult) {
        self.levels.insert(result.level, result);
        self.overall_confidence = mean_confidence(&self.levels);
    }
}

/// Mean over attempted levels only; an empty ladder has zero confidence.
pub fn mean_confidence(levels: &BTreeMap<u8, LevelResult>) -> f64 {
    if levels.is_empty() {
        return 0.0;
    }
    levels.values().map(|l| l.confidence).sum::<f64>() / levels.len() as f64
}
