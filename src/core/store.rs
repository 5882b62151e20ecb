//! Store layout for groundtruth's persisted state.
//!
//! A store is a directory (default `<cwd>/.groundtruth`) holding:
//! - `cache/`: one JSON document per (target, level) within a session
//! - `snapshots/`: permanent snapshot documents plus the `latest.json` pointer
//! - `locks/`: advisory single-writer locks, one per session
//! - `discovery.events.jsonl`: append-only audit log
//! - `config.toml`: optional configuration

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::DiscoveryError;
use crate::core::model::Target;

pub const STORE_DIR_NAME: &str = ".groundtruth";
pub const DEFAULT_SESSION_SCOPE: &str = "default";

/// Store handle representing one groundtruth state directory.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the store root: explicit path, then `GROUNDTRUTH_HOME`, then `<cwd>/.groundtruth`.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, DiscoveryError> {
        if let Some(path) = explicit {
            return Ok(Self::new(path));
        }
        if let Ok(home) = std::env::var("GROUNDTRUTH_HOME") {
            if !home.trim().is_empty() {
                return Ok(Self::new(home));
            }
        }
        let cwd = std::env::current_dir().map_err(DiscoveryError::IoError)?;
        Ok(Self::new(cwd.join(STORE_DIR_NAME)))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join("discovery.events.jsonl")
    }

    /// Create the directory layout if missing.
    pub fn ensure(&self) -> Result<(), DiscoveryError> {
        for dir in [self.cache_dir(), self.snapshots_dir(), self.locks_dir()] {
            fs::create_dir_all(&dir).map_err(DiscoveryError::IoError)?;
        }
        Ok(())
    }
}

/// Session identifier for a target within an invocation scope.
///
/// Stable across process restarts as long as the scope is the same, so cache
/// entries written by one command are visible to the next.
pub fn session_id(target: &Target, scope: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.kind.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(target.locator.as_bytes());
    hasher.update(b"\0");
    hasher.update(scope.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

/// Session scope from `GROUNDTRUTH_SESSION`, falling back to the default scope.
pub fn session_scope_from_env() -> String {
    std::env::var("GROUNDTRUTH_SESSION")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION_SCOPE.to_string())
}

/// Write `bytes` to `path` through a sibling temp file and rename, so readers
/// never observe a half-written document.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DiscoveryError> {
    let parent = path.parent().ok_or_else(|| {
        DiscoveryError::ValidationError(format!("path has no parent: {}", path.display()))
    })?;
    fs::create_dir_all(parent).map_err(DiscoveryError::IoError)?;
    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));
    fs::write(&tmp, bytes).map_err(DiscoveryError::IoError)?;
    fs::rename(&tmp, path).map_err(DiscoveryError::IoError)?;
    Ok(())
}
