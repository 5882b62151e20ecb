use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Discovery level {requested} out of range (expected 1..={max})")]
    LevelOutOfRange { requested: u8, max: u8 },
    #[error("Cannot diff snapshots of different targets: {base} vs {target}")]
    TargetMismatch { base: String, target: String },
    #[error("Session locked: {0}")]
    Locked(String),
}
