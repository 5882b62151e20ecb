//! `config.toml` loading.
//!
//! The file is optional. Every section falls back to built-in defaults, so an
//! empty or partial file is valid; a file that fails to parse is an error.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::confidence::{self, ConfidencePolicy, DEFAULT_LEVELS, LevelCalibration};
use crate::core::error::DiscoveryError;

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub levels: Vec<LevelCalibration>,
    pub confidence: ConfidencePolicy,
    pub probe: ProbeConfig,
    pub filesystem: FilesystemConfig,
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            levels: DEFAULT_LEVELS.to_vec(),
            confidence: ConfidencePolicy::default(),
            probe: ProbeConfig::default(),
            filesystem: FilesystemConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Upper bound for any external process a probe spawns.
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { timeout_secs: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    pub max_depth: usize,
    pub max_entries_per_dir: usize,
    pub max_files: usize,
    /// Files at or above this size are not fingerprinted by content.
    pub max_hash_bytes: u64,
    /// Extra ignore globs on top of the built-in list and `.gitignore`.
    pub ignore: Vec<String>,
    pub never_read: Vec<String>,
    pub never_hash: Vec<String>,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_entries_per_dir: 1000,
            max_files: 1000,
            max_hash_bytes: 1_000_000,
            ignore: Vec::new(),
            never_read: Vec::new(),
            never_hash: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Environment variable holding the API key.
    pub key_env: String,
    /// Optional higher-privilege key, preferred when present.
    pub service_key_env: String,
    /// Used when the target locator is `env`.
    pub url_env: String,
    /// Tables inspected in detail at level 3.
    pub max_tables: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            key_env: "SUPABASE_ANON_KEY".to_string(),
            service_key_env: "SUPABASE_SERVICE_KEY".to_string(),
            url_env: "SUPABASE_URL".to_string(),
            max_tables: 5,
        }
    }
}

impl Config {
    pub fn calibration(&self, level: u8) -> Option<&LevelCalibration> {
        self.levels.iter().find(|c| c.level == level)
    }

    pub fn max_defined_level(&self) -> u8 {
        self.levels.iter().map(|c| c.level).max().unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), DiscoveryError> {
        confidence::validate_levels(&self.levels)?;
        self.confidence.validate()?;
        if self.probe.timeout_secs == 0 {
            return Err(DiscoveryError::ValidationError(
                "probe.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load `<store_root>/config.toml`, or defaults when the file does not exist.
pub fn load_config(store_root: &Path) -> Result<Config, DiscoveryError> {
    let config_path = store_root.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(&config_path).map_err(DiscoveryError::IoError)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
