//! Node configuration.
//!
//! Every field has a serde default, so a config file only needs to list what
//! it changes. Command-line flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::consensus::{SearchBudget, DEFAULT_DIFFICULTY};

/// Upper bound on difficulty: a SHA-256 hex digest has 64 digits.
pub const MAX_DIFFICULTY: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    /// Blocks and contracts live only as long as the process.
    Memory,
    /// Blocks and contracts persisted in a sled database at `path`.
    Sled { path: PathBuf },
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::Memory
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_difficulty")]
    pub difficulty: usize,
    #[serde(default)]
    pub storage: StorageBackend,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Bound on a single proof search, unbounded when absent.
    #[serde(default)]
    pub mining_timeout_ms: Option<u64>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_difficulty() -> usize {
    DEFAULT_DIFFICULTY
}

fn default_namespace() -> String {
    "proofchain".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            storage: StorageBackend::default(),
            namespace: default_namespace(),
            mining_timeout_ms: None,
            log_filter: default_log_filter(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: NodeConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.difficulty == 0 || self.difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::Invalid(format!(
                "difficulty must be between 1 and {}, got {}",
                MAX_DIFFICULTY, self.difficulty
            )));
        }
        if self.namespace.is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".to_string()));
        }
        if self.mining_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "mining_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn mining_timeout(&self) -> Option<Duration> {
        self.mining_timeout_ms.map(Duration::from_millis)
    }

    /// Fresh budget for one search, starting the timeout clock now.
    pub fn search_budget(&self) -> SearchBudget {
        match self.mining_timeout() {
            Some(timeout) => SearchBudget::unbounded().with_timeout(timeout),
            None => SearchBudget::unbounded(),
        }
    }
}
