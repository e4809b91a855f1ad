//! Runtime configuration, loaded from YAML

use crate::error::{ConceptError, ConceptResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration. Every field has a default, so an empty document is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Instances per shard before a new shard is started at commit
    pub sharding_threshold: u64,
    /// Keep schema facts cached across transactions of a session
    pub session_cache: bool,
    pub dedup: DedupConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    /// Maximum number of index keys merged per daemon wake-up
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file. Keyspaces live in memory only when unset.
    pub path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sharding_threshold: 10_000,
            session_cache: true,
            dedup: DedupConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 64,
        }
    }
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> ConceptResult<Self> {
        let config: Config = serde_yaml::from_str(yaml).map_err(|e| ConceptError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> ConceptResult<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| ConceptError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&yaml)
    }

    fn validate(&self) -> ConceptResult<()> {
        if self.sharding_threshold == 0 {
            return Err(ConceptError::Config("sharding_threshold must be at least 1".into()));
        }
        if self.dedup.batch_size == 0 {
            return Err(ConceptError::Config("dedup.batch_size must be at least 1".into()));
        }
        Ok(())
    }
}
