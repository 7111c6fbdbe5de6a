use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{DATA_DIR, DEFAULT_SEED, MARKET_DATA_DIR, PREDICTIONS_DIR};
use crate::error::{ForecastError, Result};

/// Service-level settings: where artifacts live and how runs are seeded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root of the per-(ticker, day) run cache
    pub data_dir: PathBuf,
    /// Root of the persisted prediction tables
    pub predictions_dir: PathBuf,
    /// Directory read by the CSV market-data provider
    pub market_data_dir: PathBuf,
    pub seed: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DATA_DIR),
            predictions_dir: PathBuf::from(PREDICTIONS_DIR),
            market_data_dir: PathBuf::from(MARKET_DATA_DIR),
            seed: DEFAULT_SEED,
        }
    }
}

impl ServiceConfig {
    /// Load settings from a TOML file; keys left out keep their defaults
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ForecastError::MissingArtifact(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| ForecastError::invalid_parameter("config", e.to_string()))
    }

    /// Root all three directories under `base`
    pub fn rooted_at(base: impl AsRef<Path>, seed: u64) -> Self {
        let base = base.as_ref();
        Self {
            data_dir: base.join(DATA_DIR),
            predictions_dir: base.join(PREDICTIONS_DIR),
            market_data_dir: base.join(MARKET_DATA_DIR),
            seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stockflow.toml");
        fs::write(&path, "data_dir = \"/tmp/runs\"\nseed = 7\n").unwrap();

        let config = ServiceConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(config.seed, 7);
        assert_eq!(config.predictions_dir, PathBuf::from(PREDICTIONS_DIR));
    }

    #[test]
    fn test_missing_config_file() {
        let result = ServiceConfig::from_toml_file("does_not_exist.toml");
        assert!(matches!(result, Err(ForecastError::MissingArtifact(_))));
    }
}
