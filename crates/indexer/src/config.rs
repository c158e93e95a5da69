use crate::error::{IndexError, Result};
use crate::types::LoggerPartition;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_CHANGES_PER_UPDATE: usize = 40_000;
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct IndexerConfig {
    pub updater: UpdaterConfig,
    pub index: IndexConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct UpdaterConfig {
    /// When `false`, fetched changes are purged without touching the index.
    pub enabled: bool,
    pub max_changes_per_update: usize,
    pub logger_type: i32,
    pub logger_id: i32,
    pub interval_ms: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_changes_per_update: DEFAULT_MAX_CHANGES_PER_UPDATE,
            logger_type: 1,
            logger_id: 1,
            interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
        }
    }
}

impl UpdaterConfig {
    #[must_use]
    pub const fn partition(&self) -> LoggerPartition {
        LoggerPartition::new(self.logger_type, self.logger_id)
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    /// Snapshot file of the main index. In-memory only when unset.
    pub storage_path: Option<PathBuf>,
    /// Reindex into a secondary index and swap, instead of rebuilding in place.
    pub secondary_index: bool,
}

impl IndexerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.updater.max_changes_per_update == 0 {
            return Err(IndexError::InvalidConfig(
                "updater.max_changes_per_update must be greater than 0".to_string(),
            ));
        }
        if self.updater.interval_ms == 0 {
            return Err(IndexError::InvalidConfig(
                "updater.interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_uses_defaults() {
        let config = IndexerConfig::from_toml_str("").unwrap();
        assert_eq!(config, IndexerConfig::default());
        assert!(config.updater.enabled);
        assert_eq!(config.updater.max_changes_per_update, 40_000);
        assert_eq!(config.updater.partition(), LoggerPartition::new(1, 1));
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = IndexerConfig::from_toml_str(
            r#"
            [updater]
            enabled = false
            logger_id = 7

            [index]
            secondary_index = true
            "#,
        )
        .unwrap();
        assert!(!config.updater.enabled);
        assert_eq!(config.updater.partition(), LoggerPartition::new(1, 7));
        assert_eq!(config.updater.interval(), Duration::from_secs(5));
        assert!(config.index.secondary_index);
        assert_eq!(config.index.storage_path, None);
    }

    #[test]
    fn zero_batch_cap_is_rejected() {
        let err = IndexerConfig::from_toml_str("[updater]\nmax_changes_per_update = 0\n")
            .unwrap_err();
        assert!(matches!(err, IndexError::InvalidConfig(_)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = IndexerConfig::from_toml_str("[updater]\nbatch = 3\n").unwrap_err();
        assert!(matches!(err, IndexError::TomlError(_)));
    }
}
