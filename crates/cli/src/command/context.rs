use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vtk_indexer::{
    AuthorizedPropertySet, ChangeOperation, IncrementalUpdater, IndexOperationManager,
    IndexerConfig, LoggerPartition, MemoryChangeLog, MemoryPropertySetIndex,
    MemoryResourceStore, PropertySetIndex,
};

const MAIN_INDEX_ID: &str = "main";
const SECONDARY_INDEX_ID: &str = "secondary";

/// Seed data for the in-process store, index and change log.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Fixture {
    /// Authoritative resources.
    pub resources: Vec<AuthorizedPropertySet>,
    /// Entries committed to the index before the command runs.
    pub indexed: Vec<AuthorizedPropertySet>,
    pub changes: Vec<FixtureChange>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureChange {
    pub uri: String,
    pub operation: ChangeOperation,
    #[serde(default)]
    pub is_collection: bool,
    /// Defaults to the configured updater partition.
    #[serde(default)]
    pub partition: Option<LoggerPartition>,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse fixture {}", path.display()))
    }
}

/// Everything a command needs, wired from config and fixture.
pub struct CommandContext {
    pub config: IndexerConfig,
    pub config_path: Option<PathBuf>,
    pub index: Arc<MemoryPropertySetIndex>,
    pub store: Arc<MemoryResourceStore>,
    pub change_log: Arc<MemoryChangeLog>,
    pub manager: IndexOperationManager,
    pub updater: Arc<IncrementalUpdater>,
}

impl CommandContext {
    pub fn build(config_path: Option<&Path>, fixture_path: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => IndexerConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => IndexerConfig::default(),
        };
        config.validate()?;

        let fixture = match fixture_path {
            Some(path) => Fixture::load(path)?,
            None => Fixture::default(),
        };

        let index = Arc::new(match &config.index.storage_path {
            Some(path) => MemoryPropertySetIndex::open(MAIN_INDEX_ID, path)?,
            None => MemoryPropertySetIndex::new(MAIN_INDEX_ID),
        });
        if !fixture.indexed.is_empty() {
            for entry in &fixture.indexed {
                index.add_property_set(&entry.property_set, &entry.acl_read_principals)?;
            }
            index.commit()?;
        }

        let store = Arc::new(MemoryResourceStore::new());
        for resource in fixture.resources {
            store.put(resource)?;
        }

        let change_log = Arc::new(MemoryChangeLog::new());
        let default_partition = config.updater.partition();
        for change in fixture.changes {
            change_log.append(
                change.partition.unwrap_or(default_partition),
                change.uri,
                change.operation,
                change.is_collection,
            )?;
        }

        let manager = if config.index.secondary_index {
            IndexOperationManager::with_secondary(
                index.clone(),
                Arc::new(MemoryPropertySetIndex::new(SECONDARY_INDEX_ID)),
                store.clone(),
            )
        } else {
            IndexOperationManager::new(index.clone(), store.clone())
        };

        let updater = Arc::new(IncrementalUpdater::new(
            &config.updater,
            index.clone(),
            store.clone(),
            change_log.clone(),
        ));

        Ok(Self {
            config,
            config_path: config_path.map(Path::to_path_buf),
            index,
            store,
            change_log,
            manager,
            updater,
        })
    }

    pub fn pending_changes(&self) -> Result<usize> {
        Ok(self.change_log.len(self.config.updater.partition())?)
    }
}
