use crate::change_log::ChangeLogSource;
use crate::config::UpdaterConfig;
use crate::error::{IndexError, Result};
use crate::index::{IndexLockGuard, PropertySetIndex};
use crate::store::IndexDao;
use crate::types::{ChangeLogEntry, LoggerPartition};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const PROGRESS_INTERVAL: usize = 10_000;

/// Counters for one applied batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateStats {
    pub entries: usize,
    pub deleted: usize,
    pub tree_deleted: usize,
    pub reinserted: usize,
    /// Requested for reinsert but gone from the store.
    pub missing: usize,
}

#[derive(Debug)]
pub enum UpdateOutcome {
    NoChanges,
    /// Updates are disabled; the entries were purged unapplied.
    Discarded { entries: usize },
    Applied(UpdateStats),
    /// Lock not acquired; the change log was left untouched.
    LockUnavailable { entries: usize },
    /// Nothing was purged, so the same entries are retried next cycle.
    Failed { entries: usize, error: IndexError },
}

impl UpdateOutcome {
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::LockUnavailable { .. })
    }
}

/// Drains one change-log partition into the index in bounded batches.
pub struct IncrementalUpdater {
    index: Arc<dyn PropertySetIndex>,
    dao: Arc<dyn IndexDao>,
    change_log: Arc<dyn ChangeLogSource>,
    partition: LoggerPartition,
    max_changes_per_update: usize,
    enabled: AtomicBool,
    cycle: Mutex<()>,
}

impl IncrementalUpdater {
    pub fn new(
        config: &UpdaterConfig,
        index: Arc<dyn PropertySetIndex>,
        dao: Arc<dyn IndexDao>,
        change_log: Arc<dyn ChangeLogSource>,
    ) -> Self {
        Self {
            index,
            dao,
            change_log,
            partition: config.partition(),
            max_changes_per_update: config.max_changes_per_update.max(1),
            enabled: AtomicBool::new(config.enabled),
            cycle: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(
            "Incremental updates for partition {:?} {}",
            self.partition,
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub const fn partition(&self) -> LoggerPartition {
        self.partition
    }

    pub const fn max_changes_per_update(&self) -> usize {
        self.max_changes_per_update
    }

    /// Run one update cycle. Overlapping calls wait for each other.
    pub fn update(&self) -> UpdateOutcome {
        let _cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);

        let entries = match self
            .change_log
            .entries(self.partition, self.max_changes_per_update)
        {
            Ok(entries) => entries,
            Err(err) => {
                error!("Failed to read change log for {:?}: {err}", self.partition);
                return UpdateOutcome::Failed {
                    entries: 0,
                    error: err,
                };
            }
        };

        if entries.is_empty() {
            return UpdateOutcome::NoChanges;
        }
        let count = entries.len();

        if !self.is_enabled() {
            if let Err(err) = self.change_log.remove_entries(&entries) {
                error!("Failed to discard {count} change log entries: {err}");
                return UpdateOutcome::Failed {
                    entries: count,
                    error: err,
                };
            }
            debug!("Updates disabled, discarded {count} change log entries");
            return UpdateOutcome::Discarded { entries: count };
        }

        let stats = match self.apply_changes(&entries) {
            Ok(Some(stats)) => stats,
            Ok(None) => {
                warn!(
                    "Unable to lock index '{}', {count} changes left for the next cycle",
                    self.index.id()
                );
                return UpdateOutcome::LockUnavailable { entries: count };
            }
            Err(err) => {
                error!(
                    "Failed to apply {count} changes to index '{}': {err}",
                    self.index.id()
                );
                return UpdateOutcome::Failed {
                    entries: count,
                    error: err,
                };
            }
        };

        if let Err(err) = self.change_log.remove_entries(&entries) {
            error!("Applied {count} changes but failed to purge them, they will be re-applied: {err}");
            return UpdateOutcome::Failed {
                entries: count,
                error: err,
            };
        }

        debug!("Applied change batch: {stats:?}");
        UpdateOutcome::Applied(stats)
    }

    /// Apply a batch under the index lock. `Ok(None)` means the lock could
    /// not be acquired and nothing was touched.
    fn apply_changes(&self, entries: &[ChangeLogEntry]) -> Result<Option<UpdateStats>> {
        let Some(lock) = IndexLockGuard::acquire(self.index.as_ref()) else {
            return Ok(None);
        };

        let mut stats = UpdateStats {
            entries: entries.len(),
            ..UpdateStats::default()
        };

        // Deletes apply eagerly; later entries for the same URI win through
        // the last-change map.
        let mut last_changes: HashMap<&str, &ChangeLogEntry> = HashMap::with_capacity(entries.len());
        for entry in entries {
            last_changes.insert(entry.uri.as_str(), entry);
            if entry.operation.is_delete() {
                if entry.is_collection {
                    self.index.delete_property_set_tree(&entry.uri)?;
                    stats.tree_deleted += 1;
                } else {
                    self.index.delete_property_set(&entry.uri)?;
                    stats.deleted += 1;
                }
            }
        }

        let mut updates = Vec::new();
        for (uri, entry) in &last_changes {
            if !entry.operation.is_delete() {
                self.index.delete_property_set(uri)?;
                updates.push((*uri).to_string());
            }
        }
        drop(last_changes);

        if !updates.is_empty() {
            let total = updates.len();
            for resource in self.dao.property_sets_for_uris(&updates)? {
                let resource = resource?;
                self.index
                    .add_property_set(&resource.property_set, &resource.acl_read_principals)?;
                stats.reinserted += 1;
                if stats.reinserted % PROGRESS_INTERVAL == 0 {
                    info!("Reinserted {} of {total} property sets", stats.reinserted);
                }
            }
            stats.missing = total.saturating_sub(stats.reinserted);
        }

        self.index.commit()?;
        lock.settle();
        Ok(Some(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::MemoryChangeLog;
    use crate::memory_index::MemoryPropertySetIndex;
    use crate::store::MemoryResourceStore;
    use crate::types::{AuthorizedPropertySet, ChangeOperation, PrincipalSet, PropertySet};
    use pretty_assertions::assert_eq;

    struct Fixture {
        index: Arc<MemoryPropertySetIndex>,
        store: Arc<MemoryResourceStore>,
        log: Arc<MemoryChangeLog>,
        updater: IncrementalUpdater,
    }

    fn fixture(config: UpdaterConfig) -> Fixture {
        let index = Arc::new(MemoryPropertySetIndex::new("main"));
        let store = Arc::new(MemoryResourceStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        let updater = IncrementalUpdater::new(&config, index.clone(), store.clone(), log.clone());
        Fixture {
            index,
            store,
            log,
            updater,
        }
    }

    fn put(store: &MemoryResourceStore, uri: &str) {
        store
            .put(AuthorizedPropertySet::new(
                PropertySet::new(uri, "file"),
                PrincipalSet::new(),
            ))
            .unwrap();
    }

    #[test]
    fn empty_log_takes_no_lock() {
        let f = fixture(UpdaterConfig::default());
        assert!(f.index.lock());
        assert!(matches!(f.updater.update(), UpdateOutcome::NoChanges));
        f.index.unlock().unwrap();
        assert_eq!(f.index.commit_count(), 0);
    }

    #[test]
    fn runtime_disable_discards_changes() {
        let f = fixture(UpdaterConfig::default());
        let partition = f.updater.partition();
        put(&f.store, "/a");
        f.log
            .append(partition, "/a", ChangeOperation::Created, false)
            .unwrap();

        f.updater.set_enabled(false);
        assert!(matches!(
            f.updater.update(),
            UpdateOutcome::Discarded { entries: 1 }
        ));
        assert_eq!(f.index.mutation_count(), 0);
        assert!(f.log.is_empty(partition).unwrap());
    }

    #[test]
    fn missing_resource_is_skipped() {
        let f = fixture(UpdaterConfig::default());
        let partition = f.updater.partition();
        put(&f.store, "/present");
        f.log
            .append(partition, "/present", ChangeOperation::Created, false)
            .unwrap();
        f.log
            .append(partition, "/vanished", ChangeOperation::ModifiedContent, false)
            .unwrap();

        let UpdateOutcome::Applied(stats) = f.updater.update() else {
            panic!("expected applied outcome");
        };
        assert_eq!(stats.reinserted, 1);
        assert_eq!(stats.missing, 1);
        assert_eq!(f.index.committed_uris(), vec!["/present"]);
    }

    #[test]
    fn collection_delete_removes_subtree() {
        let f = fixture(UpdaterConfig::default());
        let partition = f.updater.partition();
        for uri in ["/docs", "/docs/a", "/docs/b", "/other"] {
            put(&f.store, uri);
            f.log
                .append(partition, uri, ChangeOperation::Created, false)
                .unwrap();
        }
        f.updater.update();

        f.store.remove_tree("/docs").unwrap();
        f.log
            .append(partition, "/docs", ChangeOperation::Deleted, true)
            .unwrap();
        let UpdateOutcome::Applied(stats) = f.updater.update() else {
            panic!("expected applied outcome");
        };
        assert_eq!(stats.tree_deleted, 1);
        assert_eq!(f.index.committed_uris(), vec!["/other"]);
    }
}
