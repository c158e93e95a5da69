use crate::error::{IndexError, Result};
use crate::types::{ChangeLogEntry, ChangeOperation, LoggerPartition};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

/// Durable, ordered queue of resource changes.
///
/// Implementations must return entries of one partition in ascending id
/// order and must not reorder or duplicate entries within a single fetch.
pub trait ChangeLogSource: Send + Sync {
    /// Peek at most `max` entries of `partition`, oldest first.
    fn entries(&self, partition: LoggerPartition, max: usize) -> Result<Vec<ChangeLogEntry>>;

    /// Delete exactly the given entries.
    fn remove_entries(&self, entries: &[ChangeLogEntry]) -> Result<()>;
}

/// In-process change log, one ordered queue per partition.
#[derive(Debug, Default)]
pub struct MemoryChangeLog {
    inner: Mutex<ChangeLogInner>,
}

#[derive(Debug, Default)]
struct ChangeLogInner {
    next_id: u64,
    partitions: BTreeMap<LoggerPartition, BTreeMap<u64, ChangeLogEntry>>,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change and return its id.
    pub fn append(
        &self,
        partition: LoggerPartition,
        uri: impl Into<String>,
        operation: ChangeOperation,
        is_collection: bool,
    ) -> Result<u64> {
        let mut inner = self.lock_inner()?;
        inner.next_id += 1;
        let id = inner.next_id;
        let entry = ChangeLogEntry {
            id,
            partition,
            uri: uri.into(),
            resource_id: -1,
            operation,
            is_collection,
        };
        inner
            .partitions
            .entry(partition)
            .or_default()
            .insert(id, entry);
        Ok(id)
    }

    /// Insert pre-built entries, keeping their ids.
    pub fn extend(&self, entries: impl IntoIterator<Item = ChangeLogEntry>) -> Result<()> {
        let mut inner = self.lock_inner()?;
        for entry in entries {
            inner.next_id = inner.next_id.max(entry.id);
            inner
                .partitions
                .entry(entry.partition)
                .or_default()
                .insert(entry.id, entry);
        }
        Ok(())
    }

    pub fn len(&self, partition: LoggerPartition) -> Result<usize> {
        let inner = self.lock_inner()?;
        Ok(inner.partitions.get(&partition).map_or(0, BTreeMap::len))
    }

    pub fn is_empty(&self, partition: LoggerPartition) -> Result<bool> {
        Ok(self.len(partition)? == 0)
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, ChangeLogInner>> {
        self.inner
            .lock()
            .map_err(|_| IndexError::ChangeLog("change log mutex poisoned".to_string()))
    }
}

impl ChangeLogSource for MemoryChangeLog {
    fn entries(&self, partition: LoggerPartition, max: usize) -> Result<Vec<ChangeLogEntry>> {
        let inner = self.lock_inner()?;
        Ok(inner
            .partitions
            .get(&partition)
            .map(|queue| queue.values().take(max).cloned().collect())
            .unwrap_or_default())
    }

    fn remove_entries(&self, entries: &[ChangeLogEntry]) -> Result<()> {
        let mut inner = self.lock_inner()?;
        let ids: HashSet<(LoggerPartition, u64)> =
            entries.iter().map(|e| (e.partition, e.id)).collect();
        for (partition, id) in ids {
            if let Some(queue) = inner.partitions.get_mut(&partition) {
                queue.remove(&id);
            }
        }
        Ok(())
    }
}
