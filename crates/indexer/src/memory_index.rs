use crate::error::{IndexError, Result};
use crate::index::{IndexLock, PropertySetIndex};
use crate::store::PropertySetStream;
use crate::types::{is_in_tree, AuthorizedPropertySet, PrincipalSet, PropertySet};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

type Entries = BTreeMap<String, AuthorizedPropertySet>;

/// On-disk form of a committed index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedIndexSnapshot {
    pub index_id: String,
    pub committed_at_unix_ms: u64,
    pub property_sets: Vec<AuthorizedPropertySet>,
}

/// Property-set index held in memory.
///
/// Mutations go to a working set; `commit` publishes the working set to
/// searchers and, when a storage path is configured, writes it to disk.
pub struct MemoryPropertySetIndex {
    id: String,
    storage_path: Option<PathBuf>,
    lock: IndexLock,
    state: RwLock<IndexState>,
    mutations: AtomicU64,
    commits: AtomicU64,
}

struct IndexState {
    closed: bool,
    working: Entries,
    committed: Arc<Entries>,
}

impl IndexState {
    fn from_committed(committed: Entries) -> Self {
        Self {
            closed: false,
            working: committed.clone(),
            committed: Arc::new(committed),
        }
    }
}

impl MemoryPropertySetIndex {
    /// Volatile index; `commit` only publishes to searchers.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_state(id.into(), None, Entries::new())
    }

    /// Durable index backed by a JSON snapshot at `path`, created on first
    /// commit.
    pub fn open(id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let committed = read_snapshot(&path)?;
        let id = id.into();
        info!(
            "Opened index '{id}' at {} with {} property sets",
            path.display(),
            committed.len()
        );
        Ok(Self::with_state(id, Some(path), committed))
    }

    fn with_state(id: String, storage_path: Option<PathBuf>, committed: Entries) -> Self {
        Self {
            id,
            storage_path,
            lock: IndexLock::new(),
            state: RwLock::new(IndexState::from_committed(committed)),
            mutations: AtomicU64::new(0),
            commits: AtomicU64::new(0),
        }
    }

    /// Number of add/delete/clear calls applied since construction.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// What a searcher sees for `uri`.
    pub fn committed_property_set(&self, uri: &str) -> Option<AuthorizedPropertySet> {
        self.committed_view().get(uri).cloned()
    }

    pub fn committed_uris(&self) -> Vec<String> {
        self.committed_view().keys().cloned().collect()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }

    fn committed_view(&self) -> Arc<Entries> {
        Arc::clone(&self.read_state().committed)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `mutate` on the working set of an open index.
    fn mutate<T>(&self, mutate: impl FnOnce(&mut Entries) -> T) -> Result<T> {
        let mut state = self.write_state();
        if state.closed {
            return Err(IndexError::Closed(self.id.clone()));
        }
        self.mutations.fetch_add(1, Ordering::Relaxed);
        Ok(mutate(&mut state.working))
    }

    fn persist(&self, entries: &Entries) -> Result<()> {
        let Some(path) = &self.storage_path else {
            return Ok(());
        };
        write_snapshot(path, &self.id, entries)
    }
}

impl PropertySetIndex for MemoryPropertySetIndex {
    fn id(&self) -> &str {
        &self.id
    }

    fn add_property_set(
        &self,
        property_set: &PropertySet,
        acl_read_principals: &PrincipalSet,
    ) -> Result<()> {
        let entry = AuthorizedPropertySet::new(property_set.clone(), acl_read_principals.clone());
        self.mutate(|working| {
            working.insert(entry.uri().to_string(), entry);
        })
    }

    fn delete_property_set(&self, uri: &str) -> Result<()> {
        self.mutate(|working| {
            working.remove(uri);
        })
    }

    fn delete_property_set_tree(&self, uri: &str) -> Result<()> {
        self.mutate(|working| working.retain(|key, _| !is_in_tree(uri, key)))
    }

    fn clear_contents(&self) -> Result<()> {
        self.mutate(BTreeMap::clear)
    }

    fn add_index_contents(&self, source: &dyn PropertySetIndex) -> Result<()> {
        let incoming = source.property_sets()?.collect::<Result<Vec<_>>>()?;
        let count = incoming.len();
        self.mutate(|working| {
            for entry in incoming {
                working.insert(entry.uri().to_string(), entry);
            }
        })?;
        debug!(
            "Copied {count} property sets from index '{}' into '{}'",
            source.id(),
            self.id
        );
        Ok(())
    }

    fn property_sets(&self) -> Result<PropertySetStream<'_>> {
        let state = self.read_state();
        if state.closed {
            return Err(IndexError::Closed(self.id.clone()));
        }
        let snapshot: Vec<AuthorizedPropertySet> = state.working.values().cloned().collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }

    fn count(&self) -> Result<usize> {
        let state = self.read_state();
        if state.closed {
            return Err(IndexError::Closed(self.id.clone()));
        }
        Ok(state.working.len())
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.write_state();
        if state.closed {
            return Err(IndexError::Closed(self.id.clone()));
        }
        self.persist(&state.working)?;
        state.committed = Arc::new(state.working.clone());
        self.commits.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Committed index '{}' with {} property sets",
            self.id,
            state.working.len()
        );
        Ok(())
    }

    fn reinitialize(&self) -> Result<()> {
        let committed = match &self.storage_path {
            Some(path) => read_snapshot(path)?,
            None => self.committed_view().as_ref().clone(),
        };
        let count = committed.len();
        *self.write_state() = IndexState::from_committed(committed);
        info!("Reinitialized index '{}' with {count} property sets", self.id);
        Ok(())
    }

    fn optimize(&self) -> Result<()> {
        let state = self.read_state();
        if state.closed {
            return Err(IndexError::Closed(self.id.clone()));
        }
        self.persist(&state.committed)?;
        info!("Optimized index '{}'", self.id);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.write_state().closed = true;
        info!("Closed index '{}'", self.id);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.read_state().closed
    }

    fn lock(&self) -> bool {
        self.lock.acquire()
    }

    fn lock_timeout(&self, timeout: std::time::Duration) -> bool {
        self.lock.try_acquire_for(timeout)
    }

    fn unlock(&self) -> Result<()> {
        if self.lock.release() {
            Ok(())
        } else {
            Err(IndexError::NotLocked(self.id.clone()))
        }
    }
}

fn read_snapshot(path: &Path) -> Result<Entries> {
    if !path.exists() {
        return Ok(Entries::new());
    }
    let bytes = std::fs::read(path)?;
    let snapshot: PersistedIndexSnapshot = serde_json::from_slice(&bytes)?;
    Ok(snapshot
        .property_sets
        .into_iter()
        .map(|entry| (entry.uri().to_string(), entry))
        .collect())
}

fn write_snapshot(path: &Path, index_id: &str, entries: &Entries) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let snapshot = PersistedIndexSnapshot {
        index_id: index_id.to_string(),
        committed_at_unix_ms: unix_now_ms(),
        property_sets: entries.values().cloned().collect(),
    };
    let bytes = serde_json::to_vec(&snapshot)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Property, PropertyValue};
    use pretty_assertions::assert_eq;

    fn doc(uri: &str) -> PropertySet {
        PropertySet::new(uri, "file")
            .with_property(Property::single("title", PropertyValue::String(uri.into())))
    }

    fn principals() -> PrincipalSet {
        ["pseudo:all".to_string()].into_iter().collect()
    }

    #[test]
    fn searchers_see_only_committed_state() {
        let index = MemoryPropertySetIndex::new("main");
        index.add_property_set(&doc("/a"), &principals()).unwrap();
        assert!(index.committed_property_set("/a").is_none());

        index.commit().unwrap();
        assert_eq!(index.committed_uris(), vec!["/a"]);
        assert_eq!(index.commit_count(), 1);
    }

    #[test]
    fn delete_is_exact_and_tree_delete_recurses() {
        let index = MemoryPropertySetIndex::new("main");
        for uri in ["/a", "/a/b", "/a/b/c", "/ab"] {
            index.add_property_set(&doc(uri), &principals()).unwrap();
        }

        index.delete_property_set("/a").unwrap();
        assert_eq!(index.count().unwrap(), 3);

        index.delete_property_set_tree("/a").unwrap();
        index.commit().unwrap();
        assert_eq!(index.committed_uris(), vec!["/ab"]);
    }

    #[test]
    fn closed_index_rejects_mutations() {
        let index = MemoryPropertySetIndex::new("main");
        index.close().unwrap();
        assert!(index.is_closed());
        assert!(matches!(
            index.add_property_set(&doc("/a"), &principals()),
            Err(IndexError::Closed(_))
        ));

        index.reinitialize().unwrap();
        assert!(!index.is_closed());
        index.add_property_set(&doc("/a"), &principals()).unwrap();
    }

    #[test]
    fn reinitialize_discards_uncommitted_changes() {
        let index = MemoryPropertySetIndex::new("main");
        index.add_property_set(&doc("/a"), &principals()).unwrap();
        index.commit().unwrap();
        index.add_property_set(&doc("/b"), &principals()).unwrap();

        index.reinitialize().unwrap();
        assert_eq!(index.count().unwrap(), 1);
    }

    #[test]
    fn unlock_without_lock_is_an_error() {
        let index = MemoryPropertySetIndex::new("main");
        assert!(matches!(index.unlock(), Err(IndexError::NotLocked(_))));
        assert!(index.lock());
        assert!(index.is_locked());
        index.unlock().unwrap();
    }

    #[test]
    fn committed_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index").join("main.json");

        let index = MemoryPropertySetIndex::open("main", &path).unwrap();
        index.add_property_set(&doc("/a"), &principals()).unwrap();
        index.commit().unwrap();
        index.add_property_set(&doc("/b"), &principals()).unwrap();
        drop(index);

        let reopened = MemoryPropertySetIndex::open("main", &path).unwrap();
        assert_eq!(reopened.committed_uris(), vec!["/a"]);
        assert_eq!(
            reopened.committed_property_set("/a").unwrap().acl_read_principals,
            principals()
        );
    }

    #[test]
    fn add_index_contents_copies_entries() {
        let source = MemoryPropertySetIndex::new("secondary");
        source.add_property_set(&doc("/x"), &principals()).unwrap();
        source.add_property_set(&doc("/y"), &principals()).unwrap();

        let target = MemoryPropertySetIndex::new("main");
        target.add_index_contents(&source).unwrap();
        assert_eq!(target.count().unwrap(), 2);
    }
}
