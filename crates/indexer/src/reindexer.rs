use crate::error::{IndexError, Result};
use crate::index::{IndexLockGuard, PropertySetIndex};
use crate::store::IndexDao;
use log::info;
use std::sync::Arc;
use std::time::Instant;

const PROGRESS_INTERVAL: usize = 10_000;

/// Full rebuild of an index from the authoritative store.
pub trait PropertySetIndexReindexer: Send + Sync {
    /// Rebuild and return the number of indexed resources. The caller holds
    /// the target index lock.
    fn run(&self) -> Result<usize>;
}

/// Rebuilds the target index in place.
pub struct DirectReindexer {
    index: Arc<dyn PropertySetIndex>,
    dao: Arc<dyn IndexDao>,
}

impl DirectReindexer {
    pub fn new(index: Arc<dyn PropertySetIndex>, dao: Arc<dyn IndexDao>) -> Self {
        Self { index, dao }
    }
}

impl PropertySetIndexReindexer for DirectReindexer {
    fn run(&self) -> Result<usize> {
        let started = Instant::now();
        self.index.clear_contents()?;
        let count = fill(self.index.as_ref(), self.dao.as_ref())?;
        self.index.commit()?;
        info!(
            "Reindexed '{}' in place: {count} resources in {}ms",
            self.index.id(),
            started.elapsed().as_millis()
        );
        Ok(count)
    }
}

/// Builds into a secondary index, then swaps the result into the target.
pub struct IndirectReindexer {
    target: Arc<dyn PropertySetIndex>,
    secondary: Arc<dyn PropertySetIndex>,
    dao: Arc<dyn IndexDao>,
}

impl IndirectReindexer {
    pub fn new(
        target: Arc<dyn PropertySetIndex>,
        secondary: Arc<dyn PropertySetIndex>,
        dao: Arc<dyn IndexDao>,
    ) -> Self {
        Self {
            target,
            secondary,
            dao,
        }
    }
}

impl PropertySetIndexReindexer for IndirectReindexer {
    fn run(&self) -> Result<usize> {
        let started = Instant::now();
        let Some(secondary_lock) = IndexLockGuard::acquire(self.secondary.as_ref()) else {
            return Err(IndexError::Other(format!(
                "unable to lock secondary index '{}'",
                self.secondary.id()
            )));
        };

        self.secondary.clear_contents()?;
        let count = fill(self.secondary.as_ref(), self.dao.as_ref())?;
        self.secondary.commit()?;

        self.target.clear_contents()?;
        self.target.add_index_contents(self.secondary.as_ref())?;
        self.target.commit()?;

        self.secondary.clear_contents()?;
        self.secondary.commit()?;
        secondary_lock.settle();

        info!(
            "Reindexed '{}' via '{}': {count} resources in {}ms",
            self.target.id(),
            self.secondary.id(),
            started.elapsed().as_millis()
        );
        Ok(count)
    }
}

fn fill(index: &dyn PropertySetIndex, dao: &dyn IndexDao) -> Result<usize> {
    let mut count = 0usize;
    for resource in dao.all_property_sets()? {
        let resource = resource?;
        index.add_property_set(&resource.property_set, &resource.acl_read_principals)?;
        count += 1;
        if count % PROGRESS_INTERVAL == 0 {
            info!("Reindexing '{}': {count} resources so far", index.id());
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_index::MemoryPropertySetIndex;
    use crate::store::MemoryResourceStore;
    use crate::types::{AuthorizedPropertySet, PrincipalSet, PropertySet};
    use pretty_assertions::assert_eq;

    fn store_with(uris: &[&str]) -> Arc<MemoryResourceStore> {
        let store = Arc::new(MemoryResourceStore::new());
        for uri in uris {
            store
                .put(AuthorizedPropertySet::new(
                    PropertySet::new(*uri, "file"),
                    PrincipalSet::new(),
                ))
                .unwrap();
        }
        store
    }

    fn stale_index(id: &str) -> Arc<MemoryPropertySetIndex> {
        let index = Arc::new(MemoryPropertySetIndex::new(id));
        index
            .add_property_set(&PropertySet::new("/stale", "file"), &PrincipalSet::new())
            .unwrap();
        index.commit().unwrap();
        index
    }

    #[test]
    fn direct_rebuild_replaces_contents() {
        let store = store_with(&["/a", "/b"]);
        let index = stale_index("main");

        let count = DirectReindexer::new(index.clone(), store).run().unwrap();
        assert_eq!(count, 2);
        assert_eq!(index.committed_uris(), vec!["/a", "/b"]);
    }

    #[test]
    fn indirect_rebuild_swaps_and_empties_secondary() {
        let store = store_with(&["/a", "/b", "/c"]);
        let target = stale_index("main");
        let secondary = stale_index("secondary");

        let count = IndirectReindexer::new(target.clone(), secondary.clone(), store)
            .run()
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(target.committed_uris(), vec!["/a", "/b", "/c"]);
        assert!(secondary.committed_uris().is_empty());
        assert!(!secondary.is_locked());
    }
}
