use crate::error::Result;
use crate::store::PropertySetStream;
use crate::types::{PrincipalSet, PropertySet};
use log::{debug, warn};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Mutable secondary index of property sets.
///
/// Every writer must hold the index lock for the duration of its mutation or
/// scan and commit before releasing it. Searchers only ever observe committed
/// state and are never blocked by the lock.
pub trait PropertySetIndex: Send + Sync {
    fn id(&self) -> &str;

    /// Upsert a property set. Does not delete any other entry, so callers
    /// replacing a resource delete it first.
    fn add_property_set(
        &self,
        property_set: &PropertySet,
        acl_read_principals: &PrincipalSet,
    ) -> Result<()>;

    /// Remove the entry with exactly this URI. Absent entries are a no-op.
    fn delete_property_set(&self, uri: &str) -> Result<()>;

    /// Remove the entry with this URI and every entry below it.
    fn delete_property_set_tree(&self, uri: &str) -> Result<()>;

    /// Remove every entry.
    fn clear_contents(&self) -> Result<()>;

    /// Copy every entry of `source` into this index.
    fn add_index_contents(&self, source: &dyn PropertySetIndex) -> Result<()>;

    /// Current (possibly uncommitted) entries in URI order. An entry may occur
    /// more than once if the index is inconsistent. Callers hold the lock, and
    /// every locked section either commits or is rolled back, so outside a
    /// write section this equals the committed state searchers see.
    fn property_sets(&self) -> Result<PropertySetStream<'_>>;

    fn count(&self) -> Result<usize>;

    /// Publish preceding mutations to searchers and make them durable.
    fn commit(&self) -> Result<()>;

    /// Drop uncommitted mutations and reopen the last committed state.
    fn reinitialize(&self) -> Result<()>;

    fn optimize(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Block until the lock is held. `false` means the lock cannot be
    /// acquired at all.
    fn lock(&self) -> bool;

    /// Try to take the lock, giving up after `timeout`.
    fn lock_timeout(&self, timeout: Duration) -> bool;

    /// Release a lock previously acquired with [`lock`](Self::lock) or
    /// [`lock_timeout`](Self::lock_timeout).
    fn unlock(&self) -> Result<()>;
}

/// Exclusive lock that is not bound to a scope or a thread, so an
/// administrator can take it in one request and release it in another.
#[derive(Debug, Default)]
pub struct IndexLock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl IndexLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> bool {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        while *locked {
            locked = self
                .released
                .wait(locked)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *locked = true;
        true
    }

    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        while *locked {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .released
                .wait_timeout(locked, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            locked = guard;
        }
        *locked = true;
        true
    }

    /// Returns `false` if the lock was not held.
    pub fn release(&self) -> bool {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        if !*locked {
            return false;
        }
        *locked = false;
        drop(locked);
        self.released.notify_one();
        true
    }

    pub fn is_held(&self) -> bool {
        *self.locked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds an index lock and releases it when dropped, on every exit path.
///
/// A guard dropped without [`settle`](Self::settle) discards the uncommitted
/// mutations of its section before unlocking, so a failed or panicking
/// writer never leaves edits behind for the next commit to publish.
pub struct IndexLockGuard<'a> {
    index: &'a dyn PropertySetIndex,
    settled: bool,
}

impl<'a> IndexLockGuard<'a> {
    /// Blocking acquire; `None` if the index refused the lock.
    pub fn acquire(index: &'a dyn PropertySetIndex) -> Option<Self> {
        index.lock().then(|| Self {
            index,
            settled: false,
        })
    }

    pub fn acquire_timeout(index: &'a dyn PropertySetIndex, timeout: Duration) -> Option<Self> {
        index.lock_timeout(timeout).then(|| Self {
            index,
            settled: false,
        })
    }

    /// Keep the section's effects and release the lock. Call after a
    /// successful commit or a section that did not write.
    pub fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for IndexLockGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && !self.index.is_closed() {
            match self.index.reinitialize() {
                Ok(()) => debug!(
                    "Discarded uncommitted changes of index '{}'",
                    self.index.id()
                ),
                Err(err) => warn!(
                    "Failed to discard uncommitted changes of index '{}': {err}",
                    self.index.id()
                ),
            }
        }
        if let Err(err) = self.index.unlock() {
            warn!("Failed to release lock on index '{}': {err}", self.index.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{IndexLock, IndexLockGuard, PropertySetIndex};
    use crate::memory_index::MemoryPropertySetIndex;
    use crate::types::{PrincipalSet, PropertySet};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn timed_acquire_fails_while_held() {
        let lock = IndexLock::new();
        assert!(lock.acquire());
        assert!(!lock.try_acquire_for(Duration::from_millis(20)));
        assert!(lock.release());
        assert!(lock.try_acquire_for(Duration::from_millis(20)));
    }

    #[test]
    fn release_without_acquire_is_reported() {
        let lock = IndexLock::new();
        assert!(!lock.release());
        assert!(!lock.is_held());
    }

    #[test]
    fn release_wakes_blocked_acquirer() {
        let lock = Arc::new(IndexLock::new());
        assert!(lock.acquire());

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.acquire())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(lock.release());
        assert!(waiter.join().unwrap());
        assert!(lock.is_held());
    }

    fn seeded(uris: &[&str]) -> MemoryPropertySetIndex {
        let index = MemoryPropertySetIndex::new("main");
        let principals: PrincipalSet = ["pseudo:all".to_string()].into_iter().collect();
        for uri in uris {
            index
                .add_property_set(&PropertySet::new(*uri, "file"), &principals)
                .unwrap();
        }
        index.commit().unwrap();
        index
    }

    #[test]
    fn unsettled_guard_discards_uncommitted_edits() {
        let index = seeded(&["/a", "/b"]);
        {
            let _lock = IndexLockGuard::acquire(&index).unwrap();
            index.delete_property_set("/a").unwrap();
            index.clear_contents().unwrap();
        }
        assert!(!index.is_locked());
        assert_eq!(index.count().unwrap(), 2);

        index.commit().unwrap();
        assert_eq!(index.committed_uris(), vec!["/a", "/b"]);
    }

    #[test]
    fn settled_guard_keeps_committed_edits() {
        let index = seeded(&["/a", "/b"]);
        let lock = IndexLockGuard::acquire(&index).unwrap();
        index.delete_property_set("/a").unwrap();
        index.commit().unwrap();
        lock.settle();

        assert!(!index.is_locked());
        assert_eq!(index.count().unwrap(), 1);
        assert_eq!(index.committed_uris(), vec!["/b"]);
    }

    #[test]
    fn timed_guard_gives_up_while_held() {
        let index = seeded(&[]);
        let held = IndexLockGuard::acquire(&index).unwrap();
        assert!(IndexLockGuard::acquire_timeout(&index, Duration::from_millis(20)).is_none());
        held.settle();
        let lock = IndexLockGuard::acquire_timeout(&index, Duration::from_millis(20)).unwrap();
        lock.settle();
        assert!(!index.is_locked());
    }

    #[test]
    fn guard_leaves_closed_index_closed() {
        let index = seeded(&["/a"]);
        {
            let _lock = IndexLockGuard::acquire(&index).unwrap();
            index.close().unwrap();
        }
        assert!(index.is_closed());
        assert!(!index.is_locked());
    }
}
