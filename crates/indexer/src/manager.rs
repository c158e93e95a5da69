//! Serializes long-running maintenance operations against one index.
//!
//! A consistency check and a reindex both need the index lock for a full
//! tree scan, so at most one of them runs at a time. The state mutex only
//! guards the flag transitions; the index lock itself is taken outside it.

use crate::consistency::{ConsistencyCheck, ConsistencyReport};
use crate::error::{IndexError, OperationRejected, Result};
use crate::index::{IndexLockGuard, PropertySetIndex};
use crate::reindexer::{DirectReindexer, IndirectReindexer, PropertySetIndexReindexer};
use crate::status::{
    unix_ms, ConsistencyCheckStatus, IndexOperationStatus, ReindexStatus,
    INDEX_STATUS_SCHEMA_VERSION,
};
use crate::store::IndexDao;
use log::{error, info};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

pub const CONSISTENCY_CHECK_THREAD_NAME: &str = "IndexOperationManager.checkConsistency";
pub const REINDEX_THREAD_NAME: &str = "IndexOperationManager.reindex";

/// How long [`IndexOperationManager::is_locked`] waits for the lock.
pub const LOCK_QUERY_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// Run on the calling thread and return when done.
    Inline,
    /// Run on a dedicated, named thread.
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    ConsistencyCheck,
    Reindex,
}

impl Operation {
    const fn thread_name(self) -> &'static str {
        match self {
            Self::ConsistencyCheck => CONSISTENCY_CHECK_THREAD_NAME,
            Self::Reindex => REINDEX_THREAD_NAME,
        }
    }
}

/// A maintenance operation running on its own thread.
#[derive(Debug)]
pub struct BackgroundTask {
    thread_name: &'static str,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub const fn thread_name(&self) -> &'static str {
        self.thread_name
    }

    /// Wait for the operation. Its outcome is read from the manager.
    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| IndexError::WorkerPanicked(self.thread_name.to_string()))
    }
}

#[must_use]
#[derive(Debug)]
pub enum Launched {
    Completed,
    Spawned(BackgroundTask),
}

impl Launched {
    pub fn wait(self) -> Result<()> {
        match self {
            Self::Completed => Ok(()),
            Self::Spawned(task) => task.join(),
        }
    }
}

#[derive(Default)]
struct OperationState {
    checking_consistency: bool,
    reindexing: bool,
    last_consistency_report: Option<Arc<ConsistencyReport>>,
    last_consistency_error: Option<Arc<IndexError>>,
    last_consistency_completed: Option<SystemTime>,
    last_reindex_count: Option<usize>,
    last_reindex_error: Option<Arc<IndexError>>,
    last_reindex_completed: Option<SystemTime>,
}

pub struct IndexOperationManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    index: Arc<dyn PropertySetIndex>,
    secondary: Option<Arc<dyn PropertySetIndex>>,
    dao: Arc<dyn IndexDao>,
    state: Mutex<OperationState>,
}

impl IndexOperationManager {
    pub fn new(index: Arc<dyn PropertySetIndex>, dao: Arc<dyn IndexDao>) -> Self {
        Self::build(index, None, dao)
    }

    /// Reindex through `secondary` and swap, instead of rebuilding in place.
    pub fn with_secondary(
        index: Arc<dyn PropertySetIndex>,
        secondary: Arc<dyn PropertySetIndex>,
        dao: Arc<dyn IndexDao>,
    ) -> Self {
        Self::build(index, Some(secondary), dao)
    }

    fn build(
        index: Arc<dyn PropertySetIndex>,
        secondary: Option<Arc<dyn PropertySetIndex>>,
        dao: Arc<dyn IndexDao>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                index,
                secondary,
                dao,
                state: Mutex::new(OperationState::default()),
            }),
        }
    }

    pub fn check_consistency(
        &self,
        execution: Execution,
    ) -> std::result::Result<Launched, OperationRejected> {
        {
            let mut state = self.inner.state();
            if state.checking_consistency {
                return Err(OperationRejected::ConsistencyCheckRunning);
            }
            if state.reindexing {
                return Err(OperationRejected::ReindexRunning);
            }
            if self.inner.index.is_closed() {
                return Err(OperationRejected::IndexClosed);
            }
            state.checking_consistency = true;
            state.last_consistency_error = None;
        }
        Ok(self.launch(Operation::ConsistencyCheck, execution))
    }

    pub fn reindex(&self, execution: Execution) -> std::result::Result<Launched, OperationRejected> {
        {
            let mut state = self.inner.state();
            if state.reindexing {
                return Err(OperationRejected::ReindexRunning);
            }
            if state.checking_consistency {
                return Err(OperationRejected::ConsistencyCheckRunning);
            }
            if self.inner.index.is_closed() {
                return Err(OperationRejected::IndexClosed);
            }
            state.reindexing = true;
            state.last_reindex_error = None;
        }
        Ok(self.launch(Operation::Reindex, execution))
    }

    fn launch(&self, operation: Operation, execution: Execution) -> Launched {
        match execution {
            Execution::Inline => {
                self.inner.run(operation);
                Launched::Completed
            }
            Execution::Background => {
                let inner = Arc::clone(&self.inner);
                let spawned = thread::Builder::new()
                    .name(operation.thread_name().to_string())
                    .spawn(move || inner.run(operation));
                match spawned {
                    Ok(handle) => Launched::Spawned(BackgroundTask {
                        thread_name: operation.thread_name(),
                        handle,
                    }),
                    Err(err) => {
                        error!("Failed to spawn {}: {err}", operation.thread_name());
                        self.inner.finish(operation, Err(IndexError::IoError(err)));
                        Launched::Completed
                    }
                }
            }
        }
    }

    pub fn reinitialize(&self) -> Result<()> {
        self.inner
            .with_lock(|index| index.reinitialize())
            .inspect_err(|err| error!("Failed to reinitialize index: {err}"))
    }

    pub fn optimize(&self) -> Result<()> {
        self.inner
            .with_lock(|index| index.optimize())
            .inspect_err(|err| error!("Failed to optimize index: {err}"))
    }

    pub fn close(&self) -> Result<()> {
        if self.inner.index.is_closed() {
            return Err(OperationRejected::IndexClosed.into());
        }
        self.inner
            .with_lock(|index| {
                if index.is_closed() {
                    return Err(OperationRejected::IndexClosed.into());
                }
                index.close()
            })
            .inspect_err(|err| error!("Failed to close index: {err}"))
    }

    pub fn lock(&self) -> bool {
        self.inner.index.lock()
    }

    pub fn unlock(&self) -> Result<()> {
        self.inner.index.unlock()
    }

    /// Try the lock briefly; a section that holds it past the timeout counts as locked.
    pub fn is_locked(&self) -> bool {
        match IndexLockGuard::acquire_timeout(self.inner.index.as_ref(), LOCK_QUERY_TIMEOUT) {
            Some(lock) => {
                lock.settle();
                false
            }
            None => true,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.index.is_closed()
    }

    /// Fix the errors found by the last consistency check.
    pub fn repair_consistency_errors(&self) -> Result<usize> {
        let report = {
            let state = self.inner.state();
            if state.checking_consistency {
                return Err(OperationRejected::ConsistencyCheckRunning.into());
            }
            if state.reindexing {
                return Err(OperationRejected::ReindexRunning.into());
            }
            state
                .last_consistency_report
                .clone()
                .ok_or(OperationRejected::NothingToRepair)?
        };
        if self.inner.index.is_closed() {
            return Err(OperationRejected::IndexClosed.into());
        }

        let repaired = self
            .inner
            .with_lock(|index| report.repair(index, self.inner.dao.as_ref()))?;

        let mut state = self.inner.state();
        if state
            .last_consistency_report
            .as_ref()
            .is_some_and(|last| Arc::ptr_eq(last, &report))
        {
            state.last_consistency_report = None;
        }
        Ok(repaired)
    }

    pub fn is_checking_consistency(&self) -> bool {
        self.inner.state().checking_consistency
    }

    pub fn is_reindexing(&self) -> bool {
        self.inner.state().reindexing
    }

    pub fn last_consistency_check_report(&self) -> Option<Arc<ConsistencyReport>> {
        self.inner.state().last_consistency_report.clone()
    }

    pub fn last_consistency_check_error(&self) -> Option<Arc<IndexError>> {
        self.inner.state().last_consistency_error.clone()
    }

    pub fn last_consistency_check_completed(&self) -> Option<SystemTime> {
        self.inner.state().last_consistency_completed
    }

    pub fn last_reindexing_count(&self) -> Option<usize> {
        self.inner.state().last_reindex_count
    }

    pub fn last_reindexing_error(&self) -> Option<Arc<IndexError>> {
        self.inner.state().last_reindex_error.clone()
    }

    pub fn last_reindexing_completed(&self) -> Option<SystemTime> {
        self.inner.state().last_reindex_completed
    }

    pub fn clear_last_consistency_check_results(
        &self,
    ) -> std::result::Result<(), OperationRejected> {
        let mut state = self.inner.state();
        if state.checking_consistency {
            return Err(OperationRejected::ConsistencyCheckRunning);
        }
        state.last_consistency_report = None;
        state.last_consistency_error = None;
        state.last_consistency_completed = None;
        Ok(())
    }

    pub fn clear_last_reindexing_results(&self) -> std::result::Result<(), OperationRejected> {
        let mut state = self.inner.state();
        if state.reindexing {
            return Err(OperationRejected::ReindexRunning);
        }
        state.last_reindex_count = None;
        state.last_reindex_error = None;
        state.last_reindex_completed = None;
        Ok(())
    }

    pub fn status(&self) -> IndexOperationStatus {
        let locked = self.is_locked();
        let state = self.inner.state();
        IndexOperationStatus {
            schema_version: INDEX_STATUS_SCHEMA_VERSION,
            index_id: self.inner.index.id().to_string(),
            secondary_index_id: self.inner.secondary.as_ref().map(|s| s.id().to_string()),
            closed: self.inner.index.is_closed(),
            locked,
            checking_consistency: state.checking_consistency,
            reindexing: state.reindexing,
            consistency_check: ConsistencyCheckStatus {
                completed_at_unix_ms: state.last_consistency_completed.map(unix_ms),
                error: state.last_consistency_error.as_ref().map(ToString::to_string),
                report: state.last_consistency_report.as_deref().cloned(),
            },
            reindex: ReindexStatus {
                completed_at_unix_ms: state.last_reindex_completed.map(unix_ms),
                error: state.last_reindex_error.as_ref().map(ToString::to_string),
                resource_count: state.last_reindex_count,
            },
        }
    }
}

/// What a finished operation produced.
enum OperationResult {
    Report(ConsistencyReport),
    Reindexed(usize),
}

impl ManagerInner {
    fn state(&self) -> MutexGuard<'_, OperationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_lock<T>(&self, op: impl FnOnce(&dyn PropertySetIndex) -> Result<T>) -> Result<T> {
        let Some(lock) = IndexLockGuard::acquire(self.index.as_ref()) else {
            return Err(IndexError::Other(format!(
                "unable to lock index '{}'",
                self.index.id()
            )));
        };
        let result = op(self.index.as_ref());
        if result.is_ok() {
            lock.settle();
        }
        result
    }

    fn run(&self, operation: Operation) {
        info!("Starting {:?} on index '{}'", operation, self.index.id());
        // A panic unwinds through the lock guard, so uncommitted edits are
        // discarded and the lock released before it is caught here.
        let result = catch_unwind(AssertUnwindSafe(|| match operation {
            Operation::ConsistencyCheck => self
                .with_lock(|index| ConsistencyCheck::run(index, self.dao.as_ref()))
                .map(OperationResult::Report),
            Operation::Reindex => {
                let reindexer = self.reindexer();
                self.with_lock(|_| reindexer.run())
                    .map(OperationResult::Reindexed)
            }
        }))
        .unwrap_or_else(|_| {
            Err(IndexError::WorkerPanicked(
                operation.thread_name().to_string(),
            ))
        });
        self.finish(operation, result);
    }

    fn reindexer(&self) -> Box<dyn PropertySetIndexReindexer> {
        match &self.secondary {
            Some(secondary) => Box::new(IndirectReindexer::new(
                Arc::clone(&self.index),
                Arc::clone(secondary),
                Arc::clone(&self.dao),
            )),
            None => Box::new(DirectReindexer::new(
                Arc::clone(&self.index),
                Arc::clone(&self.dao),
            )),
        }
    }

    fn finish(&self, operation: Operation, result: Result<OperationResult>) {
        let completed = Some(SystemTime::now());
        let mut state = self.state();
        match operation {
            Operation::ConsistencyCheck => {
                match result {
                    Ok(OperationResult::Report(report)) => {
                        state.last_consistency_report = Some(Arc::new(report));
                    }
                    Ok(OperationResult::Reindexed(_)) => {}
                    Err(err) => {
                        error!("Consistency check failed: {err}");
                        state.last_consistency_error = Some(Arc::new(err));
                    }
                }
                state.last_consistency_completed = completed;
                state.checking_consistency = false;
            }
            Operation::Reindex => {
                match result {
                    Ok(OperationResult::Reindexed(count)) => {
                        state.last_reindex_count = Some(count);
                    }
                    Ok(OperationResult::Report(_)) => {}
                    Err(err) => {
                        error!("Reindexing failed: {err}");
                        state.last_reindex_error = Some(Arc::new(err));
                    }
                }
                state.last_reindex_completed = completed;
                state.reindexing = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_index::MemoryPropertySetIndex;
    use crate::store::MemoryResourceStore;
    use crate::types::{AuthorizedPropertySet, PrincipalSet, PropertySet};
    use pretty_assertions::assert_eq;

    fn manager_with(uris: &[&str]) -> (IndexOperationManager, Arc<MemoryPropertySetIndex>) {
        let index = Arc::new(MemoryPropertySetIndex::new("main"));
        let store = Arc::new(MemoryResourceStore::new());
        for uri in uris {
            store
                .put(AuthorizedPropertySet::new(
                    PropertySet::new(*uri, "file"),
                    PrincipalSet::new(),
                ))
                .unwrap();
        }
        (IndexOperationManager::new(index.clone(), store), index)
    }

    #[test]
    fn inline_reindex_records_count() {
        let (manager, index) = manager_with(&["/a", "/b"]);
        manager.reindex(Execution::Inline).unwrap().wait().unwrap();

        assert_eq!(manager.last_reindexing_count(), Some(2));
        assert!(manager.last_reindexing_completed().is_some());
        assert!(!manager.is_reindexing());
        assert_eq!(index.committed_uris(), vec!["/a", "/b"]);
    }

    #[test]
    fn background_check_runs_on_named_thread() {
        let (manager, _index) = manager_with(&["/a"]);
        let Launched::Spawned(task) = manager.check_consistency(Execution::Background).unwrap()
        else {
            panic!("expected a background task");
        };
        assert_eq!(task.thread_name(), CONSISTENCY_CHECK_THREAD_NAME);
        task.join().unwrap();

        let report = manager.last_consistency_check_report().unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(!manager.is_checking_consistency());
    }

    #[test]
    fn is_locked_releases_its_own_lock() {
        let (manager, index) = manager_with(&[]);
        assert!(!manager.is_locked());
        assert!(!index.is_locked());

        assert!(manager.lock());
        assert!(manager.is_locked());
        manager.unlock().unwrap();
        assert!(!index.is_locked());
    }

    #[test]
    fn close_twice_is_rejected() {
        let (manager, _index) = manager_with(&[]);
        manager.close().unwrap();
        assert!(manager.is_closed());
        assert!(matches!(
            manager.close(),
            Err(IndexError::Rejected(OperationRejected::IndexClosed))
        ));
        assert_eq!(
            manager.reindex(Execution::Inline).unwrap_err(),
            OperationRejected::IndexClosed
        );

        manager.reinitialize().unwrap();
        assert!(!manager.is_closed());
    }

    #[test]
    fn repair_without_report_is_rejected() {
        let (manager, _index) = manager_with(&[]);
        assert!(matches!(
            manager.repair_consistency_errors(),
            Err(IndexError::Rejected(OperationRejected::NothingToRepair))
        ));
    }

    #[test]
    fn repair_fixes_last_report() {
        let (manager, index) = manager_with(&["/a", "/b"]);
        manager
            .check_consistency(Execution::Inline)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(manager.repair_consistency_errors().unwrap(), 2);
        assert!(manager.last_consistency_check_report().is_none());
        assert_eq!(index.committed_uris(), vec!["/a", "/b"]);
    }
}
