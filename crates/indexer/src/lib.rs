//! # VTK Indexer
//!
//! Keeps a property-set search index in step with the resource store.
//!
//! ## Pipeline
//!
//! ```text
//! Resource store writes
//!     │
//!     ├──> Change log (per logger partition)
//!     │      └─> ChangeLogEntry batches
//!     │
//!     ├──> Incremental updater (under the index lock)
//!     │      ├─> deletes applied eagerly
//!     │      └─> last-change-wins reinserts, one store fetch
//!     │
//!     └──> Property-set index (commit publishes to searchers)
//!
//! Maintenance (IndexOperationManager)
//!     ├──> Consistency check: merge-join of index and store
//!     └──> Reindex: direct, or through a secondary index
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vtk_indexer::{
//!     IncrementalUpdater, MemoryChangeLog, MemoryPropertySetIndex, MemoryResourceStore,
//!     UpdaterConfig,
//! };
//!
//! let index = Arc::new(MemoryPropertySetIndex::new("main"));
//! let store = Arc::new(MemoryResourceStore::new());
//! let change_log = Arc::new(MemoryChangeLog::new());
//!
//! let updater = IncrementalUpdater::new(&UpdaterConfig::default(), index, store, change_log);
//! println!("{:?}", updater.update());
//! ```

mod change_log;
mod config;
mod consistency;
mod error;
mod index;
mod manager;
mod memory_index;
mod reindexer;
mod scheduler;
mod status;
mod store;
mod types;
mod updater;

pub use change_log::{ChangeLogSource, MemoryChangeLog};
pub use config::{
    IndexConfig, IndexerConfig, UpdaterConfig, DEFAULT_MAX_CHANGES_PER_UPDATE,
    DEFAULT_UPDATE_INTERVAL_MS,
};
pub use consistency::{ConsistencyCheck, ConsistencyError, ConsistencyReport};
pub use error::{IndexError, OperationRejected, Result};
pub use index::{IndexLock, IndexLockGuard, PropertySetIndex};
pub use manager::{
    BackgroundTask, Execution, IndexOperationManager, Launched, CONSISTENCY_CHECK_THREAD_NAME,
    LOCK_QUERY_TIMEOUT, REINDEX_THREAD_NAME,
};
pub use memory_index::{MemoryPropertySetIndex, PersistedIndexSnapshot};
pub use reindexer::{DirectReindexer, IndirectReindexer, PropertySetIndexReindexer};
pub use scheduler::{CycleKind, UpdateCycle, UpdateScheduler, UpdaterHealth};
pub use status::{
    ConsistencyCheckStatus, IndexOperationStatus, ReindexStatus, INDEX_STATUS_SCHEMA_VERSION,
};
pub use store::{IndexDao, MemoryResourceStore, PropertySetStream};
pub use types::{
    is_in_tree, AuthorizedPropertySet, ChangeLogEntry, ChangeOperation, LoggerPartition,
    PrincipalSet, Property, PropertySet, PropertyValue, ROOT_URI,
};
pub use updater::{IncrementalUpdater, UpdateOutcome, UpdateStats};
