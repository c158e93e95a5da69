use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Index '{0}' is closed")]
    Closed(String),

    #[error("Index '{0}' is not locked")]
    NotLocked(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Change log error: {0}")]
    ChangeLog(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Rejected(#[from] OperationRejected),

    #[error("Worker '{0}' panicked")]
    WorkerPanicked(String),

    #[error("{0}")]
    Other(String),
}

/// Administrative precondition violations. Returned synchronously, before the
/// index is touched.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationRejected {
    #[error("Consistency check is already running")]
    ConsistencyCheckRunning,

    #[error("Reindexing is already running")]
    ReindexRunning,

    #[error("Index is closed")]
    IndexClosed,

    #[error("No consistency check results to repair")]
    NothingToRepair,
}
