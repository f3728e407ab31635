use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Workspace is locked by another process (pid {pid}): {workspace}")]
    WorkspaceLocked { pid: u32, workspace: String },

    #[error("Cache corrupt: {0}")]
    CacheCorrupt(String),

    #[error("Cache version mismatch: found {found}, expected {expected}")]
    CacheVersionMismatch { found: u32, expected: u32 },

    #[error("Embedding model mismatch: cache built with '{cached}', config wants '{configured}'")]
    ModelMismatch { cached: String, configured: String },

    #[error("Failed to load embedding model: {0}")]
    ModelLoadFailed(String),

    #[error("Embedding batch timed out after {0:?}")]
    BatchTimeout(std::time::Duration),

    #[error("Embedding child process crashed: {0}")]
    ChildCrashed(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Failed to read file {path}: {detail}")]
    FileReadError { path: String, detail: String },

    #[error("File too large: {path} ({size} bytes, limit {limit})")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    #[error("File watcher error: {0}")]
    WatcherError(String),

    #[error("indexing is in progress")]
    IndexInProgress,

    #[error("a save is in progress")]
    SaveInProgress,

    #[error("ANN index unavailable: {0}")]
    AnnUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable kind string, used in tool results and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ConfigInvalid(_) => "ConfigInvalid",
            EngineError::WorkspaceLocked { .. } => "WorkspaceLocked",
            EngineError::CacheCorrupt(_) => "CacheCorrupt",
            EngineError::CacheVersionMismatch { .. } => "CacheVersionMismatch",
            EngineError::ModelMismatch { .. } => "ModelMismatch",
            EngineError::ModelLoadFailed(_) => "ModelLoadFailed",
            EngineError::BatchTimeout(_) => "BatchTimeout",
            EngineError::ChildCrashed(_) => "ChildCrashed",
            EngineError::DimensionMismatch { .. } => "DimensionMismatch",
            EngineError::FileReadError { .. } => "FileReadError",
            EngineError::FileTooLarge { .. } => "FileTooLarge",
            EngineError::WatcherError(_) => "WatcherError",
            EngineError::IndexInProgress => "IndexInProgress",
            EngineError::SaveInProgress => "SaveInProgress",
            EngineError::AnnUnavailable(_) => "AnnUnavailable",
            EngineError::Cancelled => "Cancelled",
            EngineError::Io(_) => "Io",
            EngineError::Serde(_) => "Serde",
            EngineError::Internal(_) => "Internal",
        }
    }

}

pub type EngineResult<T> = Result<T, EngineError>;
