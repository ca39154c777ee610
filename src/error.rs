use thiserror::Error;
use uuid::Uuid;

use crate::vault::VaultError;

/// Engine-level error taxonomy. Subsystem errors convert into this via
/// `#[from]`; the remaining variants are raised directly by the engine.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Worker unavailable")]
    WorkerUnavailable,

    #[error("Disk write failed after {attempts} attempt(s): {message}")]
    DiskWriteFailed { attempts: u32, message: String },

    #[error("Disk read failed: {0}")]
    DiskReadFailed(String),

    #[error("Operation timed out: {0}")]
    OperationTimeout(String),

    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Path already claimed by note {existing}: {path}")]
    PathConflict { path: String, existing: Uuid },

    #[error("Note not found: {0}")]
    NoteNotFound(Uuid),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Task cancelled")]
    Cancelled,
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, HistoryError>;
