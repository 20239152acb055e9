use crate::store::RefId;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by the ref store and its persistent metadata.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("incompatible metadata schema version: expected {expected}, found {found}")]
    IncompatibleSchemaVersion { expected: u32, found: u32 },

    #[error("ref {id} not found")]
    NotFound { id: RefId },

    #[error("ref {id} is in use")]
    InUse { id: RefId },

    #[error("ref {id} is not mutable")]
    NotMutable { id: RefId },

    #[error("path {path} is not under store root {root}")]
    PathNotUnderStoreRoot { path: PathBuf, root: PathBuf },
}

impl StoreError {
    /// True for the "ref is gone" family of failures that callers treat as a
    /// miss rather than an error (a stale index entry, a reaped payload).
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self, StoreError::InUse { .. })
    }
}

/// Errors produced by mounting and unmounting ref trees.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mount target {path} does not exist")]
    MissingTarget { path: PathBuf },

    #[error("mount for {path} is already active")]
    AlreadyMounted { path: PathBuf },
}
