use kiln_cache::{MountError, StoreError};
use kiln_copy::CopyError;

pub type Result<T> = std::result::Result<T, SourceError>;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The operation needs a session and neither the identifier nor the
    /// build context carries one.
    #[error("no session attached to the build context")]
    NoSession,

    #[error("invalid source identifier: {0}")]
    InvalidIdentifier(String),

    #[error("cache store error: {0}")]
    Store(#[from] StoreError),

    #[error("mount error: {0}")]
    Mount(#[from] MountError),

    #[error("copy error: {0}")]
    Copy(#[from] CopyError),

    /// The tree was built and hashed but committing it failed. Kept apart
    /// from [`SourceError::Store`] so callers can tell a lost commit from a
    /// failure earlier in the pipeline.
    #[error("snapshot commit failed: {0}")]
    Commit(StoreError),
}

impl SourceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SourceError::Copy(err) if err.is_cancelled())
    }
}
