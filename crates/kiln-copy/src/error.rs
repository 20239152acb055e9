use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CopyError>;

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("invalid filter pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("entry {path:?} escapes the tree root {root:?}")]
    PathOutsideRoot { path: PathBuf, root: PathBuf },

    #[error("synchronization cancelled")]
    Cancelled,
}

impl CopyError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CopyError::Cancelled)
    }
}
