//! Filtered, incremental directory synchronization.
//!
//! [`sync_dir`] makes a destination tree mirror a filtered view of a source
//! tree. Files whose stat signature (size, mtime, mode) is unchanged are
//! skipped, changed files are replaced through rename so the destination
//! never rewrites an existing inode, and stale destination entries are
//! deleted. A [`CopyVisitor`] receives a callback per entry, which is how
//! content hashing stays in step with the tree without a second walk.

mod copy;
mod error;
mod filter;

pub use crate::copy::{sync_dir, CopySummary, CopyVisitor, NoopVisitor};
pub use crate::error::{CopyError, Result};
pub use crate::filter::CopyFilter;
