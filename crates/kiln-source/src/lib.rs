//! Sources turn external inputs into committed cache snapshots.
//!
//! A [`SourceRegistry`] maps identifier schemes to [`Source`]
//! implementations; resolving an identifier yields a [`SourceHandler`] that
//! can compute a cache key without touching the filesystem and materialize
//! an immutable snapshot when the key misses. The shipped implementation is
//! [`LocalDirectorySource`], which snapshots host directories incrementally
//! through a per-shared-key mutable ref.

mod error;
mod identifier;
mod local;
mod registry;

pub use crate::error::{Result, SourceError};
pub use crate::identifier::{LocalDirectoryIdentifier, SourceIdentifier, LOCAL_SCHEME};
pub use crate::local::{LocalDirectorySource, LocalSourceOpt, SHARED_KEY_RECORD_KEY};
pub use crate::registry::{Source, SourceHandler, SourceRegistry};
