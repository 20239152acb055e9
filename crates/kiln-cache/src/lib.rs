//! Snapshot cache layer: mutable working trees, committed immutable
//! snapshots, and the persistent metadata that ties them together.
//!
//! The building blocks:
//! - a ref store ([`LocalRefStore`]) handing out exclusive [`MutableRef`]s and
//!   shareable [`ImmutableRef`]s
//! - a shared, indexed [`MetadataStore`] holding one record per ref, where
//!   both the store's own bookkeeping and source-defined keys live
//! - incremental per-file content hashing ([`ContentHashContext`]) persisted
//!   on the ref so unchanged files are never rehashed
//! - mount handles ([`Mount`], [`LocalMounter`]) with a guaranteed-unmount
//!   guard
//! - an explicit [`PrunePolicy`]-driven reaper for released snapshots
//!
//! ## On-disk layout
//!
//! The metadata store is a single versioned bincode file, rewritten atomically
//! on every mutation. Ref payloads live under the store root:
//! - `<root>/<ref_id>/fs`: the payload tree
//! - `<root>/<ref_id>/lock`: fs2 lock file backing exclusive acquisition
//!
//! Committing hard-links `fs` into a fresh ref directory, so snapshots are
//! cheap and share file bytes with the working tree they were taken from.

mod contenthash;
mod digest;
mod error;
mod metadata;
mod mount;
mod prune;
mod store;
mod util;

pub use contenthash::{ContentHashContext, EntryKind, HashEntry, CONTENT_HASH_KEY};
pub use digest::ContentDigest;
pub use error::{MountError, Result, StoreError};
pub use metadata::{
    MetadataRecord, MetadataStore, MetadataStoreStats, MetadataValue, StorageItem,
    METADATA_SCHEMA_VERSION,
};
pub use mount::{LocalMounter, Mount};
pub use prune::{PruneFailure, PrunePolicy, PruneReport};
pub use store::{
    CacheAccessor, CachePolicy, ImmutableRef, LocalRefStore, MutableRef, NewRefOptions, RefId,
};
pub use util::{atomic_write, now_millis, BINCODE_PAYLOAD_LIMIT_BYTES};
