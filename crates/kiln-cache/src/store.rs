use crate::error::StoreError;
use crate::metadata::{MetadataStore, MetadataValue, StorageItem};
use crate::mount::Mount;
use crate::util::{now_millis, remove_dir_all_nofollow};
use fs2::FileExt as _;
use kiln_core::BuildContext;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const KEY_KIND: &str = "cache.kind";
pub(crate) const KEY_DESCRIPTION: &str = "cache.description";
pub(crate) const KEY_CREATED_AT: &str = "cache.created_at";
pub(crate) const KEY_POLICY: &str = "cache.policy";
pub(crate) const KEY_COMMITTED_FROM: &str = "cache.committed_from";
pub(crate) const KEY_RELEASED_AT: &str = "cache.released_at";

/// Opaque identifier of a ref, stored as a lowercase hex string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefId(String);

impl RefId {
    /// Wrap an id previously produced by [`RefId::generate`] (e.g. read back
    /// from a record or an index entry).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh id: 128 bits derived from pid, wall clock and a process-local
    /// counter. No coordination beyond the counter.
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        let mut hasher = Sha256::new();
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(nanos.to_le_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RefKind {
    Mutable,
    Committed,
}

/// What happens to a ref's payload once it is released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Keep the payload on disk; reclamation is an explicit prune.
    #[default]
    Retain,
}

#[derive(Clone, Debug, Default)]
pub struct NewRefOptions {
    /// Human-readable tag recorded on the ref ("local source for src", ...).
    pub description: String,
    pub policy: CachePolicy,
}

/// The seam through which callers create and re-acquire mutable refs.
///
/// The local store is the shipped implementation; wrappers can layer
/// instrumentation or policy on top without the source layer noticing.
pub trait CacheAccessor: Send + Sync {
    fn new_mutable(
        &self,
        ctx: &BuildContext,
        options: NewRefOptions,
    ) -> Result<MutableRef, StoreError>;

    /// Re-acquire an existing mutable ref by id.
    ///
    /// Fails with [`StoreError::NotFound`] when the ref has no record or its
    /// payload is gone, and [`StoreError::InUse`] when another live call (in
    /// this or another process) holds it.
    fn get_mutable(&self, ctx: &BuildContext, id: &RefId) -> Result<MutableRef, StoreError>;
}

/// On-disk ref store: one directory per ref under `root`, bookkeeping in a
/// shared [`MetadataStore`].
///
/// Layout per ref: `root/<id>/fs` (payload tree) and `root/<id>/lock` (lock
/// file). Acquisition is exclusive through an in-process active set plus an
/// fs2 lock on the lock file, so two threads or two processes can never hold
/// the same mutable ref at once. Both are freed when the ref handle drops.
#[derive(Clone)]
pub struct LocalRefStore {
    shared: Arc<StoreShared>,
}

pub(crate) struct StoreShared {
    root: PathBuf,
    pub(crate) metadata: MetadataStore,
    active: Mutex<HashSet<RefId>>,
}

impl fmt::Debug for LocalRefStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRefStore")
            .field("root", &self.shared.root)
            .finish_non_exhaustive()
    }
}

impl LocalRefStore {
    /// Open (creating if needed) the store rooted at `root`.
    ///
    /// `metadata` is shared deliberately: sources attach their own keys (e.g.
    /// shared-key index entries) to the same records this store maintains.
    pub fn open(root: impl AsRef<Path>, metadata: MetadataStore) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            shared: Arc::new(StoreShared {
                root,
                metadata,
                active: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn metadata(&self) -> MetadataStore {
        self.shared.metadata.clone()
    }

    pub(crate) fn shared(&self) -> &Arc<StoreShared> {
        &self.shared
    }
}

impl CacheAccessor for LocalRefStore {
    fn new_mutable(
        &self,
        ctx: &BuildContext,
        options: NewRefOptions,
    ) -> Result<MutableRef, StoreError> {
        let id = RefId::generate();
        fs::create_dir_all(self.shared.ref_fs_dir(&id))?;
        let lease = self.shared.acquire(&id)?;

        let kind = MetadataValue::new(&RefKind::Mutable, None)?;
        let description = MetadataValue::new(&options.description, None)?;
        let created_at = MetadataValue::new(&now_millis(), None)?;
        let policy = MetadataValue::new(&options.policy, None)?;
        self.shared.metadata.get(&id).update(|record| {
            record.insert(KEY_KIND.to_owned(), kind);
            record.insert(KEY_DESCRIPTION.to_owned(), description);
            record.insert(KEY_CREATED_AT.to_owned(), created_at);
            record.insert(KEY_POLICY.to_owned(), policy);
        })?;

        tracing::debug!(
            target = "kiln.cache",
            ref_id = %id,
            description = %options.description,
            session = ctx.session().map(|s| s.as_str()),
            "created mutable ref"
        );

        Ok(MutableRef {
            id,
            shared: Arc::clone(&self.shared),
            _lease: lease,
        })
    }

    fn get_mutable(&self, ctx: &BuildContext, id: &RefId) -> Result<MutableRef, StoreError> {
        let item = self.shared.metadata.get(id);
        let Some(kind) = item.get_json::<RefKind>(KEY_KIND)? else {
            return Err(StoreError::NotFound { id: id.clone() });
        };
        if kind != RefKind::Mutable {
            return Err(StoreError::NotMutable { id: id.clone() });
        }

        let lease = self.shared.acquire(id)?;
        // Stale record: the payload may have been reaped out from under it.
        if !self.shared.ref_fs_dir(id).is_dir() {
            return Err(StoreError::NotFound { id: id.clone() });
        }

        tracing::debug!(
            target = "kiln.cache",
            ref_id = %id,
            session = ctx.session().map(|s| s.as_str()),
            "acquired existing mutable ref"
        );

        Ok(MutableRef {
            id: id.clone(),
            shared: Arc::clone(&self.shared),
            _lease: lease,
        })
    }
}

impl StoreShared {
    pub(crate) fn ref_dir(&self, id: &RefId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub(crate) fn ref_fs_dir(&self, id: &RefId) -> PathBuf {
        self.ref_dir(id).join("fs")
    }

    fn ref_lock_path(&self, id: &RefId) -> PathBuf {
        self.ref_dir(id).join("lock")
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    /// Take the exclusive lease on `id`, or fail with `InUse`.
    pub(crate) fn acquire(self: &Arc<Self>, id: &RefId) -> Result<RefLease, StoreError> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if active.contains(id) {
            return Err(StoreError::InUse { id: id.clone() });
        }

        let lock_path = self.ref_lock_path(id);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                return Err(StoreError::InUse { id: id.clone() });
            }
            Err(err) => return Err(err.into()),
        }

        active.insert(id.clone());
        Ok(RefLease {
            shared: Arc::clone(self),
            id: id.clone(),
            file,
        })
    }
}

/// Holds both halves of a ref's exclusivity; dropping it frees them.
pub(crate) struct RefLease {
    shared: Arc<StoreShared>,
    id: RefId,
    file: fs::File,
}

impl Drop for RefLease {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let mut active = self
            .shared
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.id);
    }
}

/// Exclusive handle on a mutable ref's working tree.
///
/// Dropping the handle without committing or releasing frees exclusivity, so
/// a panicking or cancelled caller never wedges the ref.
pub struct MutableRef {
    id: RefId,
    shared: Arc<StoreShared>,
    _lease: RefLease,
}

impl fmt::Debug for MutableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableRef").field("id", &self.id).finish()
    }
}

impl MutableRef {
    pub fn id(&self) -> &RefId {
        &self.id
    }

    /// The ref's metadata record.
    pub fn metadata(&self) -> StorageItem {
        self.shared.metadata.get(&self.id)
    }

    /// A mount of the working tree.
    pub fn mount(&self, _ctx: &BuildContext, read_only: bool) -> Result<Mount, StoreError> {
        let path = self.shared.ref_fs_dir(&self.id);
        if !path.is_dir() {
            return Err(StoreError::NotFound {
                id: self.id.clone(),
            });
        }
        Ok(Mount { path, read_only })
    }

    /// Freeze the current tree into a fresh immutable ref.
    ///
    /// The clone hard-links files (directories and symlinks are recreated), so
    /// committing is cheap regardless of tree size. The mutable ref survives:
    /// its record and tree stay behind and it becomes re-acquirable, which is
    /// what lets the next snapshot reuse the same working tree. Writers must
    /// replace files with fresh inodes (temp + rename), never in place, or
    /// they would reach through the hard links into committed trees.
    pub fn commit(self, _ctx: &BuildContext) -> Result<ImmutableRef, StoreError> {
        let new_id = RefId::generate();

        // Encode the record up front so a serialization failure cannot leave a
        // half-registered clone behind.
        let kind = MetadataValue::new(&RefKind::Committed, None)?;
        let created_at = MetadataValue::new(&now_millis(), None)?;
        let committed_from = MetadataValue::new(&self.id, None)?;
        let description = self.metadata().get(KEY_DESCRIPTION);

        let src = self.shared.ref_fs_dir(&self.id);
        let dst = self.shared.ref_fs_dir(&new_id);
        if let Err(err) = clone_tree(&src, &dst) {
            remove_partial_clone(&self.shared, &new_id);
            return Err(err.into());
        }

        let update = self.shared.metadata.get(&new_id).update(|record| {
            record.insert(KEY_KIND.to_owned(), kind);
            record.insert(KEY_CREATED_AT.to_owned(), created_at);
            record.insert(KEY_COMMITTED_FROM.to_owned(), committed_from);
            if let Some(description) = description {
                record.insert(KEY_DESCRIPTION.to_owned(), description);
            }
        });
        if let Err(err) = update {
            remove_partial_clone(&self.shared, &new_id);
            return Err(err);
        }

        tracing::debug!(
            target = "kiln.cache",
            from = %self.id,
            to = %new_id,
            "committed ref"
        );

        Ok(ImmutableRef {
            id: new_id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Give the ref back without committing.
    ///
    /// Cheap and infallible: exclusivity is dropped with the lease, and the
    /// retain policy keeps the record and payload for later reuse. Safe to
    /// call from a detached cleanup thread.
    pub fn release(self, _ctx: &BuildContext) {}
}

fn remove_partial_clone(shared: &StoreShared, id: &RefId) {
    if let Err(err) = remove_dir_all_nofollow(&shared.ref_dir(id)) {
        tracing::debug!(
            target = "kiln.cache",
            ref_id = %id,
            error = %err,
            "failed to remove partial commit clone"
        );
    }
}

/// Shared handle on a committed, immutable snapshot tree.
#[derive(Clone)]
pub struct ImmutableRef {
    id: RefId,
    shared: Arc<StoreShared>,
}

impl fmt::Debug for ImmutableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImmutableRef")
            .field("id", &self.id)
            .finish()
    }
}

impl ImmutableRef {
    pub fn id(&self) -> &RefId {
        &self.id
    }

    pub fn metadata(&self) -> StorageItem {
        self.shared.metadata.get(&self.id)
    }

    /// A read-only mount of the snapshot tree.
    pub fn mount(&self, _ctx: &BuildContext) -> Result<Mount, StoreError> {
        let path = self.shared.ref_fs_dir(&self.id);
        if !path.is_dir() {
            return Err(StoreError::NotFound {
                id: self.id.clone(),
            });
        }
        Ok(Mount {
            path,
            read_only: true,
        })
    }

    /// Mark the snapshot released. The payload is retained on disk until a
    /// prune reaps it.
    pub fn release(self, _ctx: &BuildContext) -> Result<(), StoreError> {
        self.shared
            .metadata
            .get(&self.id)
            .set_value(KEY_RELEASED_AT, &now_millis(), None)
    }
}

fn clone_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        let ty = entry.file_type();
        if ty.is_dir() {
            fs::create_dir_all(&target)?;
            let perms = entry.metadata().map_err(io::Error::other)?.permissions();
            fs::set_permissions(&target, perms)?;
        } else if ty.is_symlink() {
            let link = fs::read_link(entry.path())?;
            recreate_symlink(&link, &target)?;
        } else {
            fs::hard_link(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn recreate_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn recreate_symlink(target: &Path, link: &Path) -> io::Result<()> {
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn open_store(dir: &Path) -> LocalRefStore {
        let metadata = MetadataStore::open(dir.join("meta.bin")).unwrap();
        LocalRefStore::open(dir.join("refs"), metadata).unwrap()
    }

    fn ctx() -> BuildContext {
        BuildContext::detached()
    }

    #[test]
    fn new_mutable_creates_tree_and_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let mutable = store
            .new_mutable(
                &ctx(),
                NewRefOptions {
                    description: "local source for src".to_owned(),
                    policy: CachePolicy::Retain,
                },
            )
            .unwrap();

        let mount = mutable.mount(&ctx(), false).unwrap();
        assert!(mount.path.is_dir());
        assert!(!mount.read_only);
        assert_eq!(
            mutable
                .metadata()
                .get_json::<String>(KEY_DESCRIPTION)
                .unwrap()
                .unwrap(),
            "local source for src"
        );
    }

    #[test]
    fn held_refs_are_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let mutable = store.new_mutable(&ctx(), NewRefOptions::default()).unwrap();
        let id = mutable.id().clone();

        match store.get_mutable(&ctx(), &id) {
            Err(StoreError::InUse { id: in_use }) => assert_eq!(in_use, id),
            other => panic!("expected in-use, got {other:?}"),
        }

        mutable.release(&ctx());
        let reacquired = store.get_mutable(&ctx(), &id).unwrap();
        assert_eq!(reacquired.id(), &id);
    }

    #[test]
    fn dropping_a_ref_frees_exclusivity() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let mutable = store.new_mutable(&ctx(), NewRefOptions::default()).unwrap();
        let id = mutable.id().clone();
        drop(mutable);

        assert!(store.get_mutable(&ctx(), &id).is_ok());
    }

    #[test]
    fn unknown_and_stale_refs_read_as_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let missing = RefId::generate();
        assert!(matches!(
            store.get_mutable(&ctx(), &missing),
            Err(StoreError::NotFound { .. })
        ));

        // Record exists but the payload tree is gone.
        let mutable = store.new_mutable(&ctx(), NewRefOptions::default()).unwrap();
        let id = mutable.id().clone();
        mutable.release(&ctx());
        remove_dir_all_nofollow(&store.shared().ref_fs_dir(&id)).unwrap();
        assert!(matches!(
            store.get_mutable(&ctx(), &id),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn committed_refs_are_not_mutable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let mutable = store.new_mutable(&ctx(), NewRefOptions::default()).unwrap();
        let committed = mutable.commit(&ctx()).unwrap();

        assert!(matches!(
            store.get_mutable(&ctx(), committed.id()),
            Err(StoreError::NotMutable { .. })
        ));
    }

    #[test]
    fn commit_clones_the_tree_and_frees_the_mutable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let mutable = store.new_mutable(&ctx(), NewRefOptions::default()).unwrap();
        let mutable_id = mutable.id().clone();
        let tree = mutable.mount(&ctx(), false).unwrap().path;
        fs::create_dir(tree.join("sub")).unwrap();
        fs::write(tree.join("sub/a.txt"), b"hello").unwrap();

        let committed = mutable.commit(&ctx()).unwrap();
        assert_ne!(committed.id(), &mutable_id);

        let snapshot = committed.mount(&ctx()).unwrap();
        assert!(snapshot.read_only);
        assert_eq!(fs::read(snapshot.path.join("sub/a.txt")).unwrap(), b"hello");
        assert_eq!(
            committed
                .metadata()
                .get_json::<RefId>(KEY_COMMITTED_FROM)
                .unwrap()
                .unwrap(),
            mutable_id
        );

        // The working tree is re-acquirable after commit.
        assert!(store.get_mutable(&ctx(), &mutable_id).is_ok());
    }

    #[test]
    fn committed_tree_is_isolated_from_later_rewrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let mutable = store.new_mutable(&ctx(), NewRefOptions::default()).unwrap();
        let tree = mutable.mount(&ctx(), false).unwrap().path;
        fs::write(tree.join("a.txt"), b"hello").unwrap();
        let committed = mutable.commit(&ctx()).unwrap();

        // Replace via a fresh inode, the way the copier writes.
        let tmp_file = tree.join("a.txt.tmp");
        let mut file = fs::File::create(&tmp_file).unwrap();
        file.write_all(b"hello2").unwrap();
        drop(file);
        fs::rename(&tmp_file, tree.join("a.txt")).unwrap();

        let snapshot = committed.mount(&ctx()).unwrap();
        assert_eq!(fs::read(snapshot.path.join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(tree.join("a.txt")).unwrap(), b"hello2");
    }

    #[cfg(unix)]
    #[test]
    fn commit_recreates_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let mutable = store.new_mutable(&ctx(), NewRefOptions::default()).unwrap();
        let tree = mutable.mount(&ctx(), false).unwrap().path;
        fs::write(tree.join("target.txt"), b"data").unwrap();
        std::os::unix::fs::symlink("target.txt", tree.join("link")).unwrap();

        let committed = mutable.commit(&ctx()).unwrap();
        let snapshot = committed.mount(&ctx()).unwrap();
        let link = snapshot.path.join("link");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("target.txt"));
    }

    #[test]
    fn release_marks_immutable_refs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let mutable = store.new_mutable(&ctx(), NewRefOptions::default()).unwrap();
        let committed = mutable.commit(&ctx()).unwrap();
        let item = committed.metadata();
        assert!(item.get(KEY_RELEASED_AT).is_none());

        committed.release(&ctx()).unwrap();
        assert!(item.get_json::<u64>(KEY_RELEASED_AT).unwrap().is_some());
    }

    #[test]
    fn exclusivity_holds_across_store_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        let mutable = store.new_mutable(&ctx(), NewRefOptions::default()).unwrap();
        let id = mutable.id().clone();

        // A second store over the same root (fresh metadata handle, same
        // files) sees the ref as in use through the lock file.
        let other = open_store(tmp.path());
        assert!(matches!(
            other.get_mutable(&ctx(), &id),
            Err(StoreError::InUse { .. })
        ));

        mutable.release(&ctx());
        assert!(other.get_mutable(&ctx(), &id).is_ok());
    }
}
