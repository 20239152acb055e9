use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use kiln_cache::{
    CacheAccessor, ContentDigest, ContentHashContext, ImmutableRef, LocalMounter, MetadataStore,
    MutableRef, NewRefOptions, StorageItem, StoreError,
};
use kiln_copy::{sync_dir, CopyFilter, CopyVisitor};
use kiln_core::{BuildContext, SessionId};

use crate::error::SourceError;
use crate::identifier::{LocalDirectoryIdentifier, SourceIdentifier, LOCAL_SCHEME};
use crate::registry::{Source, SourceHandler};

/// Record key under which a ref carries its shared key. The value doubles
/// as the record's index, which is how `snapshot` finds reusable refs.
pub const SHARED_KEY_RECORD_KEY: &str = "local.shared_key";

pub struct LocalSourceOpt {
    pub cache: Arc<dyn CacheAccessor>,
    pub metadata: MetadataStore,
    /// Name to host-path mapping of the directories this daemon exposes.
    pub dirs: BTreeMap<String, PathBuf>,
}

/// Source for directories on the local host.
///
/// Each snapshot keeps one mutable ref per shared key alive in the store
/// and resynchronizes it incrementally, so an unchanged directory costs a
/// stat walk instead of a copy. Committing hard-link-clones the tree, which
/// leaves the mutable ref behind for the next build.
pub struct LocalDirectorySource {
    shared: Arc<SourceShared>,
}

struct SourceShared {
    cache: Arc<dyn CacheAccessor>,
    metadata: MetadataStore,
    dirs: BTreeMap<String, PathBuf>,
}

impl SourceShared {
    fn host_path(&self, name: &str) -> Result<&Path, SourceError> {
        self.dirs.get(name).map(PathBuf::as_path).ok_or_else(|| {
            SourceError::InvalidIdentifier(format!(
                "no local directory named {name:?} is configured"
            ))
        })
    }
}

impl LocalDirectorySource {
    pub fn new(opt: LocalSourceOpt) -> Self {
        LocalDirectorySource {
            shared: Arc::new(SourceShared {
                cache: opt.cache,
                metadata: opt.metadata,
                dirs: opt.dirs,
            }),
        }
    }
}

impl Source for LocalDirectorySource {
    fn scheme(&self) -> &'static str {
        LOCAL_SCHEME
    }

    fn resolve(
        &self,
        _ctx: &BuildContext,
        id: &SourceIdentifier,
    ) -> Result<Box<dyn SourceHandler>, SourceError> {
        match id {
            SourceIdentifier::LocalDirectory(local) => Ok(Box::new(LocalDirectoryHandler {
                shared: Arc::clone(&self.shared),
                id: local.clone(),
            })),
        }
    }
}

struct LocalDirectoryHandler {
    shared: Arc<SourceShared>,
    id: LocalDirectoryIdentifier,
}

#[derive(Serialize)]
struct CacheKeyPayload<'a> {
    session_id: &'a str,
    include_patterns: &'a [String],
    exclude_patterns: &'a [String],
}

impl LocalDirectoryHandler {
    fn session_for_key(&self, ctx: &BuildContext) -> Result<SessionId, SourceError> {
        if let Some(session) = &self.id.session_id {
            return Ok(session.clone());
        }
        ctx.session().cloned().ok_or(SourceError::NoSession)
    }

    fn shared_key(&self, host_path: &Path) -> String {
        format!(
            "local.shared_key:{}:{}:{}",
            self.id.name,
            self.id.shared_key_hint,
            host_path.display()
        )
    }

    /// The first acquirable indexed ref wins; otherwise a fresh one is
    /// created.
    fn reuse_or_create(
        &self,
        ctx: &BuildContext,
        shared_key: &str,
    ) -> Result<MutableRef, SourceError> {
        for item in self.shared.metadata.search(shared_key) {
            match self.shared.cache.get_mutable(ctx, item.id()) {
                Ok(mutable) => {
                    tracing::debug!(
                        target = "kiln.source",
                        id = %mutable.id(),
                        "reusing indexed snapshot ref"
                    );
                    return Ok(mutable);
                }
                Err(err) if err.is_not_found() || err.is_in_use() => {
                    tracing::debug!(
                        target = "kiln.source",
                        id = %item.id(),
                        error = %err,
                        "skipping indexed ref"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        let options = NewRefOptions {
            description: format!("local source for {}", self.id.name),
            ..Default::default()
        };
        Ok(self.shared.cache.new_mutable(ctx, options)?)
    }

    /// Mount the working tree, synchronize it from the host directory,
    /// then persist the hash state and the shared-key link.
    fn sync_into(
        &self,
        ctx: &BuildContext,
        mutable: &MutableRef,
        host_path: &Path,
        shared_key: &str,
    ) -> Result<(), SourceError> {
        let filter = CopyFilter::new(&self.id.include_patterns, &self.id.exclude_patterns)?;

        let mut mounter = LocalMounter::new(mutable.mount(ctx, false)?);
        let tree_root = mounter.mount()?;

        let item = mutable.metadata();
        let mut hashes = ContentHashContext::load(&item);
        let mut visitor = HashingVisitor {
            hashes: &mut hashes,
        };
        let summary = sync_dir(ctx, host_path, &tree_root, &filter, &mut visitor)?;

        // The tree must be on disk before any state derived from it.
        mounter.unmount()?;
        hashes.save(&item)?;

        self.link_shared_key(&item, shared_key)?;

        tracing::debug!(
            target = "kiln.source",
            id = %mutable.id(),
            files_copied = summary.files_copied,
            files_unchanged = summary.files_unchanged,
            entries_removed = summary.entries_removed,
            "synchronized local source"
        );
        Ok(())
    }

    /// Write-and-index the shared key, skipping the write when the record
    /// already carries it. Reused refs therefore cost no mutation here,
    /// and a failed first build leaves no index entry behind.
    ///
    /// Two racing snapshots of one shared key can both reach this point on
    /// separate refs; the last index write wins and the loser's ref stays
    /// reachable only by id. Dedup is best-effort, not a guarantee.
    fn link_shared_key(&self, item: &StorageItem, shared_key: &str) -> Result<(), StoreError> {
        let existing: Option<String> = item.get_json(SHARED_KEY_RECORD_KEY)?;
        if existing.as_deref() == Some(shared_key) {
            return Ok(());
        }
        item.set_value(SHARED_KEY_RECORD_KEY, &shared_key, Some(shared_key))
    }
}

impl SourceHandler for LocalDirectoryHandler {
    fn cache_key(&self, ctx: &BuildContext) -> Result<String, SourceError> {
        let session = self.session_for_key(ctx)?;
        self.shared.host_path(&self.id.name)?;
        let payload = serde_json::to_string(&CacheKeyPayload {
            session_id: session.as_str(),
            include_patterns: &self.id.include_patterns,
            exclude_patterns: &self.id.exclude_patterns,
        })
        .map_err(StoreError::from)?;
        let digest = ContentDigest::from_bytes(payload.as_bytes());
        Ok(format!("session:{}:{}:{}", session, self.id.name, digest))
    }

    fn snapshot(&self, ctx: &BuildContext) -> Result<ImmutableRef, SourceError> {
        // Snapshots always run under the caller's own session; the
        // identifier override only affects keys.
        if ctx.session().is_none() {
            return Err(SourceError::NoSession);
        }
        let host_path = self.shared.host_path(&self.id.name)?.to_path_buf();
        let shared_key = self.shared_key(&host_path);

        let mutable = self.reuse_or_create(ctx, &shared_key)?;
        if let Err(err) = self.sync_into(ctx, &mutable, &host_path, &shared_key) {
            release_detached(ctx, mutable);
            return Err(err);
        }
        mutable.commit(ctx).map_err(SourceError::Commit)
    }
}

/// Hands the failed ref to a detached thread for release, so surfacing the
/// error never waits on store cleanup.
fn release_detached(ctx: &BuildContext, mutable: MutableRef) {
    tracing::debug!(
        target = "kiln.source",
        id = %mutable.id(),
        "releasing snapshot ref after failure"
    );
    let ctx = ctx.clone();
    std::thread::spawn(move || mutable.release(&ctx));
}

/// Feeds copier events into the incremental hash state.
struct HashingVisitor<'a> {
    hashes: &'a mut ContentHashContext,
}

impl CopyVisitor for HashingVisitor<'_> {
    fn changed(&mut self, rel: &str, dest: &Path) -> io::Result<()> {
        self.hashes.changed(rel, dest)
    }

    fn unchanged(&mut self, rel: &str, dest: &Path) -> io::Result<()> {
        self.hashes.unchanged(rel, dest)
    }

    fn removed(&mut self, rel: &str) -> io::Result<()> {
        self.hashes.removed(rel);
        Ok(())
    }
}
