use crate::error::StoreError;
use crate::store::{LocalRefStore, RefId, RefKind, StoreShared, KEY_KIND, KEY_RELEASED_AT};
use crate::util::{
    dir_size_bytes_nofollow, now_millis, remove_dir_all_nofollow, unique_sibling_path,
};
use kiln_core::BuildContext;
use serde::Serialize;
use std::fs;
use std::io;

/// Policy for reclaiming released snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PrunePolicy {
    /// Minimum time since release before a snapshot is reaped.
    pub max_age_ms: u64,
}

/// Result summary of a prune run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed: Vec<RefId>,
    /// Best-effort bytes freed (payload tree sizes of removed refs).
    pub reclaimed_bytes: u64,
    pub failed: Vec<PruneFailure>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PruneFailure {
    pub id: RefId,
    pub error: String,
}

impl LocalRefStore {
    /// Remove committed refs that were released longer ago than
    /// `policy.max_age_ms`, reclaiming their payload and record.
    ///
    /// Releasing a snapshot is the caller's promise that it is done with it;
    /// age is the grace period. Mutable refs are never touched here, refs
    /// whose lock is held are skipped, and per-ref failures are reported
    /// rather than aborting the run. Scheduling and throttling around this
    /// primitive belong to the caller.
    pub fn prune(
        &self,
        ctx: &BuildContext,
        policy: &PrunePolicy,
    ) -> Result<PruneReport, StoreError> {
        let metadata = self.metadata();
        let now = now_millis();
        let mut report = PruneReport::default();

        for id in metadata.ids() {
            if ctx.is_cancelled() {
                break;
            }

            let item = metadata.get(&id);
            let kind = match item.get_json::<RefKind>(KEY_KIND) {
                Ok(Some(kind)) => kind,
                Ok(None) => continue,
                Err(err) => {
                    tracing::debug!(
                        target = "kiln.cache",
                        ref_id = %id,
                        error = %err,
                        "skipping record with unreadable kind"
                    );
                    continue;
                }
            };
            if kind != RefKind::Committed {
                continue;
            }
            let released_at = match item.get_json::<u64>(KEY_RELEASED_AT) {
                Ok(Some(released_at)) => released_at,
                Ok(None) => continue,
                Err(err) => {
                    tracing::debug!(
                        target = "kiln.cache",
                        ref_id = %id,
                        error = %err,
                        "skipping record with unreadable release timestamp"
                    );
                    continue;
                }
            };
            if now.saturating_sub(released_at) < policy.max_age_ms {
                continue;
            }

            let lease = match self.shared().acquire(&id) {
                Ok(lease) => lease,
                Err(StoreError::InUse { .. }) => {
                    tracing::debug!(target = "kiln.cache", ref_id = %id, "skipping in-use ref");
                    continue;
                }
                Err(err) => {
                    report.failed.push(PruneFailure {
                        id: id.clone(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            let removed = remove_ref_dir(self.shared(), &id).and_then(|bytes| {
                metadata.remove(&id)?;
                Ok(bytes)
            });
            match removed {
                Ok(bytes) => {
                    tracing::debug!(target = "kiln.cache", ref_id = %id, bytes, "pruned ref");
                    report.reclaimed_bytes = report.reclaimed_bytes.saturating_add(bytes);
                    report.removed.push(id.clone());
                }
                Err(err) => {
                    report.failed.push(PruneFailure {
                        id: id.clone(),
                        error: err.to_string(),
                    });
                }
            }
            drop(lease);
        }

        Ok(report)
    }
}

/// Delete a ref's directory, returning its best-effort size.
///
/// Removal renames the directory to a unique sibling first so a crash
/// mid-delete cannot leave a half-alive ref at its canonical path.
fn remove_ref_dir(shared: &StoreShared, id: &RefId) -> Result<u64, StoreError> {
    let dir = shared.ref_dir(id);
    // Lexical containment check; ids are hex but records are attacker-adjacent.
    if dir.strip_prefix(shared.root()).is_err() {
        return Err(StoreError::PathNotUnderStoreRoot {
            path: dir,
            root: shared.root().to_path_buf(),
        });
    }

    match fs::symlink_metadata(&dir) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    }

    let bytes = dir_size_bytes_nofollow(&dir);
    let trash = unique_sibling_path(shared.root(), id.as_str(), "prune");
    match fs::rename(&dir, &trash) {
        Ok(()) => remove_dir_all_nofollow(&trash)?,
        // Fall back to removing in place (e.g. Windows file locks).
        Err(_) => remove_dir_all_nofollow(&dir)?,
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;
    use crate::store::{CacheAccessor as _, NewRefOptions};
    use std::path::Path;

    fn open_store(dir: &Path) -> LocalRefStore {
        let metadata = MetadataStore::open(dir.join("meta.bin")).unwrap();
        LocalRefStore::open(dir.join("refs"), metadata).unwrap()
    }

    fn ctx() -> BuildContext {
        BuildContext::detached()
    }

    fn committed_released(store: &LocalRefStore, payload: &[u8]) -> RefId {
        let mutable = store.new_mutable(&ctx(), NewRefOptions::default()).unwrap();
        let tree = mutable.mount(&ctx(), false).unwrap().path;
        fs::write(tree.join("data.bin"), payload).unwrap();
        let committed = mutable.commit(&ctx()).unwrap();
        let id = committed.id().clone();
        committed.release(&ctx()).unwrap();
        id
    }

    #[test]
    fn prune_reaps_old_released_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        let id = committed_released(&store, &[0xAB; 1024]);

        let report = store.prune(&ctx(), &PrunePolicy { max_age_ms: 0 }).unwrap();
        assert_eq!(report.removed, vec![id.clone()]);
        assert!(report.reclaimed_bytes >= 1024);
        assert!(report.failed.is_empty());
        assert!(!store.shared().ref_dir(&id).exists());
        assert!(store.metadata().get(&id).get(KEY_KIND).is_none());
    }

    #[test]
    fn prune_spares_young_unreleased_and_mutable_refs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        // Released, but within the grace period.
        let young = committed_released(&store, b"young");
        // Committed but never released.
        let mutable = store.new_mutable(&ctx(), NewRefOptions::default()).unwrap();
        let unreleased = mutable.commit(&ctx()).unwrap().id().clone();
        // Plain mutable ref.
        let working = store.new_mutable(&ctx(), NewRefOptions::default()).unwrap();
        let working_id = working.id().clone();
        working.release(&ctx());

        let report = store
            .prune(
                &ctx(),
                &PrunePolicy {
                    max_age_ms: 60 * 60 * 1000,
                },
            )
            .unwrap();
        assert!(report.removed.is_empty());
        for id in [&young, &unreleased, &working_id] {
            assert!(store.shared().ref_dir(id).exists());
        }
    }

    #[test]
    fn prune_skips_refs_whose_lock_is_held() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        let id = committed_released(&store, b"held");

        let lease = store.shared().acquire(&id).unwrap();
        let report = store.prune(&ctx(), &PrunePolicy { max_age_ms: 0 }).unwrap();
        assert!(report.removed.is_empty());
        assert!(report.failed.is_empty());
        drop(lease);

        let report = store.prune(&ctx(), &PrunePolicy { max_age_ms: 0 }).unwrap();
        assert_eq!(report.removed, vec![id]);
    }

    #[test]
    fn prune_stops_on_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        committed_released(&store, b"doomed");

        let ctx = BuildContext::detached();
        ctx.cancel_token().cancel();
        let report = store.prune(&ctx, &PrunePolicy { max_age_ms: 0 }).unwrap();
        assert!(report.removed.is_empty());
    }
}
