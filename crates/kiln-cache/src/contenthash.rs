use crate::digest::ContentDigest;
use crate::error::StoreError;
use crate::metadata::StorageItem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// Record key holding the serialized content-hash state of a mutable ref.
pub const CONTENT_HASH_KEY: &str = "cache.content_hash";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Symlink,
}

/// Digest of one tree entry plus the stat signature it was computed against.
///
/// The signature (size, mtime, mode, kind) is what lets repeat snapshots skip
/// rehashing unchanged files: if the entry on disk still matches, the recorded
/// digest is trusted as-is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashEntry {
    pub digest: ContentDigest,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime_nanos: i64,
    pub mode: u32,
}

/// Incremental content-hash state for one mutable ref's tree.
///
/// Loaded from the ref's metadata record before a copy, updated per entry as
/// the copier reports changes, and persisted back afterwards. Paths are
/// tree-relative and `/`-separated.
#[derive(Debug, Default)]
pub struct ContentHashContext {
    entries: BTreeMap<String, HashEntry>,
    dirty: bool,
}

impl ContentHashContext {
    /// Read the state stored on `item`.
    ///
    /// A record without state yields an empty context. Corrupt state also
    /// degrades to an empty context (forcing a rehash of everything) rather
    /// than failing the snapshot that is about to repair it.
    pub fn load(item: &StorageItem) -> Self {
        let Some(value) = item.get(CONTENT_HASH_KEY) else {
            return Self::default();
        };
        match value.to_json::<BTreeMap<String, HashEntry>>() {
            Ok(entries) => Self {
                entries,
                dirty: false,
            },
            Err(err) => {
                tracing::debug!(
                    target = "kiln.cache",
                    ref_id = %item.id(),
                    error = %err,
                    "discarding corrupt content-hash state; tree will be rehashed"
                );
                Self {
                    entries: BTreeMap::new(),
                    // Replace the corrupt record value even if nothing changes.
                    dirty: true,
                }
            }
        }
    }

    /// Persist the state back onto `item`. Skipped entirely when nothing
    /// changed since load, so unchanged repeat snapshots write nothing.
    pub fn save(&mut self, item: &StorageItem) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        item.set_value(CONTENT_HASH_KEY, &self.entries, None)?;
        self.dirty = false;
        Ok(())
    }

    /// The copier wrote (or rewrote) `rel`; hash the destination entry and
    /// record its fresh stat signature.
    pub fn changed(&mut self, rel: &str, dest: &Path) -> io::Result<()> {
        let meta = fs::symlink_metadata(dest)?;
        let entry = if meta.file_type().is_symlink() {
            let target = fs::read_link(dest)?;
            HashEntry {
                digest: ContentDigest::from_bytes(target.to_string_lossy().as_bytes()),
                kind: EntryKind::Symlink,
                size: meta.len(),
                mtime_nanos: mtime_nanos(&meta),
                mode: file_mode(&meta),
            }
        } else {
            HashEntry {
                digest: ContentDigest::from_file(dest)?,
                kind: EntryKind::File,
                size: meta.len(),
                mtime_nanos: mtime_nanos(&meta),
                mode: file_mode(&meta),
            }
        };

        if self.entries.get(rel) != Some(&entry) {
            self.entries.insert(rel.to_owned(), entry);
            self.dirty = true;
        }
        Ok(())
    }

    /// The copier left `rel` alone. Keep the recorded digest when the entry on
    /// disk still matches its recorded signature; rehash otherwise (state may
    /// have been lost or recorded against a different tree).
    pub fn unchanged(&mut self, rel: &str, dest: &Path) -> io::Result<()> {
        let meta = fs::symlink_metadata(dest)?;
        if let Some(entry) = self.entries.get(rel) {
            let kind_matches = match entry.kind {
                EntryKind::File => meta.file_type().is_file(),
                EntryKind::Symlink => meta.file_type().is_symlink(),
            };
            if kind_matches
                && entry.size == meta.len()
                && entry.mtime_nanos == mtime_nanos(&meta)
                && entry.mode == file_mode(&meta)
            {
                return Ok(());
            }
        }
        self.changed(rel, dest)
    }

    /// The copier removed `rel` from the tree.
    pub fn removed(&mut self, rel: &str) {
        if self.entries.remove(rel).is_some() {
            self.dirty = true;
        }
    }

    pub fn digest(&self, rel: &str) -> Option<&ContentDigest> {
        self.entries.get(rel).map(|entry| &entry.digest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn mtime_nanos(meta: &fs::Metadata) -> i64 {
    let Ok(modified) = meta.modified() else {
        return 0;
    };
    match modified.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(err) => {
            // Pre-epoch mtimes encode as negative nanos.
            -i64::try_from(err.duration().as_nanos()).unwrap_or(i64::MAX)
        }
    }
}

#[cfg(unix)]
pub(crate) fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
pub(crate) fn file_mode(_meta: &fs::Metadata) -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;
    use crate::store::RefId;

    fn item(store: &MetadataStore) -> StorageItem {
        store.get(&RefId::new("aa"))
    }

    #[test]
    fn load_of_missing_state_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path().join("meta.bin")).unwrap();
        let ctx = ContentHashContext::load(&item(&store));
        assert!(ctx.is_empty());
        assert!(!ctx.dirty);
    }

    #[test]
    fn matching_signature_skips_the_rehash() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path().join("meta.bin")).unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let mut ctx = ContentHashContext::load(&item(&store));
        ctx.changed("a.txt", &file).unwrap();
        let recorded = ctx.digest("a.txt").cloned().unwrap();
        assert_eq!(recorded, ContentDigest::from_bytes(b"hello"));
        ctx.save(&item(&store)).unwrap();

        // Rewrite the file with same-length content and restore its mtime so
        // the stat signature is identical. `unchanged` must keep the recorded
        // digest, proving it never re-read the bytes.
        let mtime = std::fs::metadata(&file).unwrap().modified().unwrap();
        std::fs::write(&file, b"world").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let mut reloaded = ContentHashContext::load(&item(&store));
        reloaded.unchanged("a.txt", &file).unwrap();
        assert_eq!(reloaded.digest("a.txt"), Some(&recorded));
    }

    #[test]
    fn mismatched_signature_forces_a_rehash() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path().join("meta.bin")).unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let mut ctx = ContentHashContext::load(&item(&store));
        ctx.changed("a.txt", &file).unwrap();
        ctx.save(&item(&store)).unwrap();

        // Different size: the recorded signature no longer matches.
        std::fs::write(&file, b"hello world").unwrap();
        let mut reloaded = ContentHashContext::load(&item(&store));
        reloaded.unchanged("a.txt", &file).unwrap();
        assert_eq!(
            reloaded.digest("a.txt"),
            Some(&ContentDigest::from_bytes(b"hello world"))
        );
    }

    #[test]
    fn unchanged_heals_missing_state() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path().join("meta.bin")).unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        // Nothing recorded: `unchanged` must fall back to hashing.
        let mut ctx = ContentHashContext::load(&item(&store));
        ctx.unchanged("a.txt", &file).unwrap();
        assert_eq!(
            ctx.digest("a.txt"),
            Some(&ContentDigest::from_bytes(b"hello"))
        );
    }

    #[test]
    fn save_skips_when_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path().join("meta.bin")).unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let mut ctx = ContentHashContext::load(&item(&store));
        ctx.changed("a.txt", &file).unwrap();
        ctx.save(&item(&store)).unwrap();
        let after_first_save = store.stats().mutations;

        let mut reloaded = ContentHashContext::load(&item(&store));
        reloaded.unchanged("a.txt", &file).unwrap();
        reloaded.save(&item(&store)).unwrap();
        assert_eq!(store.stats().mutations, after_first_save);
    }

    #[test]
    fn corrupt_state_degrades_to_rehash() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path().join("meta.bin")).unwrap();
        item(&store)
            .set_value(CONTENT_HASH_KEY, &"not a map", None)
            .unwrap();

        let ctx = ContentHashContext::load(&item(&store));
        assert!(ctx.is_empty());
        assert!(ctx.dirty, "corrupt state must be rewritten on save");
    }

    #[test]
    fn removed_entries_are_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path().join("meta.bin")).unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let mut ctx = ContentHashContext::load(&item(&store));
        ctx.changed("a.txt", &file).unwrap();
        ctx.save(&item(&store)).unwrap();

        let mut ctx = ContentHashContext::load(&item(&store));
        ctx.removed("a.txt");
        assert!(ctx.digest("a.txt").is_none());
        ctx.save(&item(&store)).unwrap();

        let reloaded = ContentHashContext::load(&item(&store));
        assert!(reloaded.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_entries_hash_the_target_path() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path().join("meta.bin")).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink("target.txt", &link).unwrap();

        let mut ctx = ContentHashContext::load(&item(&store));
        ctx.changed("link", &link).unwrap();
        assert_eq!(
            ctx.digest("link"),
            Some(&ContentDigest::from_bytes(b"target.txt"))
        );
    }
}
