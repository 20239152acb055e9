use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use kiln_core::BuildContext;
use walkdir::WalkDir;

use crate::error::CopyError;
use crate::filter::CopyFilter;

/// Observes the copier as it reconciles the destination with the source.
///
/// `changed` and `unchanged` fire once the destination entry is in its
/// final state, `removed` after a stale file or symlink was deleted. Any
/// error aborts the synchronization.
pub trait CopyVisitor {
    fn changed(&mut self, rel: &str, dest: &Path) -> io::Result<()>;
    fn unchanged(&mut self, rel: &str, dest: &Path) -> io::Result<()>;
    fn removed(&mut self, rel: &str) -> io::Result<()>;
}

/// Visitor for callers that only want the tree synchronized.
pub struct NoopVisitor;

impl CopyVisitor for NoopVisitor {
    fn changed(&mut self, _rel: &str, _dest: &Path) -> io::Result<()> {
        Ok(())
    }

    fn unchanged(&mut self, _rel: &str, _dest: &Path) -> io::Result<()> {
        Ok(())
    }

    fn removed(&mut self, _rel: &str) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub files_copied: u64,
    pub files_unchanged: u64,
    pub entries_removed: u64,
    pub bytes_copied: u64,
}

/// Makes `dest` mirror the filtered view of `src`.
///
/// Entries whose size, mtime and mode match the destination are left
/// untouched. Changed files are written to a temporary sibling and renamed
/// into place, so a destination entry is never rewritten through its old
/// inode. Destination entries with no counterpart in the filtered source
/// are deleted bottom-up after the copy pass.
///
/// The walk is sorted, so visitor callbacks arrive in a deterministic
/// order for a given tree.
pub fn sync_dir(
    ctx: &BuildContext,
    src: &Path,
    dest: &Path,
    filter: &CopyFilter,
    visitor: &mut dyn CopyVisitor,
) -> Result<CopySummary, CopyError> {
    let mut summary = CopySummary::default();
    let mut retained: BTreeSet<String> = BTreeSet::new();

    fs::create_dir_all(dest)?;

    let mut entries = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = entries.next() {
        if ctx.is_cancelled() {
            return Err(CopyError::Cancelled);
        }
        let entry = entry?;
        let rel = rel_path(src, entry.path())?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            if !filter.descends_dir(&rel) {
                entries.skip_current_dir();
                continue;
            }
            if !filter.has_includes() {
                ensure_dir(entry.path(), &dest.join(&rel))?;
                retained.insert(rel);
            }
            // With includes, directories materialize lazily once a file
            // under them is taken.
            continue;
        }
        if !filter.includes_file(&rel) {
            continue;
        }
        ensure_parents(src, dest, &rel, &mut retained)?;
        let target = dest.join(&rel);
        if file_type.is_symlink() {
            sync_symlink(entry.path(), &target, &rel, &mut summary, visitor)?;
        } else {
            let src_meta = entry.metadata()?;
            sync_file(entry.path(), &target, &rel, &src_meta, &mut summary, visitor)?;
        }
        retained.insert(rel);
    }

    remove_stale_entries(ctx, dest, &retained, &mut summary, visitor)?;

    tracing::debug!(
        target = "kiln.copy",
        src = %src.display(),
        dest = %dest.display(),
        files_copied = summary.files_copied,
        files_unchanged = summary.files_unchanged,
        entries_removed = summary.entries_removed,
        bytes_copied = summary.bytes_copied,
        "synchronized tree"
    );
    Ok(summary)
}

fn rel_path(root: &Path, path: &Path) -> Result<String, CopyError> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| CopyError::PathOutsideRoot {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        })?;
    Ok(rel.to_string_lossy().replace('\\', "/"))
}

/// Creates the destination directories above `rel` that the walk has not
/// produced yet, e.g. because includes suppressed their source entries.
fn ensure_parents(
    src: &Path,
    dest: &Path,
    rel: &str,
    retained: &mut BTreeSet<String>,
) -> io::Result<()> {
    let mut prefix = String::new();
    let Some((parents, _name)) = rel.rsplit_once('/') else {
        return Ok(());
    };
    for part in parents.split('/') {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(part);
        if retained.insert(prefix.clone()) {
            ensure_dir(&src.join(&prefix), &dest.join(&prefix))?;
        }
    }
    Ok(())
}

fn ensure_dir(src_dir: &Path, target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => {}
        Ok(meta) => {
            // A file or symlink sits where a directory belongs.
            remove_dest_entry(target, &meta)?;
            fs::create_dir(target)?;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => fs::create_dir(target)?,
        Err(err) => return Err(err),
    }
    if let Ok(meta) = fs::symlink_metadata(src_dir) {
        let _ = fs::set_permissions(target, meta.permissions());
    }
    Ok(())
}

fn sync_file(
    src_path: &Path,
    target: &Path,
    rel: &str,
    src_meta: &fs::Metadata,
    summary: &mut CopySummary,
    visitor: &mut dyn CopyVisitor,
) -> Result<(), CopyError> {
    match fs::symlink_metadata(target) {
        Ok(dest_meta) if dest_meta.is_file() && same_signature(src_meta, &dest_meta) => {
            summary.files_unchanged = summary.files_unchanged.saturating_add(1);
            visitor.unchanged(rel, target)?;
            return Ok(());
        }
        Ok(dest_meta) if !dest_meta.is_file() => remove_dest_entry(target, &dest_meta)?,
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    let copied = copy_file_fresh(src_path, target, src_meta)?;
    summary.files_copied = summary.files_copied.saturating_add(1);
    summary.bytes_copied = summary.bytes_copied.saturating_add(copied);
    visitor.changed(rel, target)?;
    Ok(())
}

fn sync_symlink(
    src_path: &Path,
    target: &Path,
    rel: &str,
    summary: &mut CopySummary,
    visitor: &mut dyn CopyVisitor,
) -> Result<(), CopyError> {
    let link_target = fs::read_link(src_path)?;
    match fs::symlink_metadata(target) {
        Ok(dest_meta) if dest_meta.file_type().is_symlink() => {
            if fs::read_link(target)? == link_target {
                summary.files_unchanged = summary.files_unchanged.saturating_add(1);
                visitor.unchanged(rel, target)?;
                return Ok(());
            }
            fs::remove_file(target)?;
        }
        Ok(dest_meta) => remove_dest_entry(target, &dest_meta)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    recreate_symlink(&link_target, target)?;
    summary.files_copied = summary.files_copied.saturating_add(1);
    visitor.changed(rel, target)?;
    Ok(())
}

fn remove_stale_entries(
    ctx: &BuildContext,
    dest: &Path,
    retained: &BTreeSet<String>,
    summary: &mut CopySummary,
    visitor: &mut dyn CopyVisitor,
) -> Result<(), CopyError> {
    // Children come before their directory, so a directory is empty by the
    // time it is considered. Retained files keep their ancestors retained.
    let walker = WalkDir::new(dest)
        .min_depth(1)
        .follow_links(false)
        .contents_first(true)
        .sort_by_file_name();
    for entry in walker {
        if ctx.is_cancelled() {
            return Err(CopyError::Cancelled);
        }
        let entry = entry?;
        let rel = rel_path(dest, entry.path())?;
        if retained.contains(&rel) {
            continue;
        }
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
            visitor.removed(&rel)?;
        }
        summary.entries_removed = summary.entries_removed.saturating_add(1);
    }
    Ok(())
}

fn same_signature(src: &fs::Metadata, dest: &fs::Metadata) -> bool {
    src.len() == dest.len()
        && mtime_nanos(src) == mtime_nanos(dest)
        && file_mode(src) == file_mode(dest)
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Copies `src_path` to `target` through a temporary sibling, carrying the
/// source permissions and mtime over. The rename guarantees the final file
/// sits on a fresh inode, so trees hard-linked against the old file keep
/// their old contents.
fn copy_file_fresh(src_path: &Path, target: &Path, src_meta: &fs::Metadata) -> io::Result<u64> {
    let parent = target.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", target.display()),
        )
    })?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("entry"));
    let tmp = parent.join(format!(
        "{name}.tmp.{}.{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed),
    ));
    match write_tmp_copy(src_path, &tmp, src_meta) {
        Ok(copied) => match rename_replace(&tmp, target) {
            Ok(()) => Ok(copied),
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                Err(err)
            }
        },
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(err)
        }
    }
}

fn write_tmp_copy(src_path: &Path, tmp: &Path, src_meta: &fs::Metadata) -> io::Result<u64> {
    let mut reader = fs::File::open(src_path)?;
    let mut out = fs::File::options().write(true).create_new(true).open(tmp)?;
    let copied = io::copy(&mut reader, &mut out)?;
    out.set_permissions(src_meta.permissions())?;
    out.set_modified(src_meta.modified()?)?;
    Ok(copied)
}

#[cfg(unix)]
fn rename_replace(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to)
}

#[cfg(not(unix))]
fn rename_replace(from: &Path, to: &Path) -> io::Result<()> {
    // Windows refuses to rename over an existing file.
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            let _ = fs::remove_file(to);
            fs::rename(from, to)
        }
    }
}

fn remove_dest_entry(path: &Path, meta: &fs::Metadata) -> io::Result<()> {
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(unix)]
fn recreate_symlink(link_target: &Path, at: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link_target, at)
}

#[cfg(windows)]
fn recreate_symlink(link_target: &Path, at: &Path) -> io::Result<()> {
    if link_target.is_dir() {
        std::os::windows::fs::symlink_dir(link_target, at)
    } else {
        std::os::windows::fs::symlink_file(link_target, at)
    }
}

fn mtime_nanos(meta: &fs::Metadata) -> i64 {
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
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0
}
