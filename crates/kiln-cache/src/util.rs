use crate::error::StoreError;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Hard upper bound for any bincode-encoded payload we will attempt to
/// deserialize from disk.
///
/// A corrupted length prefix must not be able to request an enormous
/// allocation; the metadata store file is small compared to this cap.
pub const BINCODE_PAYLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;

pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(err) => {
            // System clock set before 1970. Log at most once.
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "kiln.cache",
                    error = %err,
                    "system time is before unix epoch; using 0 for now_millis"
                );
            }
            0
        }
    }
}

pub(crate) fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

pub(crate) fn bincode_options_limited() -> impl bincode::Options + Copy {
    bincode_options().with_limit(BINCODE_PAYLOAD_LIMIT_BYTES as u64)
}

pub(crate) fn bincode_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode_options().serialize(value)?)
}

pub(crate) fn bincode_deserialize<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, StoreError> {
    Ok(bincode_options_limited().deserialize(bytes)?)
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` atomically: unique temp file, `sync_all`, rename,
/// then best-effort fsync of the parent directory so the rename survives a
/// crash.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let write_result = io::Write::write_all(&mut file, bytes).and_then(|()| file.sync_all());
    drop(file);
    if let Err(err) = write_result {
        remove_file_best_effort(&tmp_path, "atomic_write.failed_write");
        return Err(err.into());
    }

    match rename_replace(&tmp_path, path) {
        Ok(()) => {
            sync_dir_best_effort(parent, "atomic_write.sync_parent_dir");
            Ok(())
        }
        Err(err) => {
            remove_file_best_effort(&tmp_path, "atomic_write.failed_rename");
            Err(err.into())
        }
    }
}

fn rename_replace(from: &Path, to: &Path) -> io::Result<()> {
    const MAX_ATTEMPTS: usize = 1024;
    let mut attempts = 0usize;
    loop {
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(err)
                if cfg!(windows)
                    && (err.kind() == io::ErrorKind::AlreadyExists || to.exists()) =>
            {
                // Windows `rename` doesn't overwrite. Concurrent writers can race
                // the remove + rename sequence; retry until one wins.
                match fs::remove_file(to) {
                    Ok(()) => {}
                    Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                    Err(remove_err) => return Err(remove_err),
                }
                attempts += 1;
                if attempts >= MAX_ATTEMPTS {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "kiln.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove file"
            );
            false
        }
    }
}

pub(crate) fn sync_dir_best_effort(dir: &Path, reason: &'static str) {
    #[cfg(unix)]
    {
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                static REPORTED: OnceLock<()> = OnceLock::new();
                if REPORTED.set(()).is_ok() {
                    tracing::debug!(
                        target = "kiln.cache",
                        dir = %dir.display(),
                        reason,
                        error = %err,
                        "failed to sync directory (best effort)"
                    );
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = (dir, reason);
}

/// Remove a directory tree without ever following symlinks.
pub(crate) fn remove_dir_all_nofollow(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !meta.is_dir() || meta.file_type().is_symlink() {
        return remove_entry(path);
    }

    for entry in walkdir::WalkDir::new(path)
        .follow_links(false)
        .contents_first(true)
    {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            remove_entry(entry.path())?;
        }
    }
    Ok(())
}

fn remove_entry(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::IsADirectory => fs::remove_dir(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Pick a sibling path that doesn't exist yet, for rename-then-delete removal.
pub(crate) fn unique_sibling_path(parent: &Path, name: &str, suffix: &str) -> PathBuf {
    let pid = std::process::id();
    let ts = now_millis();
    for attempt in 0..1000u32 {
        let candidate = parent.join(format!("{name}.{suffix}-{pid}-{ts}-{attempt}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    parent.join(format!("{name}.{suffix}-{pid}-{ts}"))
}

/// Best-effort size of a tree in bytes, never following symlinks.
pub(crate) fn dir_size_bytes_nofollow(root: &Path) -> u64 {
    let mut total = 0_u64;
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let not_found = err
                    .io_error()
                    .is_some_and(|io_err| io_err.kind() == io::ErrorKind::NotFound);
                if !not_found {
                    tracing::debug!(
                        target = "kiln.cache",
                        path = err.path().map(|p| p.display().to_string()),
                        error = %err,
                        "failed to walk tree while computing size"
                    );
                }
                continue;
            }
        };
        let ty = entry.file_type();
        if !(ty.is_file() || ty.is_symlink()) {
            continue;
        }
        match fs::symlink_metadata(entry.path()) {
            Ok(meta) => total = total.saturating_add(meta.len()),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target = "kiln.cache",
                        path = %entry.path().display(),
                        error = %err,
                        "failed to stat entry while computing size"
                    );
                }
            }
        }
    }
    total
}
