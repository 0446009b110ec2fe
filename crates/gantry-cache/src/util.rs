use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::Result;

pub(crate) fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(err) => {
            // This should be extremely rare (system clock set before 1970). Avoid spamming logs
            // in any hot call sites by logging at most once.
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "gantry.cache",
                    error = %err,
                    "system time is before unix epoch; using 0 for now_millis"
                );
            }
            0
        }
    }
}

/// Reads `path` if it is a regular file of at most `limit` bytes.
///
/// Oversized or non-regular entries are deleted so they cannot wedge the
/// cache. `None` degrades to an invalidation at the call sites, never an
/// error.
pub(crate) fn read_file_limited(path: &Path, limit: u64) -> Option<Vec<u8>> {
    // Avoid following symlinks out of the cache directory.
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            // Missing markers are expected; only log unexpected filesystem errors.
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "gantry.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to stat cache file"
                );
            }
            return None;
        }
    };
    if meta.file_type().is_symlink() || !meta.is_file() {
        remove_file_best_effort(path, "read_file_limited.invalid_type");
        return None;
    }
    if meta.len() > limit {
        remove_file_best_effort(path, "read_file_limited.oversize_meta");
        return None;
    }

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "gantry.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to read cache file"
                );
            }
            return None;
        }
    };
    // The file can grow between the stat and the read.
    if bytes.len() as u64 > limit {
        remove_file_best_effort(path, "read_file_limited.oversize_read");
        return None;
    }

    Some(bytes)
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::debug!(
                target = "gantry.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
        }
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Serializes `value` as JSON into `path` atomically.
///
/// The payload lands in a unique sibling tmp file which is then renamed over
/// `path`, so concurrent readers observe either the previous contents or the
/// new ones, never a partial write.
pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
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
    let write_result = (|| -> Result<()> {
        serde_json::to_writer(&mut file, value)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = write_result {
        drop(file);
        remove_file_best_effort(&tmp_path, "atomic_write_json.write_failed");
        return Err(err);
    }
    drop(file);

    match rename_over(&tmp_path, path) {
        Ok(()) => {
            sync_dir_best_effort(parent, "atomic_write_json.sync_parent_dir");
            Ok(())
        }
        Err(err) => {
            remove_file_best_effort(&tmp_path, "atomic_write_json.rename_failed");
            Err(err.into())
        }
    }
}

fn rename_over(tmp_path: &Path, path: &Path) -> io::Result<()> {
    const MAX_RENAME_ATTEMPTS: usize = 1024;
    let mut attempts = 0usize;
    loop {
        match fs::rename(tmp_path, path) {
            Ok(()) => return Ok(()),
            Err(err)
                if cfg!(windows)
                    && (err.kind() == io::ErrorKind::AlreadyExists || path.exists()) =>
            {
                // On Windows, `rename` doesn't overwrite. Under concurrent writers,
                // multiple `remove + rename` sequences can race; retry until we win.
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                    Err(remove_err) => return Err(remove_err),
                }

                attempts += 1;
                if attempts >= MAX_RENAME_ATTEMPTS {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[track_caller]
fn sync_dir_best_effort(dir: &Path, reason: &'static str) {
    #[cfg(unix)]
    static SYNC_DIR_ERROR_LOGGED: OnceLock<()> = OnceLock::new();

    #[cfg(unix)]
    {
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                if SYNC_DIR_ERROR_LOGGED.set(()).is_ok() {
                    let loc = std::panic::Location::caller();
                    tracing::debug!(
                        target = "gantry.cache",
                        dir = %dir.display(),
                        reason,
                        file = loc.file(),
                        line = loc.line(),
                        column = loc.column(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_json_persists_value() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("value.json");
        atomic_write_json(&path, &serde_json::json!({"answer": 42})).unwrap();

        let bytes = read_file_limited(&path, 1024).expect("file should be readable");
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["answer"], 42);
    }

    #[test]
    fn atomic_write_json_leaves_no_tmp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("value.json");
        atomic_write_json(&path, &serde_json::json!([1, 2, 3])).unwrap();

        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("value.json")]);
    }

    #[test]
    fn read_file_limited_rejects_oversize_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("big");
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        assert!(read_file_limited(&path, 16).is_none());
        assert!(!path.exists(), "oversize file should have been removed");
    }

    #[test]
    fn read_file_limited_missing_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_file_limited(&tmp.path().join("absent"), 16).is_none());
    }
}
