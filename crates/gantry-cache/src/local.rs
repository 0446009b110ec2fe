use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::lock::CacheLock;
use crate::opener::{CacheOpener, CacheProperties, CacheUsage, PersistentCache};
use crate::util::{atomic_write_json, now_millis, read_file_limited, remove_file_best_effort};

pub const CACHE_PROPERTIES_SCHEMA_VERSION: u32 = 1;
pub const CACHE_PROPERTIES_FILENAME: &str = "cache.json";
pub const CACHE_LOCK_FILENAME: &str = "cache.lock";

/// Hard upper bound for a properties marker we will attempt to parse.
///
/// A corrupted marker should degrade to an invalidation, not an
/// out-of-memory crash.
const PROPERTIES_LIMIT_BYTES: u64 = 1024 * 1024;

/// The marker persisted next to cache contents, recording what they were
/// produced under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct PersistedProperties {
    schema_version: u32,
    saved_at_millis: u64,
    properties: CacheProperties,
}

impl PersistedProperties {
    fn new(properties: &CacheProperties) -> Self {
        Self {
            schema_version: CACHE_PROPERTIES_SCHEMA_VERSION,
            saved_at_millis: now_millis(),
            properties: properties.clone(),
        }
    }
}

/// File-backed [`CacheOpener`].
///
/// Every cache directory carries two bookkeeping files: `cache.lock`, the
/// lock coordinating access to the directory, and `cache.json`, the recorded
/// properties the contents were produced under.
#[derive(Debug, Clone, Default)]
pub struct LocalOpener {
    lock_timeout: Option<Duration>,
}

impl LocalOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail opens with [`CacheError::LockTimeout`] instead of blocking
    /// indefinitely when the directory is locked elsewhere.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    fn acquire_lock(&self, dir: &Path, usage: CacheUsage) -> Result<CacheLock> {
        let lock_path = dir.join(CACHE_LOCK_FILENAME);
        match (usage, self.lock_timeout) {
            (CacheUsage::Reuse, None) => CacheLock::lock_shared(&lock_path),
            (CacheUsage::Reuse, Some(timeout)) => {
                CacheLock::lock_shared_timeout(&lock_path, timeout)
            }
            (_, None) => CacheLock::lock_exclusive(&lock_path),
            (_, Some(timeout)) => CacheLock::lock_exclusive_timeout(&lock_path, timeout),
        }
    }
}

impl CacheOpener for LocalOpener {
    fn open(
        &self,
        dir: &Path,
        usage: CacheUsage,
        properties: &CacheProperties,
    ) -> Result<PersistentCache> {
        match fs::symlink_metadata(dir) {
            Ok(meta) if !meta.is_dir() => {
                return Err(CacheError::Corrupted {
                    path: dir.to_path_buf(),
                    reason: "existing path is not a directory".to_string(),
                });
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(dir)?;

        let lock = self.acquire_lock(dir, usage)?;

        match usage {
            CacheUsage::Reuse => {}
            CacheUsage::Rebuild => {
                tracing::debug!(
                    target = "gantry.cache",
                    dir = %dir.display(),
                    "rebuilding cache"
                );
                clear_contents(dir)?;
                record_properties(dir, properties)?;
            }
            CacheUsage::OnDemand => {
                if let Some(reason) = validation_failure(dir, properties) {
                    tracing::debug!(
                        target = "gantry.cache",
                        dir = %dir.display(),
                        reason,
                        "invalidating cache"
                    );
                    clear_contents(dir)?;
                    record_properties(dir, properties)?;
                }
            }
        }

        Ok(PersistentCache::locked(
            dir.to_path_buf(),
            properties.clone(),
            lock,
        ))
    }
}

/// Why an on-demand open cannot trust the existing contents, or `None` when
/// the recorded properties match the supplied ones.
fn validation_failure(dir: &Path, properties: &CacheProperties) -> Option<&'static str> {
    let marker_path = dir.join(CACHE_PROPERTIES_FILENAME);
    let Some(bytes) = read_file_limited(&marker_path, PROPERTIES_LIMIT_BYTES) else {
        return Some("properties marker missing");
    };

    let recorded: PersistedProperties = match serde_json::from_slice(&bytes) {
        Ok(recorded) => recorded,
        Err(err) => {
            tracing::debug!(
                target = "gantry.cache",
                path = %marker_path.display(),
                error = %err,
                "failed to parse properties marker"
            );
            remove_file_best_effort(&marker_path, "validation.unparsable_marker");
            return Some("properties marker unparsable");
        }
    };

    if recorded.schema_version != CACHE_PROPERTIES_SCHEMA_VERSION {
        return Some("properties marker schema changed");
    }
    if recorded.properties != *properties {
        return Some("recorded properties differ");
    }
    None
}

fn record_properties(dir: &Path, properties: &CacheProperties) -> Result<()> {
    atomic_write_json(
        &dir.join(CACHE_PROPERTIES_FILENAME),
        &PersistedProperties::new(properties),
    )
}

/// Removes everything in `dir` except the lock file, which the caller holds
/// open.
fn clear_contents(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name() == CACHE_LOCK_FILENAME {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, &str)]) -> CacheProperties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn validation_fails_until_properties_are_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let properties = props(&[("compiler", "javac17")]);

        assert_eq!(
            validation_failure(tmp.path(), &properties),
            Some("properties marker missing")
        );

        record_properties(tmp.path(), &properties).unwrap();
        assert_eq!(validation_failure(tmp.path(), &properties), None);
    }

    #[test]
    fn validation_fails_on_property_change() {
        let tmp = tempfile::tempdir().unwrap();
        record_properties(tmp.path(), &props(&[("compiler", "javac17")])).unwrap();

        assert_eq!(
            validation_failure(tmp.path(), &props(&[("compiler", "javac21")])),
            Some("recorded properties differ")
        );
    }

    #[test]
    fn validation_fails_on_schema_change() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join(CACHE_PROPERTIES_FILENAME);
        let stale = json!({
            "schema_version": CACHE_PROPERTIES_SCHEMA_VERSION + 1,
            "saved_at_millis": 0,
            "properties": {},
        });
        fs::write(&marker, serde_json::to_vec(&stale).unwrap()).unwrap();

        assert_eq!(
            validation_failure(tmp.path(), &CacheProperties::new()),
            Some("properties marker schema changed")
        );
    }

    #[test]
    fn corrupt_marker_degrades_to_invalidation_and_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join(CACHE_PROPERTIES_FILENAME);
        fs::write(&marker, b"not json").unwrap();

        assert_eq!(
            validation_failure(tmp.path(), &CacheProperties::new()),
            Some("properties marker unparsable")
        );
        assert!(!marker.exists());
    }

    #[test]
    fn clear_contents_preserves_the_lock_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(CACHE_LOCK_FILENAME), b"").unwrap();
        fs::write(tmp.path().join("entry.bin"), b"payload").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub").join("nested"), b"x").unwrap();

        clear_contents(tmp.path()).unwrap();

        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(CACHE_LOCK_FILENAME)]);
    }
}
