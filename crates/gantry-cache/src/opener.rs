use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::lock::CacheLock;

/// Caller-supplied invalidation metadata recorded alongside cache contents.
///
/// Values are opaque to this crate; the storage layer only ever compares the
/// whole map for equality.
pub type CacheProperties = BTreeMap<String, serde_json::Value>;

/// How an opened cache's existing contents are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheUsage {
    /// Discard existing contents unconditionally and start fresh.
    Rebuild,
    /// Use existing contents as-is, without validating recorded properties.
    Reuse,
    /// Validate recorded properties and invalidate contents on mismatch
    /// (the default).
    #[default]
    OnDemand,
}

/// Opens the storage backing a resolved cache directory.
///
/// Implementations must:
///
/// - create `dir` (and any missing parents) when it does not exist yet;
/// - hold a lock appropriate to `usage` for the lifetime of the returned
///   handle: exclusive for [`CacheUsage::Rebuild`] and
///   [`CacheUsage::OnDemand`], shared for [`CacheUsage::Reuse`];
/// - compare or record `properties` so a later open can detect that the
///   contents were produced under different inputs;
/// - fail with an error rather than ever admitting two concurrent writers to
///   one directory, across threads and (where the lock supports it) across
///   processes.
pub trait CacheOpener: Send + Sync {
    fn open(
        &self,
        dir: &Path,
        usage: CacheUsage,
        properties: &CacheProperties,
    ) -> Result<PersistentCache>;
}

/// An opened persistent cache.
///
/// The handle owns whatever lock the opener acquired; dropping it releases
/// the directory for other callers.
#[derive(Debug)]
pub struct PersistentCache {
    dir: PathBuf,
    properties: CacheProperties,
    _lock: Option<CacheLock>,
}

impl PersistentCache {
    /// A handle over `dir` that holds `lock` until dropped.
    pub fn locked(dir: PathBuf, properties: CacheProperties, lock: CacheLock) -> Self {
        Self {
            dir,
            properties,
            _lock: Some(lock),
        }
    }

    /// A handle without a lock, for openers that coordinate elsewhere.
    pub fn unlocked(dir: PathBuf, properties: CacheProperties) -> Self {
        Self {
            dir,
            properties,
            _lock: None,
        }
    }

    /// The directory backing this cache.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The properties this cache was opened with.
    pub fn properties(&self) -> &CacheProperties {
        &self.properties
    }
}
