use std::path::{Path, PathBuf};

use crate::anchor::{Anchor, InvocationRoots};
use crate::error::{CacheError, Result};
use crate::opener::CacheProperties;
use crate::repository::CacheRepositoryConfig;
use crate::strategy::VersionStrategy;

/// Property key under which the Gantry version is recorded when a shared
/// cache must be rebuilt on version change.
pub const TOOL_VERSION_PROPERTY: &str = "tool.version";

/// Path segment standing in for the version in shared-invalidating caches.
///
/// Fixed so caches written by earlier Gantry versions stay reachable.
const NO_VERSION_SEGMENT: &str = "noVersion";

/// A resolved cache location: the directory backing the cache and the
/// properties the storage layer should record for invalidation.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLocation {
    pub dir: PathBuf,
    pub properties: CacheProperties,
}

/// The inputs a builder collects before resolution.
pub(crate) struct CacheRequest<'a> {
    pub key: &'a str,
    pub properties: &'a CacheProperties,
    pub anchor: &'a Anchor,
    pub strategy: VersionStrategy,
}

/// Maps a cache request onto its backing directory and invalidation
/// property set.
///
/// Resolution is pure: identical inputs produce the identical location, the
/// filesystem is never consulted, and nothing is remembered across calls.
pub(crate) fn resolve_location(
    config: &CacheRepositoryConfig,
    invocations: &dyn InvocationRoots,
    request: CacheRequest<'_>,
) -> Result<CacheLocation> {
    if request.key.is_empty() {
        return Err(CacheError::EmptyCacheKey);
    }
    if config.project_cache_dir.as_os_str().is_empty() {
        return Err(CacheError::EmptyProjectCacheDir);
    }

    let mut base = match request.anchor {
        Anchor::Global => config.global_cache_root.clone(),
        Anchor::Invocation(handle) => {
            let root = invocations
                .root_dir(*handle)
                .ok_or(CacheError::UnrecognizedAnchor { handle: *handle })?;
            project_cache_dir_in(config, &root)
        }
        Anchor::Directory(dir) => project_cache_dir_in(config, dir),
    };

    let mut properties = request.properties.clone();
    match request.strategy {
        VersionStrategy::SharedCache => {}
        VersionStrategy::CachePerVersion => {
            base.push(&config.tool_version);
        }
        VersionStrategy::SharedCacheInvalidateOnVersionChange => {
            base.push(NO_VERSION_SEGMENT);
            properties.insert(
                TOOL_VERSION_PROPERTY.to_string(),
                serde_json::Value::String(config.tool_version.clone()),
            );
        }
    }

    Ok(CacheLocation {
        dir: base.join(request.key),
        properties,
    })
}

/// The project cache directory for caches anchored at `dir`.
///
/// An absolute `project_cache_dir` setting wins over the anchor; a relative
/// one resolves against it.
fn project_cache_dir_in(config: &CacheRepositoryConfig, dir: &Path) -> PathBuf {
    if config.project_cache_dir.is_absolute() {
        config.project_cache_dir.clone()
    } else {
        dir.join(&config.project_cache_dir)
    }
}
