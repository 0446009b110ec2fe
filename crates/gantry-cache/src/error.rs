use std::path::PathBuf;
use std::time::Duration;

use crate::anchor::InvocationHandle;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache location resolution and cache storage.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("cache key must not be empty")]
    EmptyCacheKey,

    #[error("project cache directory setting must not be empty")]
    EmptyProjectCacheDir,

    #[error("cache anchor refers to {handle:?}, which is not registered")]
    UnrecognizedAnchor { handle: InvocationHandle },

    #[error("timed out waiting for cache lock on {path} after {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("cache directory {path} is unusable: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
