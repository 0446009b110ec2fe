//! Persistent cache locations and the repository that hands caches out.
//!
//! This crate implements Gantry's persistent-cache building blocks:
//! - deterministic mapping from {cache key, anchor, version strategy} to a
//!   collision-free on-disk directory
//! - version-aware invalidation properties recorded next to cache contents
//! - the storage-opener contract (locking, reuse, at-most-one-writer) and the
//!   default file-backed implementation
//!
//! ## On-disk layout
//!
//! A resolved cache directory is `<base>[/<version>]/<key>`:
//! - `<base>` is the global cache root for [`Anchor::Global`], or the project
//!   cache directory for anchored caches (an absolute `project_cache_dir`
//!   setting wins over the anchor; a relative one resolves against it)
//! - the version segment is the Gantry version under
//!   [`VersionStrategy::CachePerVersion`], the literal `noVersion` under
//!   [`VersionStrategy::SharedCacheInvalidateOnVersionChange`], and absent
//!   under [`VersionStrategy::SharedCache`]
//!
//! Inside a directory opened by [`LocalOpener`]:
//! - `cache.lock`: the [`CacheLock`] coordinating access to the directory
//! - `cache.json`: the recorded invalidation properties, schema
//!   [`CACHE_PROPERTIES_SCHEMA_VERSION`]
//!
//! Resolving a location is pure; only opening a cache touches the
//! filesystem.

mod anchor;
mod error;
mod local;
mod locate;
mod lock;
mod opener;
mod repository;
mod strategy;
mod util;

pub use anchor::{Anchor, InvocationHandle, InvocationRegistry, InvocationRoots};
pub use error::CacheError;
pub use local::{
    LocalOpener, CACHE_LOCK_FILENAME, CACHE_PROPERTIES_FILENAME, CACHE_PROPERTIES_SCHEMA_VERSION,
};
pub use locate::{CacheLocation, TOOL_VERSION_PROPERTY};
pub use lock::CacheLock;
pub use opener::{CacheOpener, CacheProperties, CacheUsage, PersistentCache};
pub use repository::{CacheBuilder, CacheRepository, CacheRepositoryConfig};
pub use strategy::VersionStrategy;
