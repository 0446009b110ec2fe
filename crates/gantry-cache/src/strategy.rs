/// Controls how a cache directory relates to the Gantry version using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VersionStrategy {
    /// One directory shared by every Gantry version.
    ///
    /// Nothing ties the contents to a version; callers opt in when the
    /// stored format is stable across releases.
    SharedCache,

    /// One directory per Gantry version (the default).
    ///
    /// The version becomes a path segment, so different versions never see
    /// each other's files.
    #[default]
    CachePerVersion,

    /// One directory shared across versions, rebuilt on version change.
    ///
    /// The path carries a fixed `noVersion` segment instead of the version,
    /// and the current version is recorded as the `tool.version` property so
    /// the storage layer can detect that a different version last wrote the
    /// cache and invalidate it.
    SharedCacheInvalidateOnVersionChange,
}
