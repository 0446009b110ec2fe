use std::path::PathBuf;
use std::sync::Arc;

use crate::anchor::{Anchor, InvocationRegistry, InvocationRoots};
use crate::error::{CacheError, Result};
use crate::local::LocalOpener;
use crate::locate::{resolve_location, CacheLocation, CacheRequest};
use crate::opener::{CacheOpener, CacheProperties, CacheUsage, PersistentCache};
use crate::strategy::VersionStrategy;

/// Directory name used for project-anchored caches unless overridden.
pub(crate) const DEFAULT_PROJECT_CACHE_DIR: &str = ".gantry";

/// Configuration shared by every cache the repository hands out.
#[derive(Clone, Debug)]
pub struct CacheRepositoryConfig {
    /// Base directory for caches anchored at [`Anchor::Global`].
    pub global_cache_root: PathBuf,
    /// The project cache directory. An absolute value is used as-is for
    /// every anchored cache; a relative value resolves against the anchor
    /// directory.
    pub project_cache_dir: PathBuf,
    /// Version recorded in versioned cache paths and invalidation
    /// properties.
    pub tool_version: String,
    /// Usage forwarded to the opener on every open.
    pub cache_usage: CacheUsage,
}

impl CacheRepositoryConfig {
    /// Configuration rooted at `user_home`, with defaults for everything
    /// else.
    pub fn with_user_home(user_home: impl Into<PathBuf>) -> Self {
        Self {
            global_cache_root: user_home.into().join("caches"),
            project_cache_dir: PathBuf::from(DEFAULT_PROJECT_CACHE_DIR),
            tool_version: gantry_core::GANTRY_VERSION.to_string(),
            cache_usage: CacheUsage::default(),
        }
    }

    /// Configuration for the current user.
    ///
    /// `GANTRY_USER_HOME` overrides the user home; otherwise it is
    /// `~/.gantry`, derived from `HOME` (or `USERPROFILE` on Windows).
    pub fn from_env() -> Result<Self> {
        if let Some(home) = std::env::var_os("GANTRY_USER_HOME") {
            return Ok(Self::with_user_home(PathBuf::from(home)));
        }

        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .ok_or(CacheError::MissingHomeDir)?;
        Ok(Self::with_user_home(home.join(".gantry")))
    }
}

/// Hands out persistent caches at stable on-disk locations.
///
/// The repository is immutable after construction and safe to share across
/// threads; all per-cache choices live on the [`CacheBuilder`].
pub struct CacheRepository {
    config: CacheRepositoryConfig,
    opener: Arc<dyn CacheOpener>,
    invocations: Arc<dyn InvocationRoots>,
}

impl CacheRepository {
    pub fn new(
        config: CacheRepositoryConfig,
        opener: Arc<dyn CacheOpener>,
        invocations: Arc<dyn InvocationRoots>,
    ) -> Self {
        Self {
            config,
            opener,
            invocations,
        }
    }

    /// A repository backed by [`LocalOpener`] and a fresh
    /// [`InvocationRegistry`].
    ///
    /// The registry is returned alongside so build orchestration can
    /// register invocations as they start.
    pub fn with_default_opener(config: CacheRepositoryConfig) -> (Self, Arc<InvocationRegistry>) {
        let registry = Arc::new(InvocationRegistry::new());
        let repository = Self::new(config, Arc::new(LocalOpener::new()), registry.clone());
        (repository, registry)
    }

    pub fn config(&self) -> &CacheRepositoryConfig {
        &self.config
    }

    /// Starts a cache request for `key`.
    ///
    /// The key becomes the final path segment verbatim; callers are trusted
    /// to pass a plain directory name.
    pub fn cache(&self, key: impl Into<String>) -> CacheBuilder<'_> {
        CacheBuilder {
            repository: self,
            key: key.into(),
            properties: CacheProperties::new(),
            anchor: Anchor::Global,
            strategy: VersionStrategy::default(),
        }
    }
}

/// A pending cache request.
///
/// Setters consume and return the builder; each call overrides any earlier
/// value. Nothing touches the filesystem until [`CacheBuilder::open`].
pub struct CacheBuilder<'a> {
    repository: &'a CacheRepository,
    key: String,
    properties: CacheProperties,
    anchor: Anchor,
    strategy: VersionStrategy,
}

impl CacheBuilder<'_> {
    /// Replaces the invalidation properties recorded with the cache.
    pub fn with_properties(mut self, properties: CacheProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Sets how the cache directory relates to the Gantry version.
    pub fn with_version_strategy(mut self, strategy: VersionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Anchors the cache somewhere other than the global cache root.
    pub fn for_anchor(mut self, anchor: impl Into<Anchor>) -> Self {
        self.anchor = anchor.into();
        self
    }

    /// Resolves where this cache lives, without opening it.
    pub fn resolve(&self) -> Result<CacheLocation> {
        resolve_location(
            &self.repository.config,
            self.repository.invocations.as_ref(),
            CacheRequest {
                key: &self.key,
                properties: &self.properties,
                anchor: &self.anchor,
                strategy: self.strategy,
            },
        )
    }

    /// Resolves the location and opens the cache through the repository's
    /// opener.
    pub fn open(&self) -> Result<PersistentCache> {
        let location = self.resolve()?;
        tracing::debug!(
            target = "gantry.cache",
            key = %self.key,
            dir = %location.dir.display(),
            usage = ?self.repository.config.cache_usage,
            "opening cache"
        );
        self.repository.opener.open(
            &location.dir,
            self.repository.config.cache_usage,
            &location.properties,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locate::TOOL_VERSION_PROPERTY;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::Path;
    use std::sync::Mutex;

    struct RecordingOpener {
        calls: Mutex<Vec<(PathBuf, CacheUsage, CacheProperties)>>,
    }

    impl RecordingOpener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(PathBuf, CacheUsage, CacheProperties)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CacheOpener for RecordingOpener {
        fn open(
            &self,
            dir: &Path,
            usage: CacheUsage,
            properties: &CacheProperties,
        ) -> Result<PersistentCache> {
            self.calls
                .lock()
                .unwrap()
                .push((dir.to_path_buf(), usage, properties.clone()));
            Ok(PersistentCache::unlocked(
                dir.to_path_buf(),
                properties.clone(),
            ))
        }
    }

    fn test_config() -> CacheRepositoryConfig {
        let mut config = CacheRepositoryConfig::with_user_home("/home/u/.gantry");
        config.tool_version = "8.0".to_string();
        config
    }

    fn repo_with(
        config: CacheRepositoryConfig,
        opener: Arc<RecordingOpener>,
    ) -> (CacheRepository, Arc<InvocationRegistry>) {
        let registry = Arc::new(InvocationRegistry::new());
        let repository = CacheRepository::new(config, opener, registry.clone());
        (repository, registry)
    }

    #[test]
    fn defaults_open_versioned_global_cache_on_demand() {
        let opener = RecordingOpener::new();
        let (repo, _registry) = repo_with(test_config(), opener.clone());

        let cache = repo.cache("foo").open().unwrap();

        assert_eq!(cache.dir(), Path::new("/home/u/.gantry/caches/8.0/foo"));
        let calls = opener.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            (
                PathBuf::from("/home/u/.gantry/caches/8.0/foo"),
                CacheUsage::OnDemand,
                CacheProperties::new(),
            )
        );
    }

    #[test]
    fn each_setter_overrides_earlier_calls() {
        let opener = RecordingOpener::new();
        let (repo, _registry) = repo_with(test_config(), opener.clone());

        let location = repo
            .cache("foo")
            .with_version_strategy(VersionStrategy::CachePerVersion)
            .with_version_strategy(VersionStrategy::SharedCache)
            .for_anchor(PathBuf::from("/first"))
            .for_anchor(PathBuf::from("/second"))
            .resolve()
            .unwrap();

        assert_eq!(location.dir, PathBuf::from("/second/.gantry/foo"));
    }

    #[test]
    fn configured_usage_is_forwarded_to_the_opener() {
        let mut config = test_config();
        config.cache_usage = CacheUsage::Rebuild;
        let opener = RecordingOpener::new();
        let (repo, _registry) = repo_with(config, opener.clone());

        repo.cache("foo").open().unwrap();

        assert_eq!(opener.calls()[0].1, CacheUsage::Rebuild);
    }

    #[test]
    fn properties_are_forwarded_to_the_opener() {
        let opener = RecordingOpener::new();
        let (repo, _registry) = repo_with(test_config(), opener.clone());

        let mut properties = CacheProperties::new();
        properties.insert("compiler".to_string(), json!("javac17"));
        repo.cache("classes")
            .with_properties(properties.clone())
            .open()
            .unwrap();

        assert_eq!(opener.calls()[0].2, properties);
    }

    #[test]
    fn invalidating_strategy_records_tool_version_property() {
        let opener = RecordingOpener::new();
        let (repo, _registry) = repo_with(test_config(), opener.clone());

        let cache = repo
            .cache("scripts")
            .with_version_strategy(VersionStrategy::SharedCacheInvalidateOnVersionChange)
            .open()
            .unwrap();

        assert_eq!(
            cache.dir(),
            Path::new("/home/u/.gantry/caches/noVersion/scripts")
        );
        assert_eq!(
            cache.properties().get(TOOL_VERSION_PROPERTY),
            Some(&json!("8.0"))
        );
    }

    #[test]
    fn registered_invocation_anchors_under_its_root() {
        let opener = RecordingOpener::new();
        let (repo, registry) = repo_with(test_config(), opener.clone());
        let handle = registry.register("/work/app");

        let location = repo.cache("idx").for_anchor(handle).resolve().unwrap();

        assert_eq!(location.dir, PathBuf::from("/work/app/.gantry/8.0/idx"));
    }

    #[test]
    fn unknown_invocation_fails_before_reaching_the_opener() {
        let opener = RecordingOpener::new();
        let (repo, registry) = repo_with(test_config(), opener.clone());
        let handle = registry.register("/work/app");
        registry.deregister(handle);

        let err = repo
            .cache("idx")
            .for_anchor(handle)
            .open()
            .expect_err("deregistered invocation should not open");

        assert!(matches!(err, CacheError::UnrecognizedAnchor { .. }));
        assert!(opener.calls().is_empty());
    }

    #[test]
    fn empty_key_fails_before_reaching_the_opener() {
        let opener = RecordingOpener::new();
        let (repo, _registry) = repo_with(test_config(), opener.clone());

        let err = repo.cache("").open().expect_err("empty key should not open");

        assert!(matches!(err, CacheError::EmptyCacheKey));
        assert!(opener.calls().is_empty());
    }

    #[test]
    fn resolve_is_repeatable_and_open_delegates_each_time() {
        let opener = RecordingOpener::new();
        let (repo, _registry) = repo_with(test_config(), opener.clone());

        let builder = repo.cache("foo");
        assert_eq!(builder.resolve().unwrap(), builder.resolve().unwrap());

        builder.open().unwrap();
        builder.open().unwrap();
        let calls = opener.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
    }
}
