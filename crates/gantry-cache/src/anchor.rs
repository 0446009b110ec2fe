use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Where a cache directory is rooted.
///
/// Most caches live under the global cache root and use [`Anchor::Global`].
/// Caches derived from a particular build use [`Anchor::Invocation`] or
/// [`Anchor::Directory`] so their contents sit next to the sources they are
/// computed from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Anchor {
    /// Under the global cache root. This is the default.
    #[default]
    Global,
    /// Under the project cache directory of a registered build invocation.
    Invocation(InvocationHandle),
    /// Under the project cache directory resolved against an explicit
    /// directory.
    Directory(PathBuf),
}

impl From<InvocationHandle> for Anchor {
    fn from(handle: InvocationHandle) -> Self {
        Anchor::Invocation(handle)
    }
}

impl From<PathBuf> for Anchor {
    fn from(dir: PathBuf) -> Self {
        Anchor::Directory(dir)
    }
}

impl From<&Path> for Anchor {
    fn from(dir: &Path) -> Self {
        Anchor::Directory(dir.to_path_buf())
    }
}

/// Opaque identifier for a build invocation known to an [`InvocationRoots`]
/// implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationHandle(u64);

/// Maps an [`InvocationHandle`] to the root project directory of the build
/// invocation it denotes.
pub trait InvocationRoots: Send + Sync {
    /// The root project directory for `handle`, or `None` when the handle is
    /// not (or no longer) registered.
    fn root_dir(&self, handle: InvocationHandle) -> Option<PathBuf>;
}

/// Thread-safe in-process [`InvocationRoots`] implementation.
///
/// Build orchestration registers the root project directory when an
/// invocation starts and deregisters it when the invocation ends. Handles of
/// deregistered invocations resolve to `None` from then on.
#[derive(Debug, Default)]
pub struct InvocationRegistry {
    next: AtomicU64,
    roots: RwLock<HashMap<InvocationHandle, PathBuf>>,
}

impl InvocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `root_dir` as the root project directory of a new
    /// invocation and returns its handle.
    pub fn register(&self, root_dir: impl Into<PathBuf>) -> InvocationHandle {
        let handle = InvocationHandle(self.next.fetch_add(1, Ordering::Relaxed));
        let mut roots = self
            .roots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        roots.insert(handle, root_dir.into());
        handle
    }

    /// Forgets `handle`; subsequent lookups return `None`.
    pub fn deregister(&self, handle: InvocationHandle) {
        let mut roots = self
            .roots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        roots.remove(&handle);
    }
}

impl InvocationRoots for InvocationRegistry {
    fn root_dir(&self, handle: InvocationHandle) -> Option<PathBuf> {
        let roots = self
            .roots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        roots.get(&handle).cloned()
    }
}
