use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{CacheError, Result};

/// Sleep between attempts when acquiring a lock with a timeout.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A filesystem-backed lock that is safe to share across multiple Gantry
/// processes.
///
/// An exclusive lock admits one holder; shared locks admit any number of
/// concurrent holders but exclude exclusive ones. The lock is released when
/// the returned value is dropped.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    _path: PathBuf,
    // `fs2` file locks are process-scoped on Unix platforms (they don't exclude other threads in
    // the same process). Keep an in-process guard to ensure mutual exclusion between threads,
    // while the file lock continues to provide cross-process coordination.
    _guard: ProcessGuard,
}

#[derive(Debug)]
enum ProcessGuard {
    Shared(RwLockReadGuard<'static, ()>),
    Exclusive(RwLockWriteGuard<'static, ()>),
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Shared,
    Exclusive,
}

impl CacheLock {
    /// Acquire an exclusive lock on `path`, creating the lockfile if needed.
    ///
    /// This call blocks until the lock is available.
    pub fn lock_exclusive(path: &Path) -> Result<Self> {
        Self::acquire(path, Mode::Exclusive, None)
    }

    /// Acquire a shared lock on `path`, creating the lockfile if needed.
    ///
    /// This call blocks until the lock is available.
    pub fn lock_shared(path: &Path) -> Result<Self> {
        Self::acquire(path, Mode::Shared, None)
    }

    /// Like [`CacheLock::lock_exclusive`], but gives up with
    /// [`CacheError::LockTimeout`] once `timeout` has elapsed.
    pub fn lock_exclusive_timeout(path: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire(path, Mode::Exclusive, Some(timeout))
    }

    /// Like [`CacheLock::lock_shared`], but gives up with
    /// [`CacheError::LockTimeout`] once `timeout` has elapsed.
    pub fn lock_shared_timeout(path: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire(path, Mode::Shared, Some(timeout))
    }

    fn acquire(path: &Path, mode: Mode, timeout: Option<Duration>) -> Result<Self> {
        let started = Instant::now();

        let lock = process_lock_for_path(path);
        let guard = match timeout {
            None => match mode {
                Mode::Shared => ProcessGuard::Shared(
                    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner()),
                ),
                Mode::Exclusive => ProcessGuard::Exclusive(
                    lock.write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()),
                ),
            },
            Some(timeout) => process_guard_timeout(lock, mode, path, started, timeout)?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        // Newer toolchains give `File` inherent lock methods whose signatures
        // differ from the `fs2` ones; call through the trait so resolution is
        // the same on every supported compiler.
        match timeout {
            None => match mode {
                Mode::Shared => fs2::FileExt::lock_shared(&file)?,
                Mode::Exclusive => fs2::FileExt::lock_exclusive(&file)?,
            },
            Some(timeout) => loop {
                let attempt = match mode {
                    Mode::Shared => fs2::FileExt::try_lock_shared(&file),
                    Mode::Exclusive => fs2::FileExt::try_lock_exclusive(&file),
                };
                match attempt {
                    Ok(()) => break,
                    Err(err) if is_lock_contended(&err) => {
                        if started.elapsed() >= timeout {
                            return Err(CacheError::LockTimeout {
                                path: path.to_path_buf(),
                                waited: started.elapsed(),
                            });
                        }
                        thread::sleep(LOCK_POLL_INTERVAL);
                    }
                    Err(err) => return Err(err.into()),
                }
            },
        }

        Ok(Self {
            file,
            _path: path.to_path_buf(),
            _guard: guard,
        })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn process_guard_timeout(
    lock: &'static RwLock<()>,
    mode: Mode,
    path: &Path,
    started: Instant,
    timeout: Duration,
) -> Result<ProcessGuard> {
    loop {
        match mode {
            Mode::Shared => match lock.try_read() {
                Ok(guard) => return Ok(ProcessGuard::Shared(guard)),
                Err(TryLockError::Poisoned(poisoned)) => {
                    return Ok(ProcessGuard::Shared(poisoned.into_inner()));
                }
                Err(TryLockError::WouldBlock) => {}
            },
            Mode::Exclusive => match lock.try_write() {
                Ok(guard) => return Ok(ProcessGuard::Exclusive(guard)),
                Err(TryLockError::Poisoned(poisoned)) => {
                    return Ok(ProcessGuard::Exclusive(poisoned.into_inner()));
                }
                Err(TryLockError::WouldBlock) => {}
            },
        }

        if started.elapsed() >= timeout {
            return Err(CacheError::LockTimeout {
                path: path.to_path_buf(),
                waited: started.elapsed(),
            });
        }
        thread::sleep(LOCK_POLL_INTERVAL);
    }
}

fn is_lock_contended(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn process_lock_for_path(path: &Path) -> &'static RwLock<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static RwLock<()>>>> = OnceLock::new();
    let locks = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut map = locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = map.get(path) {
        return existing;
    }

    let lock: &'static RwLock<()> = Box::leak(Box::new(RwLock::new(())));
    map.insert(path.to_path_buf(), lock);
    lock
}
