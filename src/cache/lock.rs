//! Per-repository mutual exclusion.
//!
//! Two layers guard each mirror: an in-process set of held identities (so
//! threads in one process queue up without touching the filesystem), and an
//! flock-based lock file (so independent processes sharing a cache root do
//! the same).

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::types::RepoKey;

/// Default lock timeout (5 minutes) - prevents indefinite hangs
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

fn timed_out(timeout: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("lock acquisition timed out after {:?}", timeout),
    )
}

fn open_lock_file(lock_path: &Path) -> io::Result<File> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
}

/// A guard that holds an exclusive lock file for a mirror.
/// Lock is released when dropped.
#[derive(Debug)]
pub struct RepoLock {
    file: File,
}

impl RepoLock {
    /// Acquire an exclusive lock, blocking until available or timeout.
    /// Creates the lock file and parent dirs if needed.
    pub fn acquire(lock_path: &Path) -> io::Result<Self> {
        Self::acquire_with_timeout(lock_path, DEFAULT_LOCK_TIMEOUT)
    }

    /// Acquire an exclusive lock with a custom timeout.
    /// Returns an error with `ErrorKind::TimedOut` if the lock cannot be acquired
    /// within the specified duration.
    pub fn acquire_with_timeout(lock_path: &Path, timeout: Duration) -> io::Result<Self> {
        let file = open_lock_file(lock_path)?;

        // Poll with exponential backoff
        let start = Instant::now();
        let mut sleep_duration = Duration::from_millis(10);
        let max_sleep = Duration::from_millis(500);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(timed_out(timeout));
                    }
                    log::debug!("waiting for {}", lock_path.display());
                    std::thread::sleep(sleep_duration);
                    sleep_duration = (sleep_duration * 2).min(max_sleep);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Try to acquire lock without blocking.
    /// Returns None if lock is held elsewhere.
    pub fn try_acquire(lock_path: &Path) -> io::Result<Option<Self>> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// In-process registry of repository identities currently held.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    held: Mutex<HashSet<RepoKey>>,
    released: Condvar,
}

/// Guard for one identity in a [`KeyedLocks`]; releases on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: RepoKey,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other thread holds `key`, then hold it.
    pub fn acquire(&self, key: &RepoKey, timeout: Duration) -> io::Result<KeyGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(key) {
            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out(timeout));
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            held = guard;
        }
        held.insert(key.clone());
        Ok(KeyGuard {
            locks: self,
            key: key.clone(),
        })
    }

    /// Whether `key` is currently held by some thread.
    pub fn is_held(&self, key: &RepoKey) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
        drop(held);
        self.locks.released.notify_all();
    }
}

/// Both layers held for one mirror. Field order drops the file lock before
/// the in-process guard.
#[derive(Debug)]
pub struct MirrorGuard<'a> {
    _file: RepoLock,
    _key: KeyGuard<'a>,
}

impl<'a> MirrorGuard<'a> {
    /// Take the in-process lock for `key`, then the lock file at `lock_path`.
    pub fn acquire(
        locks: &'a KeyedLocks,
        key: &RepoKey,
        lock_path: &Path,
        timeout: Duration,
    ) -> io::Result<Self> {
        let start = Instant::now();
        let key_guard = locks.acquire(key, timeout)?;
        let remaining = timeout.saturating_sub(start.elapsed());
        let file = RepoLock::acquire_with_timeout(lock_path, remaining)?;
        Ok(Self {
            _file: file,
            _key: key_guard,
        })
    }
}
