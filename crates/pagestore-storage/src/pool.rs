//! Bounded pool of open backing-file handles
//!
//! Handles are keyed by path and reference counted. A handle whose count
//! drops to zero becomes idle and may be reclaimed, oldest idle first, when
//! opening another file would exceed the pool capacity. Deleting a file whose
//! handle is checked out is deferred until the last holder releases it.
//!
//! Every transition happens under one pool-wide lock. Reads and writes on a
//! checked-out handle happen outside the lock.

use crate::handle::BackingFile;
use pagestore_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

/// Lifecycle state of a pooled handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Open with no holders, eligible for reclamation
    Idle,
    /// Held by this many checkouts
    CheckedOut(usize),
    /// Held by this many checkouts; closed and deleted on the last release
    PendingDelete(usize),
}

/// Pool statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Files opened by the pool
    pub opened: AtomicU64,
    /// Idle handles closed to make room
    pub reclaimed: AtomicU64,
    /// Deletions postponed because the handle was checked out
    pub deferred_deletes: AtomicU64,
    /// Opens that left the pool above capacity
    pub over_capacity: AtomicU64,
}

struct PoolEntry {
    file: Arc<BackingFile>,
    state: HandleState,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<PathBuf, PoolEntry>,
    /// Idle paths, oldest first
    idle: VecDeque<PathBuf>,
}

impl PoolState {
    fn unmark_idle(&mut self, path: &Path) {
        if let Some(pos) = self.idle.iter().position(|p| p == path) {
            self.idle.remove(pos);
        }
    }
}

/// Reference-counted pool of open backing files
pub struct HandlePool {
    state: Mutex<PoolState>,
    capacity: usize,
    stats: PoolStats,
}

impl HandlePool {
    /// Create a pool allowing `capacity` simultaneously open handles
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 1 {
            return Err(Error::configuration(
                "handle pool capacity must be at least 1",
            ));
        }
        Ok(Self {
            state: Mutex::new(PoolState::default()),
            capacity,
            stats: PoolStats::default(),
        })
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of currently open handles (checked out or idle)
    pub fn open_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Number of idle handles
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// State of the handle for `path`, if one is open
    pub fn state_of(&self, path: &Path) -> Option<HandleState> {
        self.state.lock().entries.get(path).map(|e| e.state)
    }

    /// Get pool statistics
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Check out the handle for `path`, opening the file if needed.
    ///
    /// Returns `Ok(None)` when the file does not exist and `create` is false.
    /// Each successful call must be matched by one [`release`](Self::release).
    pub fn acquire(&self, path: &Path, create: bool) -> Result<Option<Arc<BackingFile>>> {
        let mut state = self.state.lock();

        if let Some(entry) = state.entries.get_mut(path) {
            let was_idle = entry.state == HandleState::Idle;
            entry.state = match entry.state {
                HandleState::Idle => HandleState::CheckedOut(1),
                HandleState::CheckedOut(n) => HandleState::CheckedOut(n + 1),
                HandleState::PendingDelete(n) => HandleState::PendingDelete(n + 1),
            };
            let file = Arc::clone(&entry.file);
            if was_idle {
                state.unmark_idle(path);
            }
            return Ok(Some(file));
        }

        let Some(file) = BackingFile::open(path, create)? else {
            return Ok(None);
        };

        self.reclaim_idle(&mut state, self.capacity - 1);

        let file = Arc::new(file);
        state.entries.insert(
            path.to_path_buf(),
            PoolEntry {
                file: Arc::clone(&file),
                state: HandleState::CheckedOut(1),
            },
        );
        self.stats.opened.fetch_add(1, Ordering::Relaxed);

        if state.entries.len() > self.capacity {
            self.stats.over_capacity.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Handle pool over capacity: {} open, capacity {}",
                state.entries.len(),
                self.capacity
            );
        }

        Ok(Some(file))
    }

    /// Check out the handle for `path` wrapped in a guard that releases it on drop
    pub fn checkout(&self, path: &Path, create: bool) -> Result<Option<PooledHandle<'_>>> {
        Ok(self
            .acquire(path, create)?
            .map(|file| PooledHandle { pool: self, file }))
    }

    /// Return a handle obtained from [`acquire`](Self::acquire)
    pub fn release(&self, handle: &Arc<BackingFile>) -> Result<()> {
        let mut state = self.state.lock();
        let path = handle.path();

        let entry = match state.entries.get_mut(path) {
            Some(entry) if Arc::ptr_eq(&entry.file, handle) => entry,
            _ => {
                return Err(Error::UnknownHandle {
                    path: path.to_path_buf(),
                });
            }
        };

        let current = entry.state;
        match current {
            HandleState::Idle => Err(Error::HandleNotCheckedOut {
                path: path.to_path_buf(),
            }),
            HandleState::CheckedOut(n) if n > 1 => {
                entry.state = HandleState::CheckedOut(n - 1);
                Ok(())
            }
            HandleState::CheckedOut(_) => {
                entry.state = HandleState::Idle;
                state.idle.push_back(path.to_path_buf());
                // Settle any overrun left by an earlier over-capacity open
                self.reclaim_idle(&mut state, self.capacity);
                Ok(())
            }
            HandleState::PendingDelete(n) if n > 1 => {
                entry.state = HandleState::PendingDelete(n - 1);
                Ok(())
            }
            HandleState::PendingDelete(_) => {
                state.entries.remove(path);
                debug!("Closing and deleting {} after last release", path.display());
                remove_file(path);
                Ok(())
            }
        }
    }

    /// Close the handle for `path` and delete the file.
    ///
    /// If the handle is checked out, both steps are deferred to the release
    /// that brings its count to zero.
    pub fn close_and_delete(&self, path: &Path) {
        let mut state = self.state.lock();

        match state.entries.get(path).map(|e| e.state) {
            Some(HandleState::CheckedOut(n)) => {
                if let Some(entry) = state.entries.get_mut(path) {
                    entry.state = HandleState::PendingDelete(n);
                }
                self.stats.deferred_deletes.fetch_add(1, Ordering::Relaxed);
                debug!("Deferring delete of {} ({} holders)", path.display(), n);
            }
            Some(HandleState::PendingDelete(_)) => {}
            Some(HandleState::Idle) => {
                state.entries.remove(path);
                state.unmark_idle(path);
                remove_file(path);
            }
            None => remove_file(path),
        }
    }

    /// Close every open handle, completing any deferred deletes
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        let open = state.entries.len();
        for (path, entry) in state.entries.drain() {
            if matches!(entry.state, HandleState::PendingDelete(_)) {
                remove_file(&path);
            }
        }
        state.idle.clear();
        debug!("Handle pool closed {} handles", open);
    }

    /// Close idle handles, oldest first, until at most `limit` remain open
    fn reclaim_idle(&self, state: &mut PoolState, limit: usize) {
        while state.entries.len() > limit {
            let Some(path) = state.idle.pop_front() else {
                break;
            };
            if state.entries.remove(&path).is_some() {
                self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
                debug!("Reclaimed idle handle {}", path.display());
            }
        }
    }
}

/// A checked-out handle returned to the pool when dropped
pub struct PooledHandle<'a> {
    pool: &'a HandlePool,
    file: Arc<BackingFile>,
}

impl Deref for PooledHandle<'_> {
    type Target = BackingFile;

    fn deref(&self) -> &BackingFile {
        &self.file
    }
}

impl Drop for PooledHandle<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.release(&self.file) {
            error!("Failed to return handle {}: {}", self.file.path().display(), e);
        }
    }
}

fn remove_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!("Failed to delete {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(HandlePool::new(0).is_err());
    }

    #[test]
    fn test_acquire_missing_without_create() {
        let dir = tempdir().unwrap();
        let pool = HandlePool::new(4).unwrap();

        let handle = pool.acquire(&dir.path().join("pm-none"), false).unwrap();
        assert!(handle.is_none());
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn test_acquire_shares_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pm-main");
        let pool = HandlePool::new(4).unwrap();

        let a = pool.acquire(&path, true).unwrap().unwrap();
        let b = pool.acquire(&path, true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.state_of(&path), Some(HandleState::CheckedOut(2)));

        pool.release(&a).unwrap();
        assert_eq!(pool.state_of(&path), Some(HandleState::CheckedOut(1)));
        pool.release(&b).unwrap();
        assert_eq!(pool.state_of(&path), Some(HandleState::Idle));
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_double_release_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pm-main");
        let pool = HandlePool::new(4).unwrap();

        let handle = pool.acquire(&path, true).unwrap().unwrap();
        pool.release(&handle).unwrap();

        let err = pool.release(&handle).unwrap_err();
        assert!(matches!(err, Error::HandleNotCheckedOut { .. }));
        assert!(err.is_misuse());
    }

    #[test]
    fn test_release_unknown_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pm-main");
        let pool = HandlePool::new(4).unwrap();

        let stray = Arc::new(BackingFile::open(&path, true).unwrap().unwrap());
        assert!(matches!(
            pool.release(&stray),
            Err(Error::UnknownHandle { .. })
        ));
    }

    #[test]
    fn test_reclaims_oldest_idle() {
        let dir = tempdir().unwrap();
        let pool = HandlePool::new(2).unwrap();
        let paths: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("pm-{i}"))).collect();

        for path in &paths[..2] {
            let handle = pool.acquire(path, true).unwrap().unwrap();
            pool.release(&handle).unwrap();
        }
        assert_eq!(pool.open_count(), 2);

        let handle = pool.acquire(&paths[2], true).unwrap().unwrap();
        assert_eq!(pool.open_count(), 2);
        assert_eq!(pool.state_of(&paths[0]), None);
        assert_eq!(pool.state_of(&paths[1]), Some(HandleState::Idle));
        assert_eq!(pool.stats().reclaimed.load(Ordering::Relaxed), 1);
        pool.release(&handle).unwrap();
    }

    #[test]
    fn test_over_capacity_degrades_gracefully() {
        let dir = tempdir().unwrap();
        let pool = HandlePool::new(1).unwrap();

        let a = pool.acquire(&dir.path().join("pm-a"), true).unwrap().unwrap();
        let b = pool.acquire(&dir.path().join("pm-b"), true).unwrap().unwrap();
        assert_eq!(pool.open_count(), 2);
        assert_eq!(pool.stats().over_capacity.load(Ordering::Relaxed), 1);

        // Releasing settles the overrun
        pool.release(&a).unwrap();
        assert_eq!(pool.open_count(), 1);
        assert_eq!(pool.state_of(&dir.path().join("pm-a")), None);
        pool.release(&b).unwrap();
        assert_eq!(pool.open_count(), 1);

        let c = pool.acquire(&dir.path().join("pm-c"), true).unwrap().unwrap();
        assert_eq!(pool.open_count(), 1);
        pool.release(&c).unwrap();
    }

    #[test]
    fn test_deferred_delete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pm-main");
        let pool = HandlePool::new(4).unwrap();

        let handle = pool.acquire(&path, true).unwrap().unwrap();
        handle.write_at(0, b"payload").unwrap();

        pool.close_and_delete(&path);
        assert_eq!(pool.state_of(&path), Some(HandleState::PendingDelete(1)));
        assert!(path.exists());

        // Still usable while checked out
        let mut buf = [0u8; 7];
        handle.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");

        pool.release(&handle).unwrap();
        assert!(!path.exists());
        assert_eq!(pool.state_of(&path), None);
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn test_delete_idle_is_immediate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pm-main");
        let pool = HandlePool::new(4).unwrap();

        let handle = pool.acquire(&path, true).unwrap().unwrap();
        pool.release(&handle).unwrap();

        pool.close_and_delete(&path);
        assert!(!path.exists());
        assert_eq!(pool.open_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_delete_unpooled_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pm-main");
        std::fs::write(&path, b"x").unwrap();

        let pool = HandlePool::new(4).unwrap();
        pool.close_and_delete(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pm-main");
        let pool = HandlePool::new(4).unwrap();

        {
            let handle = pool.checkout(&path, true).unwrap().unwrap();
            handle.write_at(0, b"abc").unwrap();
            assert_eq!(pool.state_of(&path), Some(HandleState::CheckedOut(1)));
        }
        assert_eq!(pool.state_of(&path), Some(HandleState::Idle));
    }

    #[test]
    fn test_shutdown_keeps_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pm-main");
        let pool = HandlePool::new(4).unwrap();

        drop(pool.checkout(&path, true).unwrap());
        pool.shutdown();
        assert_eq!(pool.open_count(), 0);
        assert!(path.exists());
    }
}
