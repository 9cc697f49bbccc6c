//! Per-session state: named sub-streams in LRU order plus queued writes
//!
//! A session owns one ledger and backing file per sub-stream. Streams are
//! kept least recently written first; when the session's combined size
//! exceeds its budget the front streams are dropped and their files deleted.

use crate::layout::StoreLayout;
use crate::ledger::{Window, WindowLedger};
use crate::pool::HandlePool;
use crate::stats::StoreStats;
use pagestore_common::{Error, ItemKey, ItemQuery, Result, SessionId, StoreConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// One named sub-stream and the ledger of its backing file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubStream {
    name: String,
    path: PathBuf,
    ledger: WindowLedger,
}

impl SubStream {
    /// Name the caller stores the stream under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file of the stream
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Windows currently held in the backing file
    pub fn ledger(&self) -> &WindowLedger {
        &self.ledger
    }
}

/// Where freshly allocated bytes must be written
#[derive(Debug)]
pub struct Placement {
    pub path: PathBuf,
    pub window: Window,
    /// Backing files of streams evicted to make room
    pub evicted: Vec<PathBuf>,
}

/// All sub-streams of one session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionEntry {
    id: SessionId,
    /// Least recently written first
    streams: Vec<SubStream>,
}

impl SessionEntry {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            streams: Vec::new(),
        }
    }

    /// Session this entry belongs to
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Sub-streams, least recently written first
    pub fn streams(&self) -> &[SubStream] {
        &self.streams
    }

    /// Combined size of every backing file
    pub fn total_size(&self) -> u64 {
        self.streams.iter().map(|s| s.ledger.total_size()).sum()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.streams.iter().position(|s| s.name == name)
    }

    fn stream_mut(&mut self, name: &str) -> Option<&mut SubStream> {
        self.streams.iter_mut().find(|s| s.name == name)
    }

    /// Reserve a window for `key` in stream `name`, creating the stream on first use.
    ///
    /// The stream becomes the most recently used one. Older streams are then
    /// evicted until the session fits its budget, always keeping at least one.
    pub fn place(
        &mut self,
        layout: &StoreLayout,
        config: &StoreConfig,
        pool: &HandlePool,
        name: &str,
        key: ItemKey,
        len: usize,
    ) -> Placement {
        let mut stream = match self.position(name) {
            Some(pos) => self.streams.remove(pos),
            None => SubStream {
                name: name.to_string(),
                path: layout.stream_path(&self.id, name, true),
                ledger: WindowLedger::new(config.max_bytes_per_sub_stream),
            },
        };

        let window = stream.ledger.allocate(key, len as u64);
        let path = stream.path.clone();
        self.streams.push(stream);

        let mut evicted = Vec::new();
        while self.total_size() > config.max_bytes_per_session && self.streams.len() > 1 {
            let victim = self.streams.remove(0);
            debug!(
                "Evicting sub-stream {} of session {} ({} bytes)",
                victim.name,
                self.id,
                victim.ledger.total_size()
            );
            pool.close_and_delete(&victim.path);
            evicted.push(victim.path);
        }

        Placement {
            path,
            window,
            evicted,
        }
    }

    /// Forget a window whose bytes never reached disk
    pub fn rollback(&mut self, name: &str, window: &Window) {
        if let Some(stream) = self.stream_mut(name) {
            let query = ItemQuery::exact(window.key);
            if stream.ledger.lookup(&query).as_ref() == Some(window) {
                stream.ledger.remove(&query);
            }
        }
    }

    /// Read the bytes of the window matching `query`
    pub fn read(&mut self, pool: &HandlePool, name: &str, query: &ItemQuery) -> Result<Option<Vec<u8>>> {
        let Some(stream) = self.stream_mut(name) else {
            return Ok(None);
        };
        let Some(window) = stream.ledger.lookup(query) else {
            return Ok(None);
        };
        let Some(handle) = pool.checkout(&stream.path, false)? else {
            return Ok(None);
        };

        let mut buf = vec![0u8; window.size as usize];
        handle.read_at(window.offset, &mut buf)?;
        Ok(Some(buf))
    }

    /// Check whether stream `name` holds an item matching `query`
    pub fn contains(&mut self, name: &str, query: &ItemQuery) -> bool {
        self.stream_mut(name)
            .is_some_and(|stream| stream.ledger.contains(query))
    }

    /// Drop every version of item `id` from stream `name`
    pub fn remove_item(&mut self, name: &str, id: i32) -> usize {
        self.stream_mut(name)
            .map_or(0, |stream| stream.ledger.remove_all(id))
    }

    /// Drop stream `name` and delete its backing file
    pub fn remove_stream(&mut self, pool: &HandlePool, name: &str) -> Option<PathBuf> {
        let stream = self.streams.remove(self.position(name)?);
        pool.close_and_delete(&stream.path);
        Some(stream.path)
    }

    /// Drop every stream, most recently used last
    pub fn clear(&mut self, pool: &HandlePool) -> usize {
        let count = self.streams.len();
        while let Some(stream) = self.streams.pop() {
            pool.close_and_delete(&stream.path);
        }
        count
    }

    /// Up to `count` windows of stream `name`, newest first
    pub fn recent_windows(&self, name: &str, count: usize) -> Vec<Window> {
        self.streams
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.ledger.recent_windows(count))
            .unwrap_or_default()
    }
}

/// Write `bytes` at `offset` of the backing file, creating it if needed
pub fn write_window(pool: &HandlePool, path: &Path, offset: u64, bytes: &[u8]) -> Result<()> {
    let handle = pool
        .checkout(path, true)?
        .ok_or_else(|| Error::storage(format!("cannot open {}", path.display())))?;
    handle.write_at(offset, bytes)
}

/// A write accepted by the store but not yet on disk
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub stream: String,
    pub path: PathBuf,
    pub window: Window,
    pub bytes: Vec<u8>,
}

/// Session state guarded by the per-session lock
#[derive(Debug)]
pub(crate) struct SessionSlot {
    pub entry: SessionEntry,
    pub pending: Vec<PendingWrite>,
    /// Set once the session is unbound; holders of a stale slot must look it up again
    pub unbound: bool,
}

impl SessionSlot {
    pub fn new(entry: SessionEntry) -> Self {
        Self {
            entry,
            pending: Vec::new(),
            unbound: false,
        }
    }

    /// Write bytes into a placed window, dropping the window if the write fails
    pub fn commit(
        &mut self,
        pool: &HandlePool,
        stats: &StoreStats,
        stream: &str,
        path: &Path,
        window: &Window,
        bytes: &[u8],
    ) -> bool {
        match write_window(pool, path, window.offset, bytes) {
            Ok(()) => {
                stats.record_write(bytes.len());
                true
            }
            Err(e) => {
                error!(
                    "Failed to write {} for session {} to {}: {}",
                    window.key,
                    self.entry.id(),
                    path.display(),
                    e
                );
                StoreStats::bump(&stats.write_errors);
                self.entry.rollback(stream, window);
                false
            }
        }
    }

    /// Perform every queued write, oldest first. Returns the number that succeeded.
    pub fn flush(&mut self, pool: &HandlePool, stats: &StoreStats) -> usize {
        let mut done = 0;
        for write in std::mem::take(&mut self.pending) {
            if self.commit(pool, stats, &write.stream, &write.path, &write.window, &write.bytes) {
                StoreStats::bump(&stats.deferred_writes_flushed);
                done += 1;
            }
        }
        done
    }

    /// Drop queued writes aimed at files that no longer belong to the session
    pub fn discard_pending(&mut self, paths: &[PathBuf]) {
        if !paths.is_empty() {
            self.pending.retain(|w| !paths.contains(&w.path));
        }
    }
}
