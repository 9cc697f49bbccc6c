//! Session-aware blob store
//!
//! Ties sessions and their sub-stream ledgers to pooled backing files.
//! Every call on a session runs under that session's lock; different
//! sessions never block each other. In deferred mode `store` only places
//! the window and queues the bytes; the background flusher writes them, and
//! any read or removal on the session drains its queue first.
//!
//! Storage is a cache: I/O failures are logged and surface as misses.

use crate::flusher::Flusher;
use crate::layout::StoreLayout;
use crate::ledger::Window;
use crate::pool::HandlePool;
use crate::session::{PendingWrite, SessionEntry, SessionSlot};
use crate::snapshot;
use crate::stats::StoreStats;
use pagestore_common::{ItemKey, ItemQuery, Result, SessionId, StoreConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

type SharedSlot = Arc<Mutex<SessionSlot>>;

struct StoreInner {
    config: StoreConfig,
    layout: StoreLayout,
    pool: HandlePool,
    sessions: RwLock<HashMap<SessionId, SharedSlot>>,
    stats: StoreStats,
}

impl StoreInner {
    fn slot(&self, session: &SessionId) -> Option<SharedSlot> {
        self.sessions.read().get(session).cloned()
    }

    fn slot_or_create(&self, session: &SessionId) -> SharedSlot {
        if let Some(slot) = self.slot(session) {
            return slot;
        }
        let mut sessions = self.sessions.write();
        Arc::clone(sessions.entry(session.clone()).or_insert_with(|| {
            debug!("Creating session {}", session);
            Arc::new(Mutex::new(SessionSlot::new(SessionEntry::new(session.clone()))))
        }))
    }

    fn all_slots(&self) -> Vec<SharedSlot> {
        self.sessions.read().values().cloned().collect()
    }

    fn flush_session(&self, session: &SessionId) {
        if let Some(slot) = self.slot(session) {
            slot.lock().flush(&self.pool, &self.stats);
        }
    }
}

/// Disk-backed blob store shared by many sessions
pub struct BlobStore {
    inner: Arc<StoreInner>,
    flusher: Option<Flusher>,
    shut_down: AtomicBool,
}

impl BlobStore {
    /// Open a store, restoring the registry snapshot if one was saved
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let layout = StoreLayout::new(config.store_dir());
        std::fs::create_dir_all(layout.store_dir())?;
        let pool = HandlePool::new(config.handle_pool_capacity)?;

        let mut sessions = HashMap::new();
        if config.persist_index {
            for entry in snapshot::take(&layout.index_path()) {
                sessions.insert(
                    entry.id().clone(),
                    Arc::new(Mutex::new(SessionSlot::new(entry))),
                );
            }
        }
        let restored = sessions.len();

        let inner = Arc::new(StoreInner {
            config,
            layout,
            pool,
            sessions: RwLock::new(sessions),
            stats: StoreStats::default(),
        });

        let flusher = if inner.config.synchronous {
            None
        } else {
            let worker = Arc::clone(&inner);
            Some(Flusher::start(
                format!("pagestore-flusher-{}", inner.config.app_name),
                inner.config.flush_interval(),
                move |session| worker.flush_session(session),
            )?)
        };

        info!(
            "Opened page store at {} ({} sessions restored, {} mode)",
            inner.layout.store_dir().display(),
            restored,
            if flusher.is_some() { "deferred" } else { "synchronous" }
        );

        Ok(Self {
            inner,
            flusher,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &StoreStats {
        &self.inner.stats
    }

    pub fn pool(&self) -> &HandlePool {
        &self.inner.pool
    }

    /// Ids of every live session
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.inner.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Combined size of one session's backing files
    pub fn session_size(&self, session: &SessionId) -> u64 {
        self.inner
            .slot(session)
            .map_or(0, |slot| slot.lock().entry.total_size())
    }

    /// Name and size of each sub-stream of a session, least recently written first
    pub fn stream_sizes(&self, session: &SessionId) -> Vec<(String, u64)> {
        self.inner
            .slot(session)
            .map(|slot| {
                slot.lock()
                    .entry
                    .streams()
                    .iter()
                    .map(|s| (s.name().to_string(), s.ledger().total_size()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn deferred(&self) -> bool {
        self.flusher.is_some() && !self.shut_down.load(Ordering::Acquire)
    }

    /// Store `bytes` for `key` in sub-stream `stream`.
    ///
    /// Best effort: a failed write is logged and the item reads back as a miss.
    pub fn store(&self, session: &SessionId, stream: &str, key: ItemKey, bytes: &[u8]) {
        let inner = &self.inner;
        StoreStats::bump(&inner.stats.writes);

        loop {
            let slot = inner.slot_or_create(session);
            let mut guard = slot.lock();
            if guard.unbound {
                continue;
            }

            let placement =
                guard
                    .entry
                    .place(&inner.layout, &inner.config, &inner.pool, stream, key, bytes.len());
            if !placement.evicted.is_empty() {
                inner
                    .stats
                    .evicted_sub_streams
                    .fetch_add(placement.evicted.len() as u64, Ordering::Relaxed);
                guard.discard_pending(&placement.evicted);
            }

            match &self.flusher {
                Some(flusher) if self.deferred() => {
                    let was_idle = guard.pending.is_empty();
                    guard.pending.push(PendingWrite {
                        stream: stream.to_string(),
                        path: placement.path,
                        window: placement.window,
                        bytes: bytes.to_vec(),
                    });
                    if was_idle {
                        flusher.notify(session.clone());
                    }
                }
                _ => {
                    guard.commit(
                        &inner.pool,
                        &inner.stats,
                        stream,
                        &placement.path,
                        &placement.window,
                        bytes,
                    );
                }
            }
            return;
        }
    }

    /// Read the bytes of the item matching `query`, `None` on a miss
    pub fn load(
        &self,
        session: &SessionId,
        stream: &str,
        query: impl Into<ItemQuery>,
    ) -> Option<Vec<u8>> {
        let inner = &self.inner;
        let query = query.into();
        StoreStats::bump(&inner.stats.reads);

        let result = inner.slot(session).and_then(|slot| {
            let mut guard = slot.lock();
            guard.flush(&inner.pool, &inner.stats);
            match guard.entry.read(&inner.pool, stream, &query) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(
                        "Failed to read item {} of {}/{}: {}",
                        query.id, session, stream, e
                    );
                    StoreStats::bump(&inner.stats.read_errors);
                    None
                }
            }
        });

        match &result {
            Some(bytes) => inner.stats.record_hit(bytes.len()),
            None => StoreStats::bump(&inner.stats.misses),
        }
        result
    }

    /// Check whether an item matching `query` is stored
    pub fn contains(&self, session: &SessionId, stream: &str, query: impl Into<ItemQuery>) -> bool {
        let query = query.into();
        self.with_drained(session, |slot| slot.entry.contains(stream, &query))
            .unwrap_or(false)
    }

    /// Remove every version of item `id`, or the whole sub-stream when `id` is `None`
    pub fn remove(&self, session: &SessionId, stream: &str, id: Option<i32>) {
        let pool = &self.inner.pool;
        self.with_drained(session, |slot| match id {
            Some(id) => {
                let removed = slot.entry.remove_item(stream, id);
                debug!("Removed {} windows of item {} from {}/{}", removed, id, session, stream);
            }
            None => {
                if let Some(path) = slot.entry.remove_stream(pool, stream) {
                    debug!("Removed sub-stream {}/{} ({})", session, stream, path.display());
                }
            }
        });
    }

    /// Drop a session with all its sub-streams and files
    pub fn unbind(&self, session: &SessionId) {
        let inner = &self.inner;
        let Some(slot) = inner.sessions.write().remove(session) else {
            return;
        };

        let mut guard = slot.lock();
        guard.unbound = true;
        guard.pending.clear();
        let removed = guard.entry.clear(&inner.pool);
        drop(guard);

        inner.layout.remove_session_dir(session);
        debug!("Unbound session {} ({} sub-streams)", session, removed);
    }

    /// Up to `count` most recently written windows of a sub-stream, newest first
    pub fn recent_windows(&self, session: &SessionId, stream: &str, count: usize) -> Vec<Window> {
        self.inner
            .slot(session)
            .map(|slot| slot.lock().entry.recent_windows(stream, count))
            .unwrap_or_default()
    }

    /// Write out every queued write now
    pub fn flush(&self) {
        for slot in self.inner.all_slots() {
            slot.lock().flush(&self.inner.pool, &self.inner.stats);
        }
    }

    /// Stop the flusher, drain queued writes, save the registry, and close all handles.
    ///
    /// Later calls are no-ops.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = &self.inner;

        if let Some(flusher) = &self.flusher {
            flusher.stop();
        }
        self.flush();

        if inner.config.persist_index {
            let entries: Vec<SessionEntry> = inner
                .all_slots()
                .iter()
                .map(|slot| slot.lock().entry.clone())
                .collect();
            if let Err(e) = snapshot::save(&inner.layout.index_path(), &entries) {
                error!("Failed to save session registry: {}", e);
            }
        }

        inner.pool.shutdown();
        info!("Page store at {} shut down", inner.layout.store_dir().display());
    }

    /// Run `f` on a session after writing out its queued writes
    fn with_drained<T>(&self, session: &SessionId, f: impl FnOnce(&mut SessionSlot) -> T) -> Option<T> {
        let slot = self.inner.slot(session)?;
        let mut guard = slot.lock();
        guard.flush(&self.inner.pool, &self.inner.stats);
        Some(f(&mut guard))
    }
}

impl Drop for BlobStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
