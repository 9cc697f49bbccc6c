//! PageStore Storage Engine - circular blob files with pooled handles
//!
//! This crate implements the storage engine for PageStore including:
//! - A bounded, reference-counted pool of open backing files
//! - Window ledgers laying out keyed blobs inside size-capped circular files
//! - Per-session sub-streams with least-recently-used eviction
//! - Deferred writes drained by a background flusher thread
//! - Registry snapshots so ledgers survive a clean restart

pub mod flusher;
pub mod handle;
pub mod layout;
pub mod ledger;
pub mod pool;
pub mod session;
pub mod snapshot;
pub mod stats;
pub mod store;

// Re-exports
pub use handle::BackingFile;
pub use layout::{INDEX_FILE_NAME, STREAM_FILE_PREFIX, StoreLayout};
pub use ledger::{Region, Window, WindowLedger};
pub use pool::{HandlePool, HandleState, PoolStats, PooledHandle};
pub use session::{Placement, SessionEntry, SubStream};
pub use stats::{StatsSnapshot, StoreStats};
pub use store::BlobStore;
