//! On-disk layout of the store
//!
//! ```text
//! <root_dir>/<app_name>-filestore/
//!   store.index              registry snapshot (present only between runs)
//!   <session>/pm-<stream>    one backing file per sub-stream
//! ```
//!
//! Session ids and stream names are percent-encoded: each maps to exactly one
//! path component, and two different names never share a file.

use pagestore_common::{SessionId, encode_component};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

/// Prefix of every backing file name
pub const STREAM_FILE_PREFIX: &str = "pm-";

/// File name of the registry snapshot
pub const INDEX_FILE_NAME: &str = "store.index";

const MKDIR_ROUNDS: usize = 5;
const MKDIR_ATTEMPTS_PER_ROUND: usize = 10;
const MKDIR_BACKOFF: Duration = Duration::from_millis(100);

/// Path resolution for one store directory
#[derive(Clone, Debug)]
pub struct StoreLayout {
    store_dir: PathBuf,
}

impl StoreLayout {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
        }
    }

    /// Folder holding every session directory
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Location of the registry snapshot
    pub fn index_path(&self) -> PathBuf {
        self.store_dir.join(INDEX_FILE_NAME)
    }

    /// Directory of one session, optionally created on the way
    pub fn session_dir(&self, session: &SessionId, create: bool) -> PathBuf {
        let dir = self.store_dir.join(session.dir_name());
        if create {
            ensure_dir(&dir);
        }
        dir
    }

    /// Backing file of one sub-stream
    pub fn stream_path(&self, session: &SessionId, stream: &str, create_dir: bool) -> PathBuf {
        self.session_dir(session, create_dir)
            .join(format!("{STREAM_FILE_PREFIX}{}", encode_component(stream)))
    }

    /// Remove a session directory once its files are gone.
    ///
    /// A directory that still holds files (for example ones whose delete is
    /// deferred behind a checked-out handle) is left in place.
    pub fn remove_session_dir(&self, session: &SessionId) {
        let dir = self.session_dir(session, false);
        match std::fs::remove_dir(&dir) {
            Ok(()) => debug!("Removed session directory {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("Keeping session directory {}: {}", dir.display(), e),
        }
    }
}

/// Create `dir` and its parents, retrying under filesystem contention.
///
/// Gives up after a bounded number of attempts and logs; never fails the caller.
fn ensure_dir(dir: &Path) {
    for round in 0..MKDIR_ROUNDS {
        for _ in 0..MKDIR_ATTEMPTS_PER_ROUND {
            if dir.is_dir() || std::fs::create_dir_all(dir).is_ok() {
                return;
            }
        }
        if round + 1 < MKDIR_ROUNDS {
            thread::sleep(MKDIR_BACKOFF);
        }
    }
    error!("Failed to create directory {}", dir.display());
}
