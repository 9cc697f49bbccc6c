//! Configuration types for PageStore
//!
//! All options are supplied when the store is opened and stay fixed for its
//! lifetime.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root under which `<app_name>-filestore/<session>/pm-<stream>` files live
    pub root_dir: PathBuf,
    /// Application name, used as the store folder prefix
    pub app_name: String,
    /// Size cap of one sub-stream file before its write cursor wraps
    pub max_bytes_per_sub_stream: u64,
    /// Aggregate cap per session before least recently used sub-streams are evicted
    pub max_bytes_per_session: u64,
    /// Maximum number of simultaneously open file handles
    pub handle_pool_capacity: usize,
    /// Write through on the caller's thread instead of the background flusher
    pub synchronous: bool,
    /// Poll interval of the background flusher (milliseconds)
    pub flush_interval_ms: u64,
    /// Save the session registry on shutdown and reload it on open
    pub persist_index: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir(),
            app_name: "pagestore".to_string(),
            max_bytes_per_sub_stream: 10 * 1024 * 1024, // 10 MB
            max_bytes_per_session: 100 * 1024 * 1024,   // 100 MB
            handle_pool_capacity: 50,
            synchronous: false,
            flush_interval_ms: 100,
            persist_index: true,
        }
    }
}

impl StoreConfig {
    /// Create config rooted at the given directory
    pub fn with_root_dir(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    /// Flusher poll interval
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Folder holding every session directory
    #[must_use]
    pub fn store_dir(&self) -> PathBuf {
        self.root_dir.join(format!("{}-filestore", self.app_name))
    }

    /// Check option consistency
    pub fn validate(&self) -> Result<()> {
        if self.handle_pool_capacity < 1 {
            return Err(Error::configuration(
                "handle pool capacity must be at least 1",
            ));
        }
        if self.max_bytes_per_session < self.max_bytes_per_sub_stream {
            return Err(Error::configuration(format!(
                "max bytes per session ({}) must not be smaller than max bytes per sub-stream ({})",
                self.max_bytes_per_session, self.max_bytes_per_sub_stream
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::configuration("flush interval must be positive"));
        }
        if self.app_name.is_empty() {
            return Err(Error::configuration("app name must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.handle_pool_capacity, 50);
        assert!(!config.synchronous);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = StoreConfig {
            handle_pool_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_session_smaller_than_sub_stream_rejected() {
        let config = StoreConfig {
            max_bytes_per_sub_stream: 2000,
            max_bytes_per_session: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_dir_layout() {
        let config = StoreConfig {
            app_name: "shop".into(),
            ..StoreConfig::with_root_dir("/var/tmp")
        };
        assert_eq!(config.store_dir(), PathBuf::from("/var/tmp/shop-filestore"));
    }

    #[test]
    fn test_partial_toml() {
        let config: StoreConfig = toml::from_str(
            r#"
            root_dir = "/srv/pages"
            synchronous = true
            "#,
        )
        .unwrap();
        assert_eq!(config.root_dir, PathBuf::from("/srv/pages"));
        assert!(config.synchronous);
        assert_eq!(config.flush_interval_ms, 100);
    }
}
