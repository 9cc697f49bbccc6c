//! Error types for PageStore
//!
//! This module defines the common error types used throughout the system.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for PageStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for PageStore
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    // Handle pool misuse
    #[error("handle for {path:?} is not checked out")]
    HandleNotCheckedOut { path: PathBuf },

    #[error("handle for {path:?} is not managed by this pool")]
    UnknownHandle { path: PathBuf },

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error reports a caller bug rather than an environmental condition
    #[must_use]
    pub const fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::HandleNotCheckedOut { .. } | Self::UnknownHandle { .. } | Self::Configuration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_misuse() {
        let err = Error::HandleNotCheckedOut {
            path: PathBuf::from("/tmp/pm-main"),
        };
        assert!(err.is_misuse());
        assert!(Error::configuration("capacity").is_misuse());
    }

    #[test]
    fn test_io_errors_are_not_misuse() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::DiskIo(_)));
        assert!(!err.is_misuse());
        assert!(!Error::storage("short read").is_misuse());
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnknownHandle {
            path: PathBuf::from("pm-a"),
        };
        assert_eq!(
            err.to_string(),
            "handle for \"pm-a\" is not managed by this pool"
        );
    }
}
