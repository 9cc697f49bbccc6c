//! PageStore Common - Shared types and utilities
//!
//! This crate provides the item identity types, error definitions, and
//! configuration used by the storage engine and its front ends.

pub mod config;
pub mod error;
pub mod types;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use types::*;
