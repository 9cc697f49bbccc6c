//! Core type definitions for PageStore
//!
//! Item identities, lookup queries, and session identifiers shared by the
//! storage engine and the command-line front end.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Identity of one stored blob: an item id plus its version and sub-version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{id}.{version}.{sub_version}")]
pub struct ItemKey {
    pub id: i32,
    pub version: i32,
    pub sub_version: i32,
}

impl ItemKey {
    /// Create a new item key
    #[must_use]
    pub const fn new(id: i32, version: i32, sub_version: i32) -> Self {
        Self {
            id,
            version,
            sub_version,
        }
    }
}

/// Lookup selector for stored items.
///
/// - `version` and `sub_version` both set: exact match.
/// - `version` set, `sub_version` unset: highest sub-version of that version.
/// - `version` unset: the occurrence of `id` written most recently relative to
///   the ledger's write cursor. `sub_version` is ignored in this mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ItemQuery {
    pub id: i32,
    pub version: Option<i32>,
    pub sub_version: Option<i32>,
}

impl ItemQuery {
    /// Match exactly one key
    #[must_use]
    pub const fn exact(key: ItemKey) -> Self {
        Self {
            id: key.id,
            version: Some(key.version),
            sub_version: Some(key.sub_version),
        }
    }

    /// Match the most recently written occurrence of `id`, whatever its version
    #[must_use]
    pub const fn latest(id: i32) -> Self {
        Self {
            id,
            version: None,
            sub_version: None,
        }
    }

    /// Match the highest sub-version stored for `version`
    #[must_use]
    pub const fn newest_sub_version(id: i32, version: i32) -> Self {
        Self {
            id,
            version: Some(version),
            sub_version: None,
        }
    }

    /// Build a query from raw integers, treating negative values as wildcards
    #[must_use]
    pub const fn from_raw(id: i32, version: i32, sub_version: i32) -> Self {
        Self {
            id,
            version: if version < 0 { None } else { Some(version) },
            sub_version: if sub_version < 0 {
                None
            } else {
                Some(sub_version)
            },
        }
    }

    /// Returns the exact key when neither component is a wildcard
    #[must_use]
    pub const fn as_exact(&self) -> Option<ItemKey> {
        match (self.version, self.sub_version) {
            (Some(version), Some(sub_version)) => Some(ItemKey::new(self.id, version, sub_version)),
            _ => None,
        }
    }
}

impl From<ItemKey> for ItemQuery {
    fn from(key: ItemKey) -> Self {
        Self::exact(key)
    }
}

/// Identifier of a session owning a group of sub-streams
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct SessionId(String);

impl SessionId {
    /// Create a new session id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the session id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name used for this session on disk
    #[must_use]
    pub fn dir_name(&self) -> String {
        encode_component(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Percent-encode `name` into a single path component.
///
/// Only `A-Z a-z 0-9 - _ . ~` pass through, so distinct names always map to
/// distinct components. Names that would resolve to the parent or current
/// directory get their dots encoded, and the empty name becomes a lone `%`,
/// which no other input produces.
#[must_use]
pub fn encode_component(name: &str) -> String {
    let encoded = urlencoding::encode(name);
    if encoded.is_empty() {
        "%".to_string()
    } else if encoded.chars().all(|c| c == '.') {
        encoded.replace('.', "%2E")
    } else {
        encoded.into_owned()
    }
}
