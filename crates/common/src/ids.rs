//! Type-safe identifier newtypes for listener configurations.
//!
//! These types keep the store-assigned identity (`uid`), the human address
//! (`namespace`/`name`) and the optimistic-concurrency token apart so that
//! one cannot be passed where another is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identity of a listener configuration object.
///
/// Two configurations with the same name but different UIDs are different
/// objects (the second one replaced the first in the store).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigUid(String);

impl ConfigUid {
    /// Create a new random UID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConfigUid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConfigUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConfigUid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Store-assigned version of a configuration object.
///
/// Updates carry the version they were computed from; the store rejects
/// an update whose version no longer matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    pub fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// The version assigned after a successful write
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Namespace/name address of a configuration object in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigRef {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ConfigRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Cluster-scoped reference (empty namespace)
    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new("", name)
    }
}

impl fmt::Display for ConfigRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}
