use serde::{Deserialize, Serialize};
use std::fmt;

use crate::node::{NodeId, Timestamp};

/// Repository identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(String);

impl RepoId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RepoId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RepoId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Latest known ref announcement of a node for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementRecord {
    pub node: NodeId,
    pub rid: RepoId,
    pub created_at: Timestamp,
    /// When the announcement was last relayed by us, if ever.
    pub broadcasted_at: Option<Timestamp>,
}

impl AnnouncementRecord {
    pub fn new(node: NodeId, rid: RepoId, created_at: Timestamp) -> Self {
        Self {
            node,
            rid,
            created_at,
            broadcasted_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.broadcasted_at.is_none()
    }
}

/// One metadata refresh event of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub node: NodeId,
    pub time: Timestamp,
}
