//! Peer identities and their self-announced metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign, Deref};
use std::str::FromStr;

/// Milliseconds since epoch.
pub type Timestamp = u64;

/// Maximum length in bytes of a node alias.
pub const MAX_ALIAS_LENGTH: usize = 32;

/// Number of raw bytes in a public key a node id can be derived from.
pub const NODE_KEY_BYTES: usize = 32;

/// Stable peer identifier, typically derived from the peer's public key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a node id from a raw public key.
    pub fn from_key(key: &[u8; NODE_KEY_BYTES]) -> Self {
        Self(hex::encode(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Capability bitmask advertised in node announcements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Features(u64);

impl Features {
    /// No capabilities.
    pub const NONE: Features = Features(0);
    /// The node serves repositories to other peers.
    pub const SEED: Features = Features(0b1);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Whether every capability in `other` is also set here.
    pub const fn has(&self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Features) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for Features {
    type Output = Features;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl BitOrAssign for Features {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Errors that can occur when validating a node alias.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AliasError {
    #[error("alias cannot be empty")]
    Empty,
    #[error("alias cannot be greater than {MAX_ALIAS_LENGTH} bytes")]
    MaxBytesExceeded,
    #[error("alias cannot contain whitespace or control characters")]
    InvalidCharacter,
}

/// Display name chosen by a node. Not unique across the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Alias(String);

impl FromStr for Alias {
    type Err = AliasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AliasError::Empty);
        }
        if s.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(AliasError::InvalidCharacter);
        }
        if s.len() > MAX_ALIAS_LENGTH {
            return Err(AliasError::MaxBytesExceeded);
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for Alias {
    type Error = AliasError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value)
    }
}

impl From<Alias> for String {
    fn from(value: Alias) -> Self {
        value.0
    }
}

impl Deref for Alias {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node as last announced by itself.
///
/// Records are last-writer-wins on `timestamp`: a stored record is only ever
/// replaced by one with a strictly greater timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub features: Features,
    pub alias: Alias,
    /// Anti-spam proof-of-work score carried by the announcement.
    #[serde(default)]
    pub pow: u32,
    /// Time of the node's most recent self-announcement.
    pub timestamp: Timestamp,
}

impl NodeRecord {
    pub fn new(id: NodeId, alias: Alias, timestamp: Timestamp) -> Self {
        Self {
            id,
            features: Features::NONE,
            alias,
            pow: 0,
            timestamp,
        }
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn with_pow(mut self, pow: u32) -> Self {
        self.pow = pow;
        self
    }

    pub fn is_seed(&self) -> bool {
        self.features.has(Features::SEED)
    }
}
