use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::node::{NodeId, Timestamp};

/// Address family tag.
///
/// Tags compare by their string form, so `Other("ip4")` and `Ipv4` are the
/// same family and encode to the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AddressType {
    Ipv4,
    Ipv6,
    Dns,
    Onion,
    Other(String),
}

impl AddressType {
    pub fn as_str(&self) -> &str {
        match self {
            AddressType::Ipv4 => "ip4",
            AddressType::Ipv6 => "ip6",
            AddressType::Dns => "dns",
            AddressType::Onion => "onion",
            AddressType::Other(tag) => tag,
        }
    }

    /// The well-known variant for reserved tags carried in `Other`.
    pub fn canonical(self) -> Self {
        match self {
            AddressType::Other(tag) => AddressType::from(tag.as_str()),
            known => known,
        }
    }
}

impl PartialEq for AddressType {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for AddressType {}

impl Hash for AddressType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl PartialOrd for AddressType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AddressType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl From<&str> for AddressType {
    fn from(value: &str) -> Self {
        match value {
            "ip4" => AddressType::Ipv4,
            "ip6" => AddressType::Ipv6,
            "dns" => AddressType::Dns,
            "onion" => AddressType::Onion,
            other => AddressType::Other(other.to_owned()),
        }
    }
}

impl From<String> for AddressType {
    fn from(value: String) -> Self {
        AddressType::from(value.as_str())
    }
}

impl From<AddressType> for String {
    fn from(value: AddressType) -> Self {
        value.as_str().to_owned()
    }
}

impl FromStr for AddressType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(AddressType::from(s))
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an address was learned from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// Announced by the node itself and relayed over gossip.
    #[default]
    Peer,
    /// Configured seed address.
    Bootstrap,
    /// Added by hand.
    Imported,
}

/// An address as announced, before any dial history is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownAddress {
    pub kind: AddressType,
    pub value: String,
    pub source: Source,
    /// Time the address was announced.
    pub timestamp: Timestamp,
}

impl KnownAddress {
    pub fn new(
        kind: AddressType,
        value: impl Into<String>,
        source: Source,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            kind: kind.canonical(),
            value: value.into(),
            source,
            timestamp,
        }
    }
}

/// A stored address claim of a node, together with its dial history.
///
/// Claims are unique on `(node, kind, value)`; several nodes may claim the
/// same `(kind, value)` at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub node: NodeId,
    pub kind: AddressType,
    pub value: String,
    pub source: Source,
    pub timestamp: Timestamp,
    pub last_attempt: Option<Timestamp>,
    pub last_success: Option<Timestamp>,
}

impl AddressRecord {
    pub fn new(node: NodeId, address: KnownAddress) -> Self {
        Self {
            node,
            kind: address.kind,
            value: address.value,
            source: address.source,
            timestamp: address.timestamp,
            last_attempt: None,
            last_success: None,
        }
    }

    /// Merge a repeated sighting of this address into the record.
    ///
    /// The announced time only moves forward. Dial history is untouched.
    pub fn refresh(&mut self, address: &KnownAddress) {
        if address.timestamp >= self.timestamp {
            self.timestamp = address.timestamp;
            self.source = address.source;
        }
    }

    pub fn matches(&self, kind: &AddressType, value: &str) -> bool {
        &self.kind == kind && self.value == value
    }
}
