use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use peerbook_types::{AddressRecord, AnnouncementRecord, NodeId, NodeRecord, Timestamp};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::TransactionalTree;
use sled::{Db, IVec, Transactional, Tree};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{abort, Result, StoreError, TxResult};
use crate::keys;

/// Rows deleted together with one or more nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removed {
    pub nodes: usize,
    pub addresses: usize,
    pub announcements: usize,
    pub metadata: usize,
}

/// Sled-backed persistence for the address book, the announcement tracker
/// and the metadata log.
///
/// Handles are cheap to clone and share one underlying database. Every
/// multi-row write commits in a single multi-tree transaction. Writers hold
/// an exclusive gate for the duration of one short transaction; readers take
/// the gate shared, so scans never observe a half-written node.
#[derive(Clone)]
pub struct Database {
    db: Db,
    pub(crate) nodes: Tree,
    pub(crate) addresses: Tree,
    pub(crate) announcements: Tree,
    /// Index of unbroadcast announcements, keyed by creation time.
    pub(crate) pending: Tree,
    pub(crate) metadata: Tree,
    gate: Arc<RwLock<()>>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Database(..)")
    }
}

/// Transactional views of every tree.
pub(crate) struct Tx<'a> {
    pub nodes: &'a TransactionalTree,
    pub addresses: &'a TransactionalTree,
    pub announcements: &'a TransactionalTree,
    pub pending: &'a TransactionalTree,
    pub metadata: &'a TransactionalTree,
}

impl Tx<'_> {
    pub fn node(&self, id: &NodeId) -> TxResult<Option<NodeRecord>> {
        get_tx(self.nodes, &keys::node(id))
    }

    /// Fetch a node, aborting the transaction with `UnknownNode` if absent.
    pub fn require_node(&self, id: &NodeId) -> TxResult<NodeRecord> {
        match self.node(id)? {
            Some(node) => Ok(node),
            None => abort(StoreError::UnknownNode(id.clone())),
        }
    }
}

pub(crate) fn get_tx<T: DeserializeOwned>(
    tree: &TransactionalTree,
    key: &[u8],
) -> TxResult<Option<T>> {
    match tree.get(key)? {
        Some(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => abort(e.into()),
        },
        None => Ok(None),
    }
}

pub(crate) fn put_tx<T: Serialize>(
    tree: &TransactionalTree,
    key: &[u8],
    value: &T,
) -> TxResult<()> {
    let bytes = match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(e) => return abort(e.into()),
    };
    tree.insert(key, bytes)?;
    Ok(())
}

pub(crate) fn get<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> Result<Option<T>> {
    tree.get(key)?
        .map(|v| serde_json::from_slice(&v))
        .transpose()
        .map_err(Into::into)
}

pub(crate) fn scan<T: DeserializeOwned>(tree: &Tree, prefix: &[u8]) -> Result<Vec<T>> {
    tree.scan_prefix(prefix)
        .map(|r| {
            let (_, v) = r?;
            Ok(serde_json::from_slice::<T>(&v)?)
        })
        .collect()
}

/// A node together with its stored address claims.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub node: NodeRecord,
    pub addresses: Vec<AddressRecord>,
}

impl Entry {
    /// Most recent dial attempt over all addresses of the node.
    pub fn last_attempt(&self) -> Option<Timestamp> {
        self.addresses.iter().filter_map(|a| a.last_attempt).max()
    }

    pub fn last_success(&self) -> Option<Timestamp> {
        self.addresses.iter().filter_map(|a| a.last_success).max()
    }
}

/// State a node was ranked with before removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ranked {
    pub timestamp: Timestamp,
    pub last_success: Option<Timestamp>,
}

impl From<&Entry> for Ranked {
    fn from(entry: &Entry) -> Self {
        Self {
            timestamp: entry.node.timestamp,
            last_success: entry.last_success(),
        }
    }
}

/// Keys of everything stored under one node.
struct Dependents {
    node: Vec<u8>,
    addresses: Vec<IVec>,
    announcements: Vec<IVec>,
    pending: Vec<Vec<u8>>,
    metadata: Vec<IVec>,
}

impl Database {
    /// Open a store at the given path. Creates a new empty store if an
    /// existing one isn't found.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// Open an isolated store that is discarded when the last handle drops.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    pub fn with_config(config: &StoreConfig) -> Result<Self> {
        let flush_every_ms = (config.flush_every_ms > 0).then_some(config.flush_every_ms);
        let sled_config = sled::Config::new()
            .cache_capacity(config.cache_capacity_bytes)
            .flush_every_ms(flush_every_ms);
        let sled_config = match &config.path {
            Some(path) => sled_config.path(path),
            None => sled_config.temporary(true),
        };
        Self::from_db(sled_config.open()?)
    }

    fn from_db(db: Db) -> Result<Self> {
        let nodes = db.open_tree("nodes")?;
        let addresses = db.open_tree("addresses")?;
        let announcements = db.open_tree("announcements")?;
        let pending = db.open_tree("pending")?;
        let metadata = db.open_tree("metadata")?;

        info!(
            "Opened peer store with {} nodes, {} addresses, {} announcements ({} pending)",
            nodes.len(),
            addresses.len(),
            announcements.len(),
            pending.len()
        );

        Ok(Self {
            db,
            nodes,
            addresses,
            announcements,
            pending,
            metadata,
            gate: Arc::new(RwLock::new(())),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Whether the database was recovered from a previous run.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }

    pub fn len_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write()
    }

    /// Run `f` atomically across all trees. Callers hold the write gate.
    pub(crate) fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&Tx<'_>) -> TxResult<T>,
    {
        (
            &self.nodes,
            &self.addresses,
            &self.announcements,
            &self.pending,
            &self.metadata,
        )
            .transaction(|(nodes, addresses, announcements, pending, metadata)| {
                f(&Tx {
                    nodes,
                    addresses,
                    announcements,
                    pending,
                    metadata,
                })
            })
            .map_err(StoreError::from)
    }

    pub(crate) fn node(&self, id: &NodeId) -> Result<Option<NodeRecord>> {
        get(&self.nodes, &keys::node(id))
    }

    /// Every node with its addresses. Callers hold the gate.
    pub(crate) fn node_entries(&self) -> Result<Vec<Entry>> {
        let mut entries = Vec::with_capacity(self.nodes.len());
        for item in self.nodes.iter() {
            let (key, value) = item?;
            let node: NodeRecord = serde_json::from_slice(&value)?;
            let addresses = scan(&self.addresses, &key)?;
            entries.push(Entry { node, addresses });
        }
        Ok(entries)
    }

    fn dependents(&self, id: &NodeId) -> Result<Dependents> {
        let node = keys::node(id);
        let addresses = self
            .addresses
            .scan_prefix(&node)
            .keys()
            .collect::<Result<Vec<_>, _>>()?;

        let mut announcements = Vec::new();
        let mut pending = Vec::new();
        for item in self.announcements.scan_prefix(&node) {
            let (key, value) = item?;
            let record: AnnouncementRecord = serde_json::from_slice(&value)?;
            if record.is_pending() {
                pending.push(keys::pending(record.created_at, &key));
            }
            announcements.push(key);
        }

        let metadata = self
            .metadata
            .scan_prefix(&node)
            .keys()
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Dependents {
            node,
            addresses,
            announcements,
            pending,
            metadata,
        })
    }

    /// Delete nodes and everything stored under them in one transaction.
    ///
    /// Dependents are removed first, then the node rows. A node is skipped if
    /// it is gone, or if it was ranked and has since been re-announced or
    /// dialed successfully. Callers hold the write gate.
    pub(crate) fn remove_nodes(&self, targets: &[(NodeId, Option<Ranked>)]) -> Result<Removed> {
        let mut doomed = Vec::with_capacity(targets.len());
        for (id, ranked) in targets {
            let Some(node) = self.node(id)? else {
                continue;
            };
            if let Some(ranked) = ranked {
                let addresses = scan(&self.addresses, &keys::node(id))?;
                let current = Ranked::from(&Entry { node, addresses });
                if current != *ranked {
                    debug!("Skipping removal of node {id}: changed since it was ranked");
                    continue;
                }
            }
            doomed.push(self.dependents(id)?);
        }
        if doomed.is_empty() {
            return Ok(Removed::default());
        }

        self.transact(|tx| {
            for d in &doomed {
                for key in &d.addresses {
                    tx.addresses.remove(&key[..])?;
                }
                for key in &d.pending {
                    tx.pending.remove(key.as_slice())?;
                }
                for key in &d.announcements {
                    tx.announcements.remove(&key[..])?;
                }
                for key in &d.metadata {
                    tx.metadata.remove(&key[..])?;
                }
            }
            for d in &doomed {
                tx.nodes.remove(d.node.as_slice())?;
            }
            Ok(())
        })?;

        let removed = doomed.iter().fold(Removed::default(), |mut acc, d| {
            acc.nodes += 1;
            acc.addresses += d.addresses.len();
            acc.announcements += d.announcements.len();
            acc.metadata += d.metadata.len();
            acc
        });
        debug!(
            "Removed {} nodes with {} addresses and {} announcements",
            removed.nodes, removed.addresses, removed.announcements
        );
        Ok(removed)
    }
}
