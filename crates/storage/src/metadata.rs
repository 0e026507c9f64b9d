//! Append-only log of node metadata refreshes.

use std::time::Duration;

use peerbook_types::{MetadataEntry, NodeId, Timestamp};
use sled::Batch;
use tracing::debug;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::keys;
use crate::retention::millis;

/// Metadata refresh log operations.
pub trait MetadataLog {
    /// Append a refresh event. Returns `false` if the exact entry exists.
    fn record_refresh(&self, node: &NodeId, time: Timestamp) -> Result<bool>;
    /// Latest refresh recorded for the node.
    fn latest(&self, node: &NodeId) -> Result<Option<Timestamp>>;
    /// Whether fresh metadata should be solicited from the node.
    fn is_stale(&self, node: &NodeId, now: Timestamp, max_age: Duration) -> Result<bool>;
    fn history(&self, node: &NodeId) -> Result<Vec<MetadataEntry>>;
    fn entries(&self) -> Result<Vec<MetadataEntry>>;
    /// Remove up to `limit` entries recorded before `oldest`.
    fn prune_history(&self, oldest: Timestamp, limit: Option<usize>) -> Result<usize>;
}

fn decode(key: &[u8]) -> Result<MetadataEntry> {
    keys::split_metadata(key)
        .map(|(node, time)| MetadataEntry { node, time })
        .ok_or(StoreError::Corrupted("metadata"))
}

impl MetadataLog for Database {
    fn record_refresh(&self, node: &NodeId, time: Timestamp) -> Result<bool> {
        let _guard = self.write();
        let inserted = self
            .metadata
            .compare_and_swap(
                keys::metadata(node, time),
                None as Option<&[u8]>,
                Some(Vec::<u8>::new()),
            )?
            .is_ok();
        Ok(inserted)
    }

    fn latest(&self, node: &NodeId) -> Result<Option<Timestamp>> {
        let _guard = self.read();
        match self.metadata.scan_prefix(keys::node(node)).next_back() {
            Some(item) => {
                let (key, _) = item?;
                Ok(Some(decode(&key)?.time))
            }
            None => Ok(None),
        }
    }

    fn is_stale(&self, node: &NodeId, now: Timestamp, max_age: Duration) -> Result<bool> {
        Ok(self
            .latest(node)?
            .map_or(true, |t| t.saturating_add(millis(max_age)) < now))
    }

    fn history(&self, node: &NodeId) -> Result<Vec<MetadataEntry>> {
        let _guard = self.read();
        self.metadata
            .scan_prefix(keys::node(node))
            .keys()
            .map(|key| decode(&key?))
            .collect()
    }

    fn entries(&self) -> Result<Vec<MetadataEntry>> {
        let _guard = self.read();
        self.metadata.iter().keys().map(|key| decode(&key?)).collect()
    }

    fn prune_history(&self, oldest: Timestamp, limit: Option<usize>) -> Result<usize> {
        let _guard = self.write();
        let mut batch = Batch::default();
        let mut count = 0;

        for key in self.metadata.iter().keys() {
            if limit.map_or(false, |l| count >= l) {
                break;
            }
            let key = key?;
            if decode(&key)?.time < oldest {
                batch.remove(key);
                count += 1;
            }
        }
        self.metadata.apply_batch(batch)?;
        debug!("Pruned {count} metadata entries older than {oldest}");

        Ok(count)
    }
}
