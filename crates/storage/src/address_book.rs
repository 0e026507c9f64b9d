//! Known peers, their address claims and dial history.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use peerbook_types::{
    AddressRecord, AddressType, Features, KnownAddress, NodeId, NodeRecord, Timestamp,
};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_COOLDOWN;
use crate::database::{get_tx, put_tx, scan, Database, Entry, Ranked, Removed, Tx};
use crate::error::{abort, Result, StoreError, TxResult};
use crate::keys;
use crate::retention::{millis, ClaimPolicy, PrunePolicy, PruneReport};

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Inserted,
    Updated,
    /// The stored row already carried this information.
    Unchanged,
}

impl UpsertResult {
    /// Whether the write carried new information, i.e. is worth relaying.
    pub fn is_changed(&self) -> bool {
        !matches!(self, UpsertResult::Unchanged)
    }
}

/// Filter and ordering parameters for dial candidate selection.
#[derive(Debug, Clone)]
pub struct PeerCriteria {
    pub now: Timestamp,
    /// Nodes attempted more recently than this are skipped.
    pub cooldown: Duration,
    pub limit: Option<usize>,
    /// Nodes never returned, e.g. ourselves or peers already connected.
    pub exclude: HashSet<NodeId>,
    /// Only consider these address families. `None` accepts any.
    pub address_types: Option<Vec<AddressType>>,
    pub required_features: Features,
}

impl PeerCriteria {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now,
            cooldown: DEFAULT_COOLDOWN,
            limit: None,
            exclude: HashSet::new(),
            address_types: None,
            required_features: Features::NONE,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn excluding(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.exclude.extend(nodes);
        self
    }

    pub fn with_address_types(mut self, types: impl IntoIterator<Item = AddressType>) -> Self {
        self.address_types = Some(types.into_iter().collect());
        self
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.required_features = features;
        self
    }

    fn accepts(&self, kind: &AddressType) -> bool {
        self.address_types
            .as_ref()
            .map_or(true, |types| types.contains(kind))
    }

    fn in_cooldown(&self, last_attempt: Option<Timestamp>) -> bool {
        last_attempt.map_or(false, |t| self.now.saturating_sub(t) < millis(self.cooldown))
    }
}

/// A node to dial and the address to dial it on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCandidate {
    pub node: NodeRecord,
    pub address: AddressRecord,
}

/// Ranked dial candidates, best first. Can be iterated any number of times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCandidates(Vec<PeerCandidate>);

impl PeerCandidates {
    pub fn iter(&self) -> std::slice::Iter<'_, PeerCandidate> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> + '_ {
        self.0.iter().map(|c| &c.node.id)
    }
}

impl IntoIterator for PeerCandidates {
    type Item = PeerCandidate;
    type IntoIter = std::vec::IntoIter<PeerCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a PeerCandidates {
    type Item = &'a PeerCandidate;
    type IntoIter = std::slice::Iter<'a, PeerCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Dial ranking, best first: latest success, then proof-of-work, then the
/// freshest announcement. Node id breaks ties.
fn by_rank(
    a: &NodeRecord,
    a_success: Option<Timestamp>,
    b: &NodeRecord,
    b_success: Option<Timestamp>,
) -> Ordering {
    b_success
        .cmp(&a_success)
        .then_with(|| b.pow.cmp(&a.pow))
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| a.id.cmp(&b.id))
}

/// Ranking of addresses, best first: latest success, then the freshest claim.
fn by_address_rank(a: &AddressRecord, b: &AddressRecord) -> Ordering {
    b.last_success
        .cmp(&a.last_success)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| a.node.cmp(&b.node))
        .then_with(|| a.kind.cmp(&b.kind))
        .then_with(|| a.value.cmp(&b.value))
}

/// Nodes to evict, worst ranked first, with the state they were ranked in.
fn eviction_order(
    mut entries: Vec<Entry>,
    policy: &PrunePolicy,
    now: Timestamp,
) -> Vec<(NodeId, Option<Ranked>)> {
    entries.sort_by(|a, b| by_rank(&b.node, b.last_success(), &a.node, a.last_success()));

    let (expired, retained): (Vec<Entry>, Vec<Entry>) = entries.into_iter().partition(|e| {
        policy.is_expired(e.node.timestamp, now)
            && e.last_success().map_or(true, |t| policy.is_expired(t, now))
    });
    let excess = policy
        .max_nodes
        .map_or(0, |max| retained.len().saturating_sub(max));

    expired
        .into_iter()
        .chain(retained.into_iter().take(excess))
        .map(|e| {
            let ranked = Ranked::from(&e);
            (e.node.id, Some(ranked))
        })
        .collect()
}

/// An address neither announced nor successfully dialed within the age window.
fn is_stale_address(record: &AddressRecord, policy: &PrunePolicy, now: Timestamp) -> bool {
    policy.is_expired(record.timestamp, now)
        && record
            .last_success
            .map_or(true, |t| policy.is_expired(t, now))
}

fn put_node(tx: &Tx<'_>, record: &NodeRecord) -> TxResult<UpsertResult> {
    let key = keys::node(&record.id);
    let result = match tx.node(&record.id)? {
        None => UpsertResult::Inserted,
        Some(stored) => match record.timestamp.cmp(&stored.timestamp) {
            Ordering::Greater => UpsertResult::Updated,
            Ordering::Equal => return Ok(UpsertResult::Unchanged),
            Ordering::Less => {
                return abort(StoreError::StaleAnnouncement {
                    node: record.id.clone(),
                    stored: stored.timestamp,
                    received: record.timestamp,
                })
            }
        },
    };
    put_tx(tx.nodes, &key, record)?;
    Ok(result)
}

fn put_address(tx: &Tx<'_>, node: &NodeId, address: &KnownAddress) -> TxResult<UpsertResult> {
    let key = keys::address(node, &address.kind, &address.value);
    match get_tx::<AddressRecord>(tx.addresses, &key)? {
        None => {
            put_tx(
                tx.addresses,
                &key,
                &AddressRecord::new(node.clone(), address.clone()),
            )?;
            Ok(UpsertResult::Inserted)
        }
        Some(stored) => {
            let mut refreshed = stored.clone();
            refreshed.refresh(address);
            if refreshed == stored {
                return Ok(UpsertResult::Unchanged);
            }
            put_tx(tx.addresses, &key, &refreshed)?;
            Ok(UpsertResult::Updated)
        }
    }
}

fn log_stale<T>(result: &Result<T>) {
    if let Err(StoreError::StaleAnnouncement {
        node,
        stored,
        received,
    }) = result
    {
        warn!("Ignoring stale announcement from {node}: received {received}, have {stored}");
    }
}

/// Address book operations.
pub trait AddressBook {
    /// Insert a node, or replace it with a strictly newer announcement.
    fn upsert_node(&self, record: NodeRecord) -> Result<UpsertResult>;
    /// Upsert a node and its announced addresses atomically.
    fn upsert_node_with_addresses(
        &self,
        record: NodeRecord,
        addresses: &[KnownAddress],
    ) -> Result<UpsertResult>;
    fn upsert_address(&self, node: &NodeId, address: KnownAddress) -> Result<UpsertResult>;
    fn record_attempt(
        &self,
        node: &NodeId,
        kind: &AddressType,
        value: &str,
        time: Timestamp,
    ) -> Result<()>;
    fn record_success(
        &self,
        node: &NodeId,
        kind: &AddressType,
        value: &str,
        time: Timestamp,
    ) -> Result<()>;
    fn get_node(&self, id: &NodeId) -> Result<Option<NodeRecord>>;
    fn addresses_of(&self, id: &NodeId) -> Result<Vec<AddressRecord>>;
    /// Every node claiming the given address.
    fn claimants(&self, kind: &AddressType, value: &str) -> Result<Vec<AddressRecord>>;
    fn nodes(&self) -> Result<Vec<NodeRecord>>;
    fn select_peers(&self, criteria: &PeerCriteria) -> Result<PeerCandidates>;
    /// Delete a node together with its addresses, announcements and metadata.
    fn remove_node(&self, id: &NodeId) -> Result<Removed>;
    fn prune(&self, policy: &PrunePolicy, now: Timestamp) -> Result<PruneReport>;
}

impl Database {
    fn update_address<F>(
        &self,
        node: &NodeId,
        kind: &AddressType,
        value: &str,
        update: F,
    ) -> Result<()>
    where
        F: Fn(&mut AddressRecord),
    {
        let key = keys::address(node, kind, value);
        let _guard = self.write();
        self.transact(|tx| {
            let Some(mut record) = get_tx::<AddressRecord>(tx.addresses, &key)? else {
                return abort(StoreError::NotFound(format!(
                    "address {kind}:{value} of node {node}"
                )));
            };
            update(&mut record);
            put_tx(tx.addresses, &key, &record)
        })
    }

    fn prune_claims(
        &self,
        grace: Duration,
        now: Timestamp,
        batch_size: usize,
        report: &mut PruneReport,
    ) -> Result<()> {
        let cutoff = now.saturating_sub(millis(grace));
        let superseded: Vec<Vec<u8>> = {
            let _guard = self.read();
            let mut claims: BTreeMap<(AddressType, String), Vec<AddressRecord>> = BTreeMap::new();
            for item in self.addresses.iter() {
                let (_, value) = item?;
                let record: AddressRecord = serde_json::from_slice(&value)?;
                claims
                    .entry((record.kind.clone(), record.value.clone()))
                    .or_default()
                    .push(record);
            }
            claims
                .into_values()
                .filter(|claimants| claimants.len() > 1)
                .flat_map(|mut claimants| {
                    claimants.sort_by(by_address_rank);
                    claimants.into_iter().skip(1)
                })
                .filter(|r| r.timestamp < cutoff)
                .map(|r| keys::address(&r.node, &r.kind, &r.value))
                .collect()
        };

        let removed = self.remove_addresses(&superseded, batch_size, report, |record| {
            record.timestamp < cutoff
        })?;
        report.claims += removed;
        Ok(())
    }

    /// Address rows of surviving nodes that fell out of the age window.
    fn prune_stale_addresses(
        &self,
        policy: &PrunePolicy,
        now: Timestamp,
        report: &mut PruneReport,
    ) -> Result<()> {
        let stale: Vec<Vec<u8>> = {
            let _guard = self.read();
            let mut stale = Vec::new();
            for item in self.addresses.iter() {
                let (key, value) = item?;
                let record: AddressRecord = serde_json::from_slice(&value)?;
                if is_stale_address(&record, policy, now) {
                    stale.push(key.to_vec());
                }
            }
            stale
        };

        let batch_size = policy.batch_size.max(1);
        let removed = self.remove_addresses(&stale, batch_size, report, |record| {
            is_stale_address(record, policy, now)
        })?;
        report.addresses += removed;
        Ok(())
    }

    /// Delete address rows in batches, one write transaction each.
    ///
    /// A row is re-read inside the transaction and only removed if `eligible`
    /// still holds, since it may have been refreshed since it was selected.
    fn remove_addresses<F>(
        &self,
        targets: &[Vec<u8>],
        batch_size: usize,
        report: &mut PruneReport,
        eligible: F,
    ) -> Result<usize>
    where
        F: Fn(&AddressRecord) -> bool,
    {
        let mut total = 0;
        for batch in targets.chunks(batch_size) {
            let _guard = self.write();
            total += self.transact(|tx| {
                let mut removed = 0usize;
                for key in batch {
                    if let Some(record) = get_tx::<AddressRecord>(tx.addresses, key)? {
                        if eligible(&record) {
                            tx.addresses.remove(key.as_slice())?;
                            removed += 1;
                        }
                    }
                }
                Ok(removed)
            })?;
            report.batches += 1;
        }
        Ok(total)
    }
}

impl AddressBook for Database {
    fn upsert_node(&self, record: NodeRecord) -> Result<UpsertResult> {
        let _guard = self.write();
        let result = self.transact(|tx| put_node(tx, &record));
        log_stale(&result);
        if let Ok(outcome) = &result {
            debug!("Node {} at {}: {:?}", record.id, record.timestamp, outcome);
        }
        result
    }

    fn upsert_node_with_addresses(
        &self,
        record: NodeRecord,
        addresses: &[KnownAddress],
    ) -> Result<UpsertResult> {
        let _guard = self.write();
        let result = self.transact(|tx| {
            let mut outcome = put_node(tx, &record)?;
            for address in addresses {
                if put_address(tx, &record.id, address)?.is_changed() && !outcome.is_changed() {
                    outcome = UpsertResult::Updated;
                }
            }
            Ok(outcome)
        });
        log_stale(&result);
        result
    }

    fn upsert_address(&self, node: &NodeId, address: KnownAddress) -> Result<UpsertResult> {
        let _guard = self.write();
        self.transact(|tx| {
            tx.require_node(node)?;
            put_address(tx, node, &address)
        })
    }

    fn record_attempt(
        &self,
        node: &NodeId,
        kind: &AddressType,
        value: &str,
        time: Timestamp,
    ) -> Result<()> {
        self.update_address(node, kind, value, |record| {
            record.last_attempt = Some(record.last_attempt.map_or(time, |t| t.max(time)));
        })
    }

    fn record_success(
        &self,
        node: &NodeId,
        kind: &AddressType,
        value: &str,
        time: Timestamp,
    ) -> Result<()> {
        self.update_address(node, kind, value, |record| {
            record.last_success = Some(record.last_success.map_or(time, |t| t.max(time)));
            record.last_attempt = Some(record.last_attempt.map_or(time, |t| t.max(time)));
        })
    }

    fn get_node(&self, id: &NodeId) -> Result<Option<NodeRecord>> {
        self.node(id)
    }

    fn addresses_of(&self, id: &NodeId) -> Result<Vec<AddressRecord>> {
        let _guard = self.read();
        scan(&self.addresses, &keys::node(id))
    }

    fn claimants(&self, kind: &AddressType, value: &str) -> Result<Vec<AddressRecord>> {
        let _guard = self.read();
        let mut claimants: Vec<AddressRecord> = scan(&self.addresses, &[])?;
        claimants.retain(|r| r.matches(kind, value));
        Ok(claimants)
    }

    fn nodes(&self) -> Result<Vec<NodeRecord>> {
        let _guard = self.read();
        scan(&self.nodes, &[])
    }

    fn select_peers(&self, criteria: &PeerCriteria) -> Result<PeerCandidates> {
        let entries = {
            let _guard = self.read();
            self.node_entries()?
        };

        let mut candidates = Vec::new();
        for entry in entries {
            if criteria.exclude.contains(&entry.node.id)
                || !entry.node.features.has(criteria.required_features)
                || criteria.in_cooldown(entry.last_attempt())
            {
                continue;
            }
            let best = entry
                .addresses
                .into_iter()
                .filter(|a| criteria.accepts(&a.kind))
                .min_by(by_address_rank);
            if let Some(address) = best {
                candidates.push(PeerCandidate {
                    node: entry.node,
                    address,
                });
            }
        }

        candidates.sort_by(|a, b| {
            by_rank(&a.node, a.address.last_success, &b.node, b.address.last_success)
        });
        if let Some(limit) = criteria.limit {
            candidates.truncate(limit);
        }
        debug!("Selected {} dial candidates", candidates.len());

        Ok(PeerCandidates(candidates))
    }

    fn remove_node(&self, id: &NodeId) -> Result<Removed> {
        let _guard = self.write();
        let removed = self.remove_nodes(&[(id.clone(), None)])?;
        if removed.nodes == 0 {
            return Err(StoreError::NotFound(format!("node {id}")));
        }
        Ok(removed)
    }

    fn prune(&self, policy: &PrunePolicy, now: Timestamp) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        if policy.is_disabled() {
            debug!("Retention disabled, nothing to prune");
            return Ok(report);
        }
        let batch_size = policy.batch_size.max(1);

        if let ClaimPolicy::KeepMostRecentSuccess { grace } = policy.claims {
            self.prune_claims(grace, now, batch_size, &mut report)?;
        }

        if policy.max_age.is_some() || policy.max_nodes.is_some() {
            let victims = {
                let _guard = self.read();
                eviction_order(self.node_entries()?, policy, now)
            };
            // One gate acquisition per batch, so ingress and dialing interleave.
            for batch in victims.chunks(batch_size) {
                let _guard = self.write();
                let removed = self.remove_nodes(batch)?;
                report.nodes += removed.nodes;
                report.addresses += removed.addresses;
                report.announcements += removed.announcements;
                report.metadata += removed.metadata;
                report.batches += 1;
            }
        }

        if policy.max_age.is_some() {
            self.prune_stale_addresses(policy, now, &mut report)?;
        }

        if !report.is_empty() {
            info!(
                "Pruned {} nodes ({} addresses, {} announcements) and {} superseded claims \
                 in {} batches",
                report.nodes, report.addresses, report.announcements, report.claims, report.batches
            );
        }
        Ok(report)
    }
}
