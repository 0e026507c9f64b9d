use std::time::Duration;

use peerbook_types::Timestamp;

/// How superseded key-rotation claims on one address are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClaimPolicy {
    /// Keep every node's claim until the node itself is pruned.
    #[default]
    KeepAll,
    /// Keep the claimant that most recently dialed successfully (ties go to
    /// the freshest announcement) and drop other claims on the same address
    /// once they are older than `grace`.
    KeepMostRecentSuccess { grace: Duration },
}

/// Retention policy for the address book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrunePolicy {
    /// Nodes not heard from, nor successfully dialed, within this window are
    /// evicted. `None` disables age based retention.
    pub max_age: Option<Duration>,
    /// Upper bound on stored nodes. `None` disables capacity based retention.
    pub max_nodes: Option<usize>,
    /// Nodes removed per transaction.
    pub batch_size: usize,
    pub claims: ClaimPolicy,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            max_age: None,
            max_nodes: None,
            batch_size: 256,
            claims: ClaimPolicy::KeepAll,
        }
    }
}

impl PrunePolicy {
    /// Whether data last refreshed at `timestamp` falls outside the age window.
    pub fn is_expired(&self, timestamp: Timestamp, now: Timestamp) -> bool {
        self.max_age
            .map(|age| timestamp.saturating_add(millis(age)) < now)
            .unwrap_or(false)
    }

    /// Check if the policy is entirely disabled, in which case pruning is a
    /// no-op.
    pub fn is_disabled(&self) -> bool {
        self.max_age.is_none() && self.max_nodes.is_none() && self.claims == ClaimPolicy::KeepAll
    }
}

/// Outcome of a pruning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub nodes: usize,
    pub addresses: usize,
    pub announcements: usize,
    pub metadata: usize,
    /// Superseded address claims removed under [`ClaimPolicy`].
    pub claims: usize,
    /// Number of write transactions the pass was split into.
    pub batches: usize,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.nodes == 0 && self.addresses == 0 && self.claims == 0
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
