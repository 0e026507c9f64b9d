//! Per-(node, repository) ref announcements and their rebroadcast state.

use peerbook_types::{AnnouncementRecord, NodeId, RepoId, Timestamp};
use tracing::{debug, warn};

use crate::database::{get, get_tx, put_tx, scan, Database};
use crate::error::{abort, Result, StoreError};
use crate::keys;

/// Announcement tracking operations.
pub trait AnnouncementTracker {
    /// Record that `node` announced refs of `rid` at `created_at`.
    ///
    /// Only a strictly newer announcement replaces the stored one, which then
    /// becomes pending again. Returns whether anything changed.
    fn record_announcement(&self, node: &NodeId, rid: &RepoId, created_at: Timestamp)
        -> Result<bool>;
    /// Unbroadcast announcements created at or before `now`, oldest first.
    fn pending_rebroadcast(&self, limit: usize, now: Timestamp) -> Result<Vec<AnnouncementRecord>>;
    /// Mark the announcement relayed, given the `created_at` of the version the
    /// caller pushed. That time is also recorded as `broadcasted_at`.
    ///
    /// Fails with `NotFound` if there is no announcement, or if the stored one
    /// was created after `created_at`: a re-announcement replaced what was
    /// pushed and must stay pending. Pass the creation time that was read from
    /// [`AnnouncementTracker::pending_rebroadcast`], never the local clock.
    fn mark_broadcasted(&self, node: &NodeId, rid: &RepoId, created_at: Timestamp) -> Result<()>;
    /// Mark the pushed `record` relayed at the local time `relayed_at`.
    ///
    /// Only succeeds if the stored announcement is exactly the one in
    /// `record`, so the relay time never lands on a replacement.
    fn mark_broadcasted_exact(
        &self,
        record: &AnnouncementRecord,
        relayed_at: Timestamp,
    ) -> Result<()>;
    fn get_announcement(&self, node: &NodeId, rid: &RepoId) -> Result<Option<AnnouncementRecord>>;
    fn announcements_of(&self, node: &NodeId) -> Result<Vec<AnnouncementRecord>>;
}

impl Database {
    fn mark<F>(&self, node: &NodeId, rid: &RepoId, time: Timestamp, superseded: F) -> Result<()>
    where
        F: Fn(&AnnouncementRecord) -> bool,
    {
        let key = keys::announcement(node, rid);
        let _guard = self.write();
        let result = self.transact(|tx| {
            let Some(mut record) = get_tx::<AnnouncementRecord>(tx.announcements, &key)? else {
                return abort(StoreError::NotFound(format!("announcement of {rid} by {node}")));
            };
            if superseded(&record) {
                return abort(StoreError::NotFound(format!(
                    "announcement of {rid} by {node} superseded at {}",
                    record.created_at
                )));
            }
            if record.is_pending() {
                tx.pending.remove(keys::pending(record.created_at, &key))?;
            }
            record.broadcasted_at = Some(record.broadcasted_at.map_or(time, |t| t.max(time)));
            put_tx(tx.announcements, &key, &record)
        });

        if let Err(StoreError::NotFound(reason)) = &result {
            warn!("Unable to mark broadcast: {reason}");
        }
        result
    }
}

impl AnnouncementTracker for Database {
    fn record_announcement(
        &self,
        node: &NodeId,
        rid: &RepoId,
        created_at: Timestamp,
    ) -> Result<bool> {
        let key = keys::announcement(node, rid);
        let _guard = self.write();
        let updated = self.transact(|tx| {
            tx.require_node(node)?;
            if let Some(stored) = get_tx::<AnnouncementRecord>(tx.announcements, &key)? {
                if stored.created_at >= created_at {
                    return Ok(false);
                }
                if stored.is_pending() {
                    tx.pending.remove(keys::pending(stored.created_at, &key))?;
                }
            }
            let record = AnnouncementRecord::new(node.clone(), rid.clone(), created_at);
            put_tx(tx.announcements, &key, &record)?;
            tx.pending
                .insert(keys::pending(created_at, &key), Vec::<u8>::new())?;
            Ok(true)
        })?;

        if updated {
            debug!("Refs announcement of {rid} by {node} at {created_at} pending rebroadcast");
        }
        Ok(updated)
    }

    fn pending_rebroadcast(&self, limit: usize, now: Timestamp) -> Result<Vec<AnnouncementRecord>> {
        let _guard = self.read();
        let mut pending = Vec::new();

        for item in self.pending.iter() {
            if pending.len() >= limit {
                break;
            }
            let (key, _) = item?;
            let (created_at, announcement) =
                keys::split_pending(&key).ok_or(StoreError::Corrupted("pending"))?;
            if created_at > now {
                break;
            }
            match get::<AnnouncementRecord>(&self.announcements, announcement)? {
                Some(record) if record.is_pending() && record.created_at == created_at => {
                    pending.push(record)
                }
                _ => warn!("Dangling pending announcement index entry at {created_at}"),
            }
        }
        Ok(pending)
    }

    fn mark_broadcasted(&self, node: &NodeId, rid: &RepoId, created_at: Timestamp) -> Result<()> {
        self.mark(node, rid, created_at, |stored| stored.created_at > created_at)
    }

    fn mark_broadcasted_exact(
        &self,
        record: &AnnouncementRecord,
        relayed_at: Timestamp,
    ) -> Result<()> {
        self.mark(&record.node, &record.rid, relayed_at, |stored| {
            stored.created_at != record.created_at
        })
    }

    fn get_announcement(&self, node: &NodeId, rid: &RepoId) -> Result<Option<AnnouncementRecord>> {
        get(&self.announcements, &keys::announcement(node, rid))
    }

    fn announcements_of(&self, node: &NodeId) -> Result<Vec<AnnouncementRecord>> {
        let _guard = self.read();
        scan(&self.announcements, &keys::node(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_book::AddressBook;
    use peerbook_types::{Alias, NodeRecord};
    use std::str::FromStr;

    fn store_with(nodes: &[&str]) -> Database {
        let db = Database::temporary().unwrap();
        for id in nodes {
            db.upsert_node(NodeRecord::new(
                NodeId::from(*id),
                Alias::from_str(id).unwrap(),
                1,
            ))
            .unwrap();
        }
        db
    }

    #[test]
    fn unknown_node_is_rejected() {
        let db = store_with(&[]);
        let err = db
            .record_announcement(&NodeId::from("A"), &RepoId::from("r"), 1)
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownNode(_)));
        assert!(db.pending_rebroadcast(10, u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn only_newer_announcements_overwrite() {
        let db = store_with(&["A"]);
        let (a, r) = (NodeId::from("A"), RepoId::from("r"));

        assert!(db.record_announcement(&a, &r, 20).unwrap());
        assert!(!db.record_announcement(&a, &r, 20).unwrap());
        assert!(!db.record_announcement(&a, &r, 10).unwrap());
        assert_eq!(db.get_announcement(&a, &r).unwrap().unwrap().created_at, 20);

        db.mark_broadcasted(&a, &r, 25).unwrap();
        assert!(db.pending_rebroadcast(10, 100).unwrap().is_empty());

        assert!(db.record_announcement(&a, &r, 30).unwrap());
        let pending = db.pending_rebroadcast(10, 100).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].created_at, 30);
        assert_eq!(pending[0].broadcasted_at, None);
        assert_eq!(db.pending.len(), 1);
    }

    #[test]
    fn future_announcements_are_held_back() {
        let db = store_with(&["A"]);
        let a = NodeId::from("A");
        db.record_announcement(&a, &RepoId::from("now"), 50).unwrap();
        db.record_announcement(&a, &RepoId::from("later"), 500).unwrap();

        let pending = db.pending_rebroadcast(10, 100).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].rid, RepoId::from("now"));
        assert_eq!(db.pending_rebroadcast(10, 500).unwrap().len(), 2);
        assert!(db.pending_rebroadcast(0, 500).unwrap().is_empty());
    }

    #[test]
    fn marking_again_keeps_latest_time() {
        let db = store_with(&["A"]);
        let (a, r) = (NodeId::from("A"), RepoId::from("r"));
        db.record_announcement(&a, &r, 10).unwrap();

        db.mark_broadcasted(&a, &r, 40).unwrap();
        db.mark_broadcasted(&a, &r, 30).unwrap();
        assert_eq!(
            db.get_announcement(&a, &r).unwrap().unwrap().broadcasted_at,
            Some(40)
        );
    }

    #[test]
    fn exact_mark_detects_replacement() {
        let db = store_with(&["A"]);
        let (a, r) = (NodeId::from("A"), RepoId::from("r"));
        db.record_announcement(&a, &r, 10).unwrap();
        let pushed = db.pending_rebroadcast(1, 100).unwrap().remove(0);

        db.record_announcement(&a, &r, 11).unwrap();
        let err = db.mark_broadcasted_exact(&pushed, 99).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let current = db.get_announcement(&a, &r).unwrap().unwrap();
        db.mark_broadcasted_exact(&current, 99).unwrap();
        assert!(db.pending_rebroadcast(10, 100).unwrap().is_empty());
    }

    #[test]
    fn reannouncement_after_push_stays_pending() {
        let db = store_with(&["A"]);
        let (a, r) = (NodeId::from("A"), RepoId::from("r"));
        db.record_announcement(&a, &r, 100).unwrap();
        let pushed = db.pending_rebroadcast(10, 1_000).unwrap().remove(0);

        // Lands while the push is in flight, with a time before the relay.
        db.record_announcement(&a, &r, 900).unwrap();

        let err = db.mark_broadcasted_exact(&pushed, 1_000).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        let err = db.mark_broadcasted(&a, &r, pushed.created_at).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let pending = db.pending_rebroadcast(10, 1_000).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].created_at, 900);
        assert_eq!(pending[0].broadcasted_at, None);

        db.mark_broadcasted_exact(&pending[0], 1_000).unwrap();
        let stored = db.get_announcement(&a, &r).unwrap().unwrap();
        assert_eq!(stored.broadcasted_at, Some(1_000));
        assert!(db.pending_rebroadcast(10, 1_000).unwrap().is_empty());
    }

    #[test]
    fn mark_missing_is_not_found() {
        let db = store_with(&["A"]);
        let err = db
            .mark_broadcasted(&NodeId::from("A"), &RepoId::from("r"), 1)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
