//! Integration tests for the peer store.
//! Covers last-writer-wins node records, key rotation, cascading deletes,
//! rebroadcast ordering and the broadcast race.

use std::str::FromStr;

use peerbook_storage::{
    AddressBook, AnnouncementTracker, Database, MetadataLog, PeerCriteria, StoreError,
    UpsertResult,
};
use peerbook_types::{
    AddressType, Alias, KnownAddress, NodeId, NodeRecord, RepoId, Source, Timestamp,
};

/// Helper to create a test node record
fn create_test_node(id: &str, timestamp: Timestamp) -> NodeRecord {
    NodeRecord::new(NodeId::from(id), Alias::from_str("tester").unwrap(), timestamp)
}

/// Helper to create an announced IPv4 address
fn create_test_address(value: &str, timestamp: Timestamp) -> KnownAddress {
    KnownAddress::new(AddressType::Ipv4, value, Source::Peer, timestamp)
}

#[test]
fn test_upsert_node_idempotent_and_monotonic() {
    let db = Database::temporary().unwrap();
    let record = create_test_node("A", 100).with_pow(4);

    assert_eq!(db.upsert_node(record.clone()).unwrap(), UpsertResult::Inserted);
    assert_eq!(db.upsert_node(record.clone()).unwrap(), UpsertResult::Unchanged);
    assert_eq!(db.get_node(&record.id).unwrap(), Some(record.clone()));

    let older = create_test_node("A", 99).with_pow(1_000);
    assert!(matches!(
        db.upsert_node(older),
        Err(StoreError::StaleAnnouncement { .. })
    ));
    assert_eq!(db.get_node(&record.id).unwrap(), Some(record));
}

#[test]
fn test_key_rotation_claims_coexist() {
    let db = Database::temporary().unwrap();
    let (a, b) = (NodeId::from("A"), NodeId::from("B"));
    db.upsert_node(create_test_node("A", 1)).unwrap();
    db.upsert_node(create_test_node("B", 2)).unwrap();

    db.upsert_address(&a, create_test_address("1.2.3.4", 1))
        .unwrap();
    db.upsert_address(&b, create_test_address("1.2.3.4", 2))
        .unwrap();

    let claimants = db.claimants(&AddressType::Ipv4, "1.2.3.4").unwrap();
    let mut nodes: Vec<_> = claimants.iter().map(|r| r.node.clone()).collect();
    nodes.sort();
    assert_eq!(nodes, vec![a.clone(), b.clone()]);
    assert_eq!(db.addresses_of(&a).unwrap().len(), 1);
    assert_eq!(db.addresses_of(&b).unwrap().len(), 1);
}

#[test]
fn test_remove_node_cascades_to_own_rows_only() {
    let db = Database::temporary().unwrap();
    let rid = RepoId::from("repo1");
    for id in ["n", "m"] {
        let node = NodeId::from(id);
        db.upsert_node_with_addresses(
            create_test_node(id, 10),
            &[
                create_test_address("10.0.0.1", 10),
                create_test_address("10.0.0.2", 10),
            ],
        )
        .unwrap();
        db.record_announcement(&node, &rid, 10).unwrap();
        db.record_announcement(&node, &RepoId::from("repo2"), 11)
            .unwrap();
        db.record_refresh(&node, 10).unwrap();
    }

    let n = NodeId::from("n");
    let m = NodeId::from("m");
    let removed = db.remove_node(&n).unwrap();
    assert_eq!(removed.nodes, 1);
    assert_eq!(removed.addresses, 2);
    assert_eq!(removed.announcements, 2);

    assert!(db.get_node(&n).unwrap().is_none());
    assert!(db.addresses_of(&n).unwrap().is_empty());
    assert!(db.announcements_of(&n).unwrap().is_empty());
    assert!(db.history(&n).unwrap().is_empty());

    assert_eq!(db.addresses_of(&m).unwrap().len(), 2);
    assert_eq!(db.announcements_of(&m).unwrap().len(), 2);
    let pending = db.pending_rebroadcast(10, 100).unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|r| r.node == m));
}

#[test]
fn test_pending_rebroadcast_is_fifo() {
    let db = Database::temporary().unwrap();
    for id in ["x", "y", "z"] {
        db.upsert_node(create_test_node(id, 1)).unwrap();
    }
    db.record_announcement(&NodeId::from("x"), &RepoId::from("r1"), 10)
        .unwrap();
    db.record_announcement(&NodeId::from("y"), &RepoId::from("r2"), 30)
        .unwrap();
    db.record_announcement(&NodeId::from("z"), &RepoId::from("r3"), 20)
        .unwrap();

    let pending = db.pending_rebroadcast(2, 1_000).unwrap();
    let got: Vec<_> = pending
        .iter()
        .map(|r| (r.node.as_str(), r.rid.as_str(), r.created_at))
        .collect();
    assert_eq!(got, vec![("x", "r1", 10), ("z", "r3", 20)]);
}

#[test]
fn test_reannouncement_invalidates_pending_mark() {
    let db = Database::temporary().unwrap();
    let (n, r) = (NodeId::from("n"), RepoId::from("r"));
    db.upsert_node(create_test_node("n", 1)).unwrap();

    db.record_announcement(&n, &r, 100).unwrap();
    assert!(db.record_announcement(&n, &r, 200).unwrap());

    let err = db.mark_broadcasted(&n, &r, 100).unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    let stored = db.get_announcement(&n, &r).unwrap().unwrap();
    assert_eq!(stored.created_at, 200);
    assert_eq!(stored.broadcasted_at, None);
    assert_eq!(db.pending_rebroadcast(10, 1_000).unwrap(), vec![stored]);
}

#[test]
fn test_unknown_node_creates_no_rows() {
    let db = Database::temporary().unwrap();
    let ghost = NodeId::from("ghost");

    let err = db
        .upsert_address(&ghost, create_test_address("1.2.3.4", 1))
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownNode(_)));
    assert!(!err.is_storage_failure());

    assert!(db.addresses_of(&ghost).unwrap().is_empty());
    assert!(db.claimants(&AddressType::Ipv4, "1.2.3.4").unwrap().is_empty());
    assert!(db.is_empty());
}

#[test]
fn test_end_to_end_announce_and_rebroadcast() {
    let db = Database::temporary().unwrap();
    let a = NodeId::from("A");
    let repo = RepoId::from("repo1");
    let now = 1_000;

    db.upsert_node(create_test_node("A", 100)).unwrap();
    db.upsert_address(
        &a,
        KnownAddress::new(AddressType::from("ip4"), "1.2.3.4", Source::Peer, 100),
    )
    .unwrap();
    assert!(db.record_announcement(&a, &repo, 100).unwrap());

    let pending = db.pending_rebroadcast(10, now).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!((&pending[0].node, &pending[0].rid), (&a, &repo));

    db.mark_broadcasted(&a, &repo, 101).unwrap();
    assert!(db.pending_rebroadcast(10, now).unwrap().is_empty());

    let candidates = db.select_peers(&PeerCriteria::new(now)).unwrap();
    assert_eq!(candidates.len(), 1);
    let best = candidates.iter().next().unwrap();
    assert_eq!(best.node.id, a);
    assert_eq!(best.address.value, "1.2.3.4");
}

#[test]
fn test_reserved_tag_spelled_as_other_is_one_claim() {
    let db = Database::temporary().unwrap();
    let a = NodeId::from("A");
    db.upsert_node(create_test_node("A", 1)).unwrap();

    db.upsert_address(&a, create_test_address("1.2.3.4", 1))
        .unwrap();
    let spelled = KnownAddress::new(
        AddressType::Other("ip4".to_string()),
        "1.2.3.4",
        Source::Peer,
        2,
    );
    assert_eq!(db.upsert_address(&a, spelled).unwrap(), UpsertResult::Updated);

    let addresses = db.addresses_of(&a).unwrap();
    assert_eq!(addresses.len(), 1);
    assert!(matches!(addresses[0].kind, AddressType::Ipv4));
    assert_eq!(addresses[0].timestamp, 2);
    assert_eq!(db.claimants(&AddressType::Ipv4, "1.2.3.4").unwrap().len(), 1);
}
