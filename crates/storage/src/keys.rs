//! Composite keys for the sled trees.
//!
//! Every variable-length component is written as a big-endian `u32` length
//! followed by its bytes, so a node's prefix never matches another node whose
//! id merely starts with the same characters. Timestamps are written
//! big-endian so byte order equals numeric order.

use peerbook_types::{AddressType, NodeId, RepoId, Timestamp};

const LEN_BYTES: usize = 4;
const TIME_BYTES: usize = 8;

fn push_segment(buf: &mut Vec<u8>, segment: &[u8]) {
    buf.extend_from_slice(&(segment.len() as u32).to_be_bytes());
    buf.extend_from_slice(segment);
}

/// Split the leading segment off `bytes`.
fn split_segment(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    if bytes.len() < LEN_BYTES {
        return None;
    }
    let (len, rest) = bytes.split_at(LEN_BYTES);
    let len = u32::from_be_bytes(len.try_into().ok()?) as usize;
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

fn split_time(bytes: &[u8]) -> Option<(Timestamp, &[u8])> {
    if bytes.len() < TIME_BYTES {
        return None;
    }
    let (time, rest) = bytes.split_at(TIME_BYTES);
    Some((u64::from_be_bytes(time.try_into().ok()?), rest))
}

/// Key of a node row, also the prefix of all its dependent rows.
pub fn node(id: &NodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(LEN_BYTES + id.as_bytes().len());
    push_segment(&mut key, id.as_bytes());
    key
}

pub fn address(id: &NodeId, kind: &AddressType, value: &str) -> Vec<u8> {
    let mut key = node(id);
    push_segment(&mut key, kind.as_str().as_bytes());
    push_segment(&mut key, value.as_bytes());
    key
}

pub fn announcement(id: &NodeId, rid: &RepoId) -> Vec<u8> {
    let mut key = node(id);
    push_segment(&mut key, rid.as_bytes());
    key
}

/// Pending-index key: ordered by creation time, then by announcement key.
pub fn pending(created_at: Timestamp, announcement_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(TIME_BYTES + announcement_key.len());
    key.extend_from_slice(&created_at.to_be_bytes());
    key.extend_from_slice(announcement_key);
    key
}

/// Split a pending-index key into creation time and announcement key.
pub fn split_pending(key: &[u8]) -> Option<(Timestamp, &[u8])> {
    split_time(key)
}

pub fn metadata(id: &NodeId, time: Timestamp) -> Vec<u8> {
    let mut key = node(id);
    key.extend_from_slice(&time.to_be_bytes());
    key
}

/// Decode a metadata key back into its node and time.
pub fn split_metadata(key: &[u8]) -> Option<(NodeId, Timestamp)> {
    let (id, rest) = split_segment(key)?;
    let (time, rest) = split_time(rest)?;
    if !rest.is_empty() {
        return None;
    }
    let id = std::str::from_utf8(id).ok()?;
    Some((NodeId::from(id), time))
}
