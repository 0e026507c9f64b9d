//! Peerbook store
//!
//! Persistent address book and ref-announcement rebroadcast tracker for a
//! gossip node. All state lives in one sled database; the components below
//! are traits implemented by [`Database`], so a single explicitly owned
//! handle is shared by protocol ingress, the dialer and the gossip scheduler.
//!
//! ## Modules
//! - `database`: trees, transactions and cascading node deletion
//! - `address_book`: node records, address claims, dial candidate selection
//! - `announcements`: pending rebroadcast tracking
//! - `metadata`: append-only metadata refresh history
//! - `retention`: pruning policies
//! - `config`: store configuration

pub mod address_book;
pub mod announcements;
pub mod config;
pub mod database;
pub mod error;
mod keys;
pub mod metadata;
pub mod retention;

pub use address_book::{AddressBook, PeerCandidate, PeerCandidates, PeerCriteria, UpsertResult};
pub use announcements::AnnouncementTracker;
pub use config::{StoreConfig, DEFAULT_COOLDOWN};
pub use database::{Database, Removed};
pub use error::{Result, StoreError};
pub use metadata::MetadataLog;
pub use retention::{ClaimPolicy, PrunePolicy, PruneReport};
