//! Records shared by the peerbook address book and announcement tracker.

pub mod address;
pub mod announcement;
pub mod node;

pub use address::*;
pub use announcement::*;
pub use node::*;
