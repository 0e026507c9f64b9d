use peerbook_types::{NodeId, Timestamp};
use sled::transaction::{ConflictableTransactionError, TransactionError};

/// Store errors
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The referenced node has no record in the address book.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    /// A newer announcement of the node is already stored.
    #[error("stale announcement from {node}: stored at {stored}, received {received}")]
    StaleAnnouncement {
        node: NodeId,
        stored: Timestamp,
        received: Timestamp,
    },
    /// The targeted row is absent or was superseded before the update.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupted key in tree `{0}`")]
    Corrupted(&'static str),
}

impl StoreError {
    /// Whether the error comes from the underlying persistence rather than
    /// from the caller's request.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            StoreError::Database(_) | StoreError::Serialization(_) | StoreError::Corrupted(_)
        )
    }
}

impl From<TransactionError<StoreError>> for StoreError {
    fn from(err: TransactionError<StoreError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StoreError::Database(e),
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Result type of closures run inside a store transaction.
pub(crate) type TxResult<T> = std::result::Result<T, ConflictableTransactionError<StoreError>>;

/// Abort the running transaction with a store error.
pub(crate) fn abort<T>(err: StoreError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}
