//! Error types for the Ferry engine.

use crate::{events::EventType, RecordId, StoreName};
use thiserror::Error;

/// All possible errors from the Ferry engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("store not found: {0}")]
    StoreNotFound(StoreName),

    #[error("record already exists in {store}: {id}")]
    DuplicateKey { store: StoreName, id: RecordId },

    // Transaction misuse
    #[error("not in a transaction")]
    NotInTransaction,

    #[error("nested transactions are not supported")]
    NestedTransaction,

    #[error("transaction already committed or rolled back")]
    TransactionClosed,

    // Validation errors
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("unknown field '{field}' for store {store}")]
    UnknownField { store: StoreName, field: String },

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("operator '{0}' is not supported by the remote filter dialect")]
    UnsupportedOperator(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("model not registered for replication: {0}")]
    ModelNotRegistered(StoreName),

    // Remote errors
    #[error("network error: {0}")]
    Network(String),

    #[error("application error: {0}")]
    Application(String),

    #[error("local conflict on {id}: record changed since version {attempted:?}")]
    Conflict {
        id: RecordId,
        attempted: Option<serde_json::Value>,
        current: Option<serde_json::Value>,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{0:?} events cannot be replicated")]
    UnreplicableEvent(EventType),

    #[error("mutation queue closed before the request completed")]
    QueueClosed,
}

impl Error {
    /// Transport-level failure that should be retried once back online.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Local conflict detected before sending.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
