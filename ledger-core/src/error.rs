//! Error types for the ledger store

use crate::types::Amount;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Row serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Operation metadata encoding error
    #[error("Metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Entity not found
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (user, investment, deposit, ...)
        entity: &'static str,
        /// Lookup key
        id: String,
    },

    /// Unique key already taken
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Debit would leave the available balance negative
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Amount the mutation needed
        required: Amount,
        /// Amount that was available
        available: Amount,
    },

    /// Malformed input (amount, page, key)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Proposed referrer would close a cycle in the referral forest
    #[error("Referral cycle: user {user_id} cannot be referred by {referrer_id}")]
    ReferralCycle {
        /// User being created
        user_id: u64,
        /// Proposed referrer
        referrer_id: u64,
    },

    /// Concurrent mutation invalidated a precondition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for [`Error::NotFound`]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
