//! Error types for the custody engine

use chrono::{DateTime, Utc};
use ledger_core::Amount;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unknown investment type
    #[error("Invalid investment type: {0}")]
    InvalidType(String),

    /// Amount below the investment type's minimum
    #[error("Amount {amount} below minimum {minimum} for {kind}")]
    BelowMinimum {
        /// Investment type
        kind: String,
        /// Requested amount
        amount: Amount,
        /// Configured minimum
        minimum: Amount,
    },

    /// Amount must be strictly positive
    #[error("Invalid amount: {0}")]
    InvalidAmount(Amount),

    /// Entity not found
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Lookup key
        id: String,
    },

    /// Record belongs to another user
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Not enough available balance or withdrawal allowance
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Amount requested
        required: Amount,
        /// Amount available
        available: Amount,
    },

    /// A deposit or withdrawal of the user is still in flight
    #[error("Pending operations exist: {0}")]
    PendingOperationsExist(String),

    /// Request is no longer pending
    #[error("Already processed: {0}")]
    AlreadyProcessed(String),

    /// Investment lock period has not elapsed
    #[error("Investment locked until {unlocks_at}")]
    InvestmentLocked {
        /// First instant the investment may be closed
        unlocks_at: DateTime<Utc>,
    },

    /// Chain transport unreachable or returned an error
    #[error("External transport failure: {0}")]
    ExternalTransportFailure(String),

    /// Concurrent mutation invalidated a precondition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(ledger_core::Error),
}

/// Failure category, for mapping to transport status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller sent something malformed
    InvalidInput,
    /// Entity missing
    NotFound,
    /// Ownership mismatch
    Forbidden,
    /// Not enough funds
    InsufficientFunds,
    /// In-flight deposit or withdrawal blocks the call
    PendingOperationsExist,
    /// Request already handled
    AlreadyProcessed,
    /// Investment still locked
    Locked,
    /// Chain transport failed
    ExternalTransportFailure,
    /// Concurrent mutation
    Conflict,
    /// Storage, configuration or other internal failure
    Internal,
}

impl Error {
    /// Failure category
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_)
            | Error::InvalidType(_)
            | Error::BelowMinimum { .. }
            | Error::InvalidAmount(_) => ErrorKind::InvalidInput,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Error::PendingOperationsExist(_) => ErrorKind::PendingOperationsExist,
            Error::AlreadyProcessed(_) => ErrorKind::AlreadyProcessed,
            Error::InvestmentLocked { .. } => ErrorKind::Locked,
            Error::ExternalTransportFailure(_) => ErrorKind::ExternalTransportFailure,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Config(_) | Error::Ledger(_) => ErrorKind::Internal,
        }
    }
}

impl From<ledger_core::Error> for Error {
    fn from(err: ledger_core::Error) -> Self {
        match err {
            ledger_core::Error::NotFound { entity, id } => Error::NotFound { entity, id },
            ledger_core::Error::InsufficientFunds {
                required,
                available,
            } => Error::InsufficientFunds {
                required,
                available,
            },
            ledger_core::Error::Conflict(msg) => Error::Conflict(msg),
            ledger_core::Error::InvalidInput(msg) => Error::InvalidInput(msg),
            other => Error::Ledger(other),
        }
    }
}
