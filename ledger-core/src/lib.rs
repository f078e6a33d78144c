//! Custody Ledger Core
//!
//! Durable ledger store for a custodial investment platform: users and their
//! balances, investment positions, deposit and withdrawal records, referral
//! earnings and the append-only operation log.
//!
//! # Architecture
//!
//! - **RocksDB**: one column family per entity, secondary indices in `indices`
//! - **Units of work**: every compound mutation lands as one `WriteBatch`
//! - **Per-user locks**: writers touching the same user serialize, others don't
//!
//! # Invariants
//!
//! - `balance >= reserved >= 0` after every committed unit
//! - Money is fixed-point: no floats anywhere in the ledger
//! - Operations and referral earnings are never modified or deleted
//! - The referral graph is a forest: cycles are rejected at user creation

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod graph;
pub mod operation_log;
pub mod storage;
pub mod types;
pub mod unit;

// Re-exports
pub use config::{Config, RocksDBConfig};
pub use error::{Error, Result};
pub use operation_log::MAX_PAGE_SIZE;
pub use storage::{Sequence, Store};
pub use types::{
    Amount, DepositId, DepositRequest, DepositStatus, Downline, EarningId, Investment,
    InvestmentId, NewOperation, NewUser, Operation, OperationId, OperationPage, OperationType,
    ReferralEarning, User, UserId, WithdrawalId, WithdrawalRequest, WithdrawalStatus,
};
pub use unit::Unit;
