//! Custody Engine
//!
//! Business services of a custodial investment platform built on
//! [`ledger_core`]:
//!
//! - **Investments**: open, close and settle weekly yield on typed positions
//! - **Referrals**: share realized profit with up to three referrers
//! - **Deposits**: memo-tagged intents reconciled against the chain
//! - **Withdrawals**: reserve, transfer and settle against the deposit allowance
//!
//! # Example
//!
//! ```no_run
//! use custody_engine::{chain::mock::MockChainTransport, CustodyEngine, EngineConfig};
//! use ledger_core::{Amount, NewUser};
//! use std::sync::Arc;
//!
//! fn main() -> custody_engine::Result<()> {
//!     let chain = Arc::new(MockChainTransport::new("platform-wallet"));
//!     let engine = CustodyEngine::open(EngineConfig::default(), chain)?;
//!
//!     let user = engine.create_user(NewUser {
//!         pub_key: "alice".to_string(),
//!         ..Default::default()
//!     })?;
//!     engine.set_balance(user.id, Amount::from_units(100))?;
//!
//!     let opened = engine.investments().open(user.id, "low", Amount::from_units(50))?;
//!     println!("Opened investment {}", opened.investment.id);
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod chain;
pub mod config;
pub mod deposit;
pub mod engine;
pub mod error;
pub mod investment;
pub mod metrics;
pub mod referral;
pub mod withdrawal;

// Re-exports
pub use chain::{ChainTransport, PaymentQuery, TxId};
pub use config::{
    DepositConfig, EngineConfig, FeePolicy, InvestmentTypeConfig, ReferralConfig,
    TransportConfig, WithdrawalConfig, MAX_LOCK_PERIOD_DAYS,
};
pub use deposit::{ConfirmOutcome, DepositIntent, DepositService};
pub use engine::CustodyEngine;
pub use error::{Error, ErrorKind, Result};
pub use investment::{ClosedInvestment, InvestmentService, OpenedInvestment, YieldSettlement};
pub use metrics::Metrics;
pub use referral::{LevelSummary, ReferralDetail, ReferralEngine, ReferralStats};
pub use withdrawal::{Resolution, WithdrawalReceipt, WithdrawalService};
