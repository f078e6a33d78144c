//! Chain transport boundary
//!
//! The engine never talks to a blockchain directly. Everything it needs from
//! the wallet side goes through [`ChainTransport`], constructed once at startup
//! and shared as `Arc<dyn ChainTransport>`.

pub mod mock;

use crate::{Error, Result};
use async_trait::async_trait;
use ledger_core::Amount;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// External transaction identifier
pub type TxId = String;

/// What a deposit confirmation looks for on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentQuery {
    /// Deposit address scanned
    pub address: String,

    /// Exact amount expected
    pub amount: Amount,

    /// Memo the payer attached
    pub memo: String,

    /// How far back to look
    pub lookback_minutes: u32,
}

/// Wallet / network collaborator
#[async_trait]
pub trait ChainTransport: Send + Sync {
    /// Address users send deposits to
    async fn deposit_address(&self) -> Result<String>;

    /// Whether a payment matching `query` arrived within the lookback window
    async fn find_incoming_payment(&self, query: &PaymentQuery) -> Result<bool>;

    /// Send `amount` to `destination`
    async fn send_payment(&self, destination: &str, amount: Amount) -> Result<TxId>;

    /// Forward the platform's share of a deposit to the fee wallet
    async fn forward_platform_fee(&self, amount: Amount) -> Result<TxId>;

    /// Wallet address owned by a public key
    async fn derive_address(&self, public_key: &str) -> Result<String>;
}

/// Run a transport call under a deadline
///
/// Timeouts and transport errors both surface as
/// [`Error::ExternalTransportFailure`].
pub(crate) async fn bounded<T, F>(timeout: Duration, call: &'static str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(Error::ExternalTransportFailure(msg))) => {
            Err(Error::ExternalTransportFailure(format!("{}: {}", call, msg)))
        }
        Ok(Err(other)) => Err(Error::ExternalTransportFailure(format!("{}: {}", call, other))),
        Err(_) => Err(Error::ExternalTransportFailure(format!(
            "{} timed out after {:?}",
            call, timeout
        ))),
    }
}
