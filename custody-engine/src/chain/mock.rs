use super::{ChainTransport, PaymentQuery, TxId};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ledger_core::Amount;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// In-process transport for tests and offline tooling
#[derive(Debug)]
pub struct MockChainTransport {
    address: String,
    latency: Mutex<Duration>,
    incoming: Mutex<Vec<IncomingPayment>>,
    sent: Mutex<Vec<SentPayment>>,
    fee_forwards: Mutex<Vec<Amount>>,
    fail_sends: AtomicBool,
    fail_fee_forwards: AtomicBool,
    fail_scans: AtomicBool,
}

/// Payment observed arriving at the deposit address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPayment {
    /// Receiving address
    pub address: String,
    /// Amount received
    pub amount: Amount,
    /// Attached memo
    pub memo: String,
    /// Arrival time
    pub received_at: DateTime<Utc>,
}

/// Outbound payment made through the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPayment {
    /// Destination address
    pub destination: String,
    /// Amount sent
    pub amount: Amount,
    /// Transaction id handed back
    pub tx_id: TxId,
}

impl MockChainTransport {
    /// Mock with a fixed deposit address and no latency
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            latency: Mutex::new(Duration::ZERO),
            incoming: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            fee_forwards: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            fail_fee_forwards: AtomicBool::new(false),
            fail_scans: AtomicBool::new(false),
        }
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Record a payment arriving now
    pub fn add_incoming_payment(&self, amount: Amount, memo: impl Into<String>) {
        self.add_incoming_payment_at(amount, memo, Utc::now());
    }

    /// Record a payment that arrived at `received_at`
    pub fn add_incoming_payment_at(
        &self,
        amount: Amount,
        memo: impl Into<String>,
        received_at: DateTime<Utc>,
    ) {
        self.incoming.lock().push(IncomingPayment {
            address: self.address.clone(),
            amount,
            memo: memo.into(),
            received_at,
        });
    }

    /// Make outbound sends fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make fee forwarding fail
    pub fn fail_fee_forwards(&self, fail: bool) {
        self.fail_fee_forwards.store(fail, Ordering::SeqCst);
    }

    /// Make deposit scans fail
    pub fn fail_scans(&self, fail: bool) {
        self.fail_scans.store(fail, Ordering::SeqCst);
    }

    /// Payments sent so far
    pub fn sent_payments(&self) -> Vec<SentPayment> {
        self.sent.lock().clone()
    }

    /// Fee amounts forwarded so far
    pub fn fee_forwards(&self) -> Vec<Amount> {
        self.fee_forwards.lock().clone()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn mock_tx_id() -> TxId {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        format!("MOCK-{}", suffix)
    }
}

#[async_trait]
impl ChainTransport for MockChainTransport {
    async fn deposit_address(&self) -> Result<String> {
        self.simulate_latency().await;
        Ok(self.address.clone())
    }

    async fn find_incoming_payment(&self, query: &PaymentQuery) -> Result<bool> {
        self.simulate_latency().await;

        if self.fail_scans.load(Ordering::SeqCst) {
            warn!("Mock chain: Simulated scan failure");
            return Err(Error::ExternalTransportFailure(
                "simulated scan failure".to_string(),
            ));
        }

        let since = Utc::now() - ChronoDuration::minutes(i64::from(query.lookback_minutes));
        let found = self.incoming.lock().iter().any(|payment| {
            payment.address == query.address
                && payment.amount == query.amount
                && payment.memo == query.memo
                && payment.received_at >= since
        });

        Ok(found)
    }

    async fn send_payment(&self, destination: &str, amount: Amount) -> Result<TxId> {
        self.simulate_latency().await;

        if self.fail_sends.load(Ordering::SeqCst) {
            warn!(destination, %amount, "Mock chain: Simulated send failure");
            return Err(Error::ExternalTransportFailure(
                "simulated send failure".to_string(),
            ));
        }

        let tx_id = Self::mock_tx_id();
        info!(destination, %amount, tx_id = %tx_id, "Mock chain: Payment sent");

        self.sent.lock().push(SentPayment {
            destination: destination.to_string(),
            amount,
            tx_id: tx_id.clone(),
        });

        Ok(tx_id)
    }

    async fn forward_platform_fee(&self, amount: Amount) -> Result<TxId> {
        self.simulate_latency().await;

        if self.fail_fee_forwards.load(Ordering::SeqCst) {
            warn!(%amount, "Mock chain: Simulated fee forward failure");
            return Err(Error::ExternalTransportFailure(
                "simulated fee forward failure".to_string(),
            ));
        }

        self.fee_forwards.lock().push(amount);
        Ok(Self::mock_tx_id())
    }

    async fn derive_address(&self, public_key: &str) -> Result<String> {
        if public_key.is_empty() {
            return Err(Error::InvalidInput("empty public key".to_string()));
        }
        Ok(format!("mock:{}", public_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(amount: Amount, memo: &str) -> PaymentQuery {
        PaymentQuery {
            address: "EQdeposit".to_string(),
            amount,
            memo: memo.to_string(),
            lookback_minutes: 30,
        }
    }

    #[tokio::test]
    async fn test_matches_exact_amount_and_memo() {
        let chain = MockChainTransport::new("EQdeposit");
        chain.add_incoming_payment(Amount::from_units(5), "DEP1-1-abcdef");

        assert!(chain
            .find_incoming_payment(&query(Amount::from_units(5), "DEP1-1-abcdef"))
            .await
            .unwrap());
        assert!(!chain
            .find_incoming_payment(&query(Amount::from_nanos(4_999_999_999), "DEP1-1-abcdef"))
            .await
            .unwrap());
        assert!(!chain
            .find_incoming_payment(&query(Amount::from_units(5), "DEP1-2-abcdef"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_lookback_window() {
        let chain = MockChainTransport::new("EQdeposit");
        chain.add_incoming_payment_at(
            Amount::from_units(5),
            "old",
            Utc::now() - ChronoDuration::minutes(45),
        );

        assert!(!chain
            .find_incoming_payment(&query(Amount::from_units(5), "old"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_send_records_and_fails_on_demand() {
        let chain = MockChainTransport::new("EQdeposit");

        let tx = chain
            .send_payment("mock:aa", Amount::from_units(1))
            .await
            .unwrap();
        assert!(tx.starts_with("MOCK-"));
        assert_eq!(chain.sent_payments().len(), 1);

        chain.fail_sends(true);
        assert!(chain.send_payment("mock:aa", Amount::from_units(1)).await.is_err());
        assert_eq!(chain.sent_payments().len(), 1);
    }
}
