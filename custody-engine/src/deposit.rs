//! Deposit reconciliation
//!
//! A deposit starts as a pending intent carrying a unique memo. Confirmation
//! is caller-driven: the chain is scanned for a payment with that memo and
//! amount, the platform fee is forwarded, and the credit lands exactly once.

use crate::{
    chain::{bounded, ChainTransport, PaymentQuery},
    config::{EngineConfig, FeePolicy},
    metrics::Metrics,
    Error, Result,
};
use chrono::Utc;
use dashmap::DashMap;
use ledger_core::{
    Amount, DepositId, DepositRequest, DepositStatus, NewOperation, OperationType, Sequence,
    Store, UserId,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MEMO_SUFFIX_LEN: usize = 6;

/// A new deposit intent and where to pay it
#[derive(Debug, Clone, Serialize)]
pub struct DepositIntent {
    /// Pending request
    pub deposit: DepositRequest,
    /// Address the payer sends to, with `deposit.memo` attached
    pub address: String,
}

/// Outcome of a confirmation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmOutcome {
    /// Payment matched and the balance was credited
    Credited {
        /// Balance after the credit
        balance: Amount,
    },
    /// No matching payment observed yet; the request stays pending
    AwaitingPayment,
}

/// Removes a deposit from the in-flight set when dropped
struct InFlight<'a> {
    set: &'a DashMap<DepositId, ()>,
    deposit_id: DepositId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.deposit_id);
    }
}

/// Creates and confirms deposit requests
pub struct DepositService {
    store: Arc<Store>,
    chain: Arc<dyn ChainTransport>,
    config: Arc<EngineConfig>,
    metrics: Arc<Metrics>,
    in_flight: DashMap<DepositId, ()>,
}

impl std::fmt::Debug for DepositService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepositService")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl DepositService {
    /// Create new deposit service
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn ChainTransport>,
        config: Arc<EngineConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            chain,
            config,
            metrics,
            in_flight: DashMap::new(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.transport.timeout_secs)
    }

    async fn call<T, F>(&self, name: &'static str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = bounded(self.timeout(), name, future).await;
        self.metrics
            .record_external_call(started.elapsed().as_secs_f64());
        result
    }

    /// Exclusive hold on a deposit for one confirm or cancel
    fn claim(&self, deposit_id: DepositId) -> Result<InFlight<'_>> {
        if self.in_flight.insert(deposit_id, ()).is_some() {
            return Err(Error::Conflict(format!(
                "deposit {} is already being processed",
                deposit_id
            )));
        }
        Ok(InFlight {
            set: &self.in_flight,
            deposit_id,
        })
    }

    fn memo(user_id: UserId, deposit_id: DepositId) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(MEMO_SUFFIX_LEN)
            .map(char::from)
            .collect();
        format!("DEP{}-{}-{}", user_id, deposit_id, suffix)
    }

    /// Persist a pending deposit of `amount` and return where to pay it
    pub async fn create_intent(&self, user_id: UserId, amount: Amount) -> Result<DepositIntent> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount(amount));
        }
        self.store.get_user(user_id)?;

        let address = self
            .call("deposit_address", self.chain.deposit_address())
            .await?;

        let deposit = self.store.transact(user_id, |unit| {
            let now = Utc::now();
            let id = unit.next_id(Sequence::Deposit)?;
            let deposit = DepositRequest {
                id,
                user_id,
                amount,
                memo: Self::memo(user_id, id),
                status: DepositStatus::Pending,
                created_at: now,
                updated_at: now,
            };
            unit.put_deposit(&deposit)?;
            Ok::<_, Error>(deposit)
        })?;

        tracing::info!(
            user_id,
            deposit_id = deposit.id,
            amount = %amount,
            memo = %deposit.memo,
            "Deposit intent created"
        );

        Ok(DepositIntent { deposit, address })
    }

    fn pending_deposit(&self, user_id: UserId, deposit_id: DepositId) -> Result<DepositRequest> {
        let deposit = self.store.get_deposit(deposit_id)?;
        if deposit.user_id != user_id {
            return Err(Error::Forbidden(format!(
                "deposit {} does not belong to user {}",
                deposit_id, user_id
            )));
        }
        if deposit.status != DepositStatus::Pending {
            return Err(Error::AlreadyProcessed(format!(
                "deposit {} is {}",
                deposit_id,
                deposit.status.as_str()
            )));
        }
        Ok(deposit)
    }

    /// Match a pending deposit against the chain and credit it
    pub async fn confirm(&self, user_id: UserId, deposit_id: DepositId) -> Result<ConfirmOutcome> {
        self.pending_deposit(user_id, deposit_id)?;

        let _in_flight = self.claim(deposit_id)?;

        // A confirmation may have finished between the check and the insert
        let deposit = self.pending_deposit(user_id, deposit_id)?;

        let address = self
            .call("deposit_address", self.chain.deposit_address())
            .await?;
        let query = PaymentQuery {
            address,
            amount: deposit.amount,
            memo: deposit.memo.clone(),
            lookback_minutes: self.config.deposit.lookback_minutes,
        };
        let matched = self
            .call("find_incoming_payment", self.chain.find_incoming_payment(&query))
            .await?;

        if !matched {
            tracing::debug!(user_id, deposit_id, "No matching payment yet");
            return Ok(ConfirmOutcome::AwaitingPayment);
        }

        let fee = deposit
            .amount
            .mul_decimal(self.config.withdrawal.fee_fraction);
        let fee_forwarded = self.forward_fee(user_id, deposit_id, fee).await?;

        let balance = self.store.transact(user_id, |unit| {
            let mut deposit = unit.deposit(deposit_id)?;
            if deposit.status != DepositStatus::Pending {
                return Err(Error::AlreadyProcessed(format!(
                    "deposit {} is {}",
                    deposit_id,
                    deposit.status.as_str()
                )));
            }

            deposit.status = DepositStatus::Completed;
            deposit.updated_at = Utc::now();
            unit.put_deposit(&deposit)?;
            let balance = unit.credit(deposit.amount)?;
            unit.record(NewOperation {
                user_id,
                op_type: OperationType::Deposit,
                amount: deposit.amount,
                description: format!("Deposit {} confirmed", deposit_id),
                metadata: json!({
                    "deposit_id": deposit_id,
                    "memo": deposit.memo,
                    "platform_fee": fee.to_string(),
                    "fee_forwarded": fee_forwarded,
                }),
            })?;

            Ok::<_, Error>(balance)
        })?;

        self.metrics.deposits_credited.inc();
        tracing::info!(
            user_id,
            deposit_id,
            amount = %deposit.amount,
            balance = %balance,
            "Deposit credited"
        );

        Ok(ConfirmOutcome::Credited { balance })
    }

    /// Returns whether the fee reached the fee wallet
    async fn forward_fee(&self, user_id: UserId, deposit_id: DepositId, fee: Amount) -> Result<bool> {
        if !fee.is_positive() {
            return Ok(true);
        }

        match self
            .call("forward_platform_fee", self.chain.forward_platform_fee(fee))
            .await
        {
            Ok(tx_id) => {
                tracing::debug!(user_id, deposit_id, fee = %fee, tx_id = %tx_id, "Platform fee forwarded");
                Ok(true)
            }
            Err(err) => {
                self.metrics.fee_forward_failures.inc();
                match self.config.deposit.fee_policy {
                    FeePolicy::Strict => {
                        tracing::warn!(user_id, deposit_id, error = %err, "Fee forward failed, deposit stays pending");
                        Err(err)
                    }
                    FeePolicy::BestEffort => {
                        tracing::warn!(user_id, deposit_id, error = %err, "Fee forward failed, crediting anyway");
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Abandon a pending deposit
    pub fn cancel(&self, user_id: UserId, deposit_id: DepositId) -> Result<DepositRequest> {
        self.pending_deposit(user_id, deposit_id)?;
        let _in_flight = self.claim(deposit_id)?;

        let deposit = self.store.transact(user_id, |unit| {
            let mut deposit = unit.deposit(deposit_id)?;
            if deposit.status != DepositStatus::Pending {
                return Err(Error::AlreadyProcessed(format!(
                    "deposit {} is {}",
                    deposit_id,
                    deposit.status.as_str()
                )));
            }
            deposit.status = DepositStatus::Failed;
            deposit.updated_at = Utc::now();
            unit.put_deposit(&deposit)?;
            Ok::<_, Error>(deposit)
        })?;

        tracing::info!(user_id, deposit_id, "Deposit cancelled");
        Ok(deposit)
    }

    /// Deposit requests of a user, ordered by id
    pub fn list(&self, user_id: UserId) -> Result<Vec<DepositRequest>> {
        self.store.get_user(user_id)?;
        Ok(self.store.list_deposits(user_id)?)
    }
}
