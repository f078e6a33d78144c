//! Withdrawal settlement
//!
//! State machine: `requested -> reserved -> transferring -> settled | transfer_failed`.
//!
//! The amount is held in the user's `reserved` bucket before any network call
//! and the balance is debited only once the transfer has a transaction id. No
//! ledger lock is held while the transfer is in flight.

use crate::{
    chain::{bounded, ChainTransport, TxId},
    config::EngineConfig,
    metrics::Metrics,
    Error, Result,
};
use chrono::Utc;
use ledger_core::{
    Amount, DepositRequest, DepositStatus, NewOperation, OperationType, Sequence, Store, Unit,
    User, UserId, WithdrawalId, WithdrawalRequest, WithdrawalStatus,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a withdrawal whose transfer went through
#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalReceipt {
    /// Record as last persisted: `settled`, or `transferring` if settling it failed
    pub withdrawal: WithdrawalRequest,
    /// External transaction id
    pub tx_hash: TxId,
}

/// How an operator resolves a withdrawal stuck in `transferring`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The transfer landed on chain
    Settled {
        /// External transaction id
        tx_hash: TxId,
    },
    /// The transfer never happened
    Failed,
}

/// Reserves, transfers and settles withdrawals
pub struct WithdrawalService {
    store: Arc<Store>,
    chain: Arc<dyn ChainTransport>,
    config: Arc<EngineConfig>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for WithdrawalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WithdrawalService")
            .field("fee_fraction", &self.config.withdrawal.fee_fraction)
            .finish()
    }
}

/// `(1 - fee_fraction) * completed deposits - settled withdrawals`, floored at zero
fn allowance(
    deposits: &[DepositRequest],
    withdrawals: &[WithdrawalRequest],
    fee_fraction: rust_decimal::Decimal,
) -> Amount {
    let deposited: Amount = deposits
        .iter()
        .filter(|d| d.status == DepositStatus::Completed)
        .map(|d| d.amount)
        .sum();
    let withdrawn: Amount = withdrawals
        .iter()
        .filter(|w| w.status == WithdrawalStatus::Settled)
        .map(|w| w.amount)
        .sum();

    let ceiling = deposited.mul_decimal(rust_decimal::Decimal::ONE - fee_fraction) - withdrawn;
    if ceiling.is_negative() {
        Amount::ZERO
    } else {
        ceiling
    }
}

fn transition(withdrawal: &mut WithdrawalRequest, next: WithdrawalStatus) -> Result<()> {
    if !withdrawal.status.can_transition_to(next) {
        return Err(Error::Conflict(format!(
            "withdrawal {} cannot move from {} to {}",
            withdrawal.id,
            withdrawal.status.as_str(),
            next.as_str()
        )));
    }
    withdrawal.status = next;
    withdrawal.updated_at = Utc::now();
    Ok(())
}

fn ensure_transferring(unit: &Unit<'_>, withdrawal_id: WithdrawalId) -> Result<()> {
    let current = unit.withdrawal(withdrawal_id)?;
    if current.status != WithdrawalStatus::Transferring {
        return Err(Error::AlreadyProcessed(format!(
            "withdrawal {} is {}",
            withdrawal_id,
            current.status.as_str()
        )));
    }
    Ok(())
}

/// `transferring -> settled`: debit the held amount and attach the tx id
fn apply_settled(
    unit: &mut Unit<'_>,
    withdrawal_id: WithdrawalId,
    tx_hash: &str,
) -> Result<WithdrawalRequest> {
    let mut withdrawal = unit.withdrawal(withdrawal_id)?;
    transition(&mut withdrawal, WithdrawalStatus::Settled)?;
    withdrawal.tx_hash = Some(tx_hash.to_string());
    unit.settle_reserved(withdrawal.amount)?;
    unit.put_withdrawal(&withdrawal)?;
    Ok(withdrawal)
}

/// `reserved | transferring -> transfer_failed`: release the held amount
fn apply_failed(unit: &mut Unit<'_>, withdrawal_id: WithdrawalId) -> Result<WithdrawalRequest> {
    let mut withdrawal = unit.withdrawal(withdrawal_id)?;
    transition(&mut withdrawal, WithdrawalStatus::TransferFailed)?;
    unit.release(withdrawal.amount)?;
    unit.put_withdrawal(&withdrawal)?;
    Ok(withdrawal)
}

impl WithdrawalService {
    /// Create new withdrawal service
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
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.transport.timeout_secs)
    }

    /// Withdrawal allowance, bounded by the available balance
    pub fn available(&self, user_id: UserId) -> Result<Amount> {
        let user = self.store.get_user(user_id)?;
        let ceiling = allowance(
            &self.store.list_deposits(user_id)?,
            &self.store.list_withdrawals(user_id)?,
            self.config.withdrawal.fee_fraction,
        );
        Ok(ceiling.min(user.available()))
    }

    /// Withdrawals of a user, ordered by id
    pub fn list(&self, user_id: UserId) -> Result<Vec<WithdrawalRequest>> {
        self.store.get_user(user_id)?;
        Ok(self.store.list_withdrawals(user_id)?)
    }

    /// Send `amount` to the user's own wallet
    pub async fn withdraw(&self, user_id: UserId, amount: Amount) -> Result<WithdrawalReceipt> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount(amount));
        }

        let user = self.store.get_user(user_id)?;
        let destination = bounded(
            self.timeout(),
            "derive_address",
            self.chain.derive_address(&user.pub_key),
        )
        .await?;

        let withdrawal = self.reserve(&user, amount, &destination)?;
        let withdrawal_id = withdrawal.id;

        let handed_off = self.store.transact(user_id, |unit| {
            let mut withdrawal = unit.withdrawal(withdrawal_id)?;
            transition(&mut withdrawal, WithdrawalStatus::Transferring)?;
            unit.put_withdrawal(&withdrawal)?;
            Ok::<_, Error>(())
        });
        if let Err(err) = handed_off {
            self.finish_failed(user_id, withdrawal_id, &err);
            return Err(err);
        }

        let started = Instant::now();
        let transfer = bounded(
            self.timeout(),
            "send_payment",
            self.chain.send_payment(&destination, amount),
        )
        .await;
        self.metrics
            .record_external_call(started.elapsed().as_secs_f64());

        match transfer {
            Ok(tx_hash) => Ok(self.finish_settled(user_id, withdrawal_id, amount, tx_hash)),
            Err(err) => {
                self.finish_failed(user_id, withdrawal_id, &err);
                Err(err)
            }
        }
    }

    /// Validate against the allowance and hold `amount` (unit A)
    fn reserve(&self, user: &User, amount: Amount, destination: &str) -> Result<WithdrawalRequest> {
        let fee_fraction = self.config.withdrawal.fee_fraction;

        self.store.transact(user.id, |unit| {
            let deposits = unit.store().list_deposits(user.id)?;
            let withdrawals = unit.store().list_withdrawals(user.id)?;

            let pending_deposits = deposits
                .iter()
                .filter(|d| d.status == DepositStatus::Pending)
                .count();
            let open_withdrawals = withdrawals
                .iter()
                .filter(|w| !w.status.is_terminal())
                .count();
            if pending_deposits > 0 || open_withdrawals > 0 {
                return Err(Error::PendingOperationsExist(format!(
                    "{} pending deposit(s), {} unfinished withdrawal(s)",
                    pending_deposits, open_withdrawals
                )));
            }

            let available = allowance(&deposits, &withdrawals, fee_fraction)
                .min(unit.user().available());
            if amount > available {
                tracing::warn!(
                    user_id = user.id,
                    amount = %amount,
                    available = %available,
                    "Withdrawal exceeds allowance"
                );
                return Err(Error::InsufficientFunds {
                    required: amount,
                    available,
                });
            }

            let now = Utc::now();
            let mut withdrawal = WithdrawalRequest {
                id: unit.next_id(Sequence::Withdrawal)?,
                user_id: user.id,
                amount,
                status: WithdrawalStatus::Requested,
                destination: Some(destination.to_string()),
                tx_hash: None,
                created_at: now,
                updated_at: now,
            };
            unit.reserve(amount)?;
            transition(&mut withdrawal, WithdrawalStatus::Reserved)?;
            unit.put_withdrawal(&withdrawal)?;

            tracing::info!(
                user_id = user.id,
                withdrawal_id = withdrawal.id,
                amount = %amount,
                "Withdrawal reserved"
            );

            Ok(withdrawal)
        })
    }

    /// Transfer succeeded (unit C, then the audit entry)
    fn finish_settled(
        &self,
        user_id: UserId,
        withdrawal_id: WithdrawalId,
        amount: Amount,
        tx_hash: TxId,
    ) -> WithdrawalReceipt {
        let settled = self
            .store
            .transact(user_id, |unit| apply_settled(unit, withdrawal_id, &tx_hash));

        let withdrawal = match settled {
            Ok(withdrawal) => withdrawal,
            Err(err) => {
                // Funds left the wallet; the record stays transferring for an operator
                tracing::error!(
                    user_id,
                    withdrawal_id,
                    tx_hash = %tx_hash,
                    error = %err,
                    "Transfer succeeded but settling the withdrawal failed"
                );
                let mut withdrawal = self
                    .store
                    .get_withdrawal(withdrawal_id)
                    .unwrap_or_else(|_| WithdrawalRequest {
                        id: withdrawal_id,
                        user_id,
                        amount,
                        status: WithdrawalStatus::Transferring,
                        destination: None,
                        tx_hash: None,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    });
                withdrawal.tx_hash = Some(tx_hash.clone());
                return WithdrawalReceipt {
                    withdrawal,
                    tx_hash,
                };
            }
        };

        self.metrics.withdrawals_settled.inc();
        tracing::info!(
            user_id,
            withdrawal_id,
            amount = %amount,
            tx_hash = %tx_hash,
            "Withdrawal settled"
        );

        self.record_settled(&withdrawal, &tx_hash);

        WithdrawalReceipt {
            withdrawal,
            tx_hash,
        }
    }

    /// Append the `withdrawal` operation; failures are logged and counted only
    fn record_settled(&self, withdrawal: &WithdrawalRequest, tx_hash: &str) {
        let recorded = self.store.record_operation(NewOperation {
            user_id: withdrawal.user_id,
            op_type: OperationType::Withdrawal,
            amount: withdrawal.amount,
            description: format!("Withdrawal {} settled", withdrawal.id),
            metadata: json!({
                "withdrawal_id": withdrawal.id,
                "tx_hash": tx_hash,
                "destination": withdrawal.destination,
            }),
        });

        if let Err(err) = recorded {
            self.metrics.degraded_audit_writes.inc();
            tracing::error!(
                user_id = withdrawal.user_id,
                withdrawal_id = withdrawal.id,
                tx_hash,
                error = %err,
                "Withdrawal settled but its operation was not recorded"
            );
        }
    }

    /// Transfer failed or timed out (compensating unit)
    fn finish_failed(&self, user_id: UserId, withdrawal_id: WithdrawalId, cause: &Error) {
        self.metrics.withdrawals_failed.inc();

        match self
            .store
            .transact(user_id, |unit| apply_failed(unit, withdrawal_id))
        {
            Ok(_) => tracing::warn!(
                user_id,
                withdrawal_id,
                error = %cause,
                "Withdrawal transfer failed, reservation released"
            ),
            Err(err) => tracing::error!(
                user_id,
                withdrawal_id,
                cause = %cause,
                error = %err,
                "Withdrawal transfer failed and releasing the reservation failed"
            ),
        }
    }

    /// Resolve a withdrawal stuck in `transferring` (admin path)
    pub fn resolve_stuck(
        &self,
        withdrawal_id: WithdrawalId,
        resolution: Resolution,
    ) -> Result<WithdrawalRequest> {
        let user_id = self.store.get_withdrawal(withdrawal_id)?.user_id;

        match resolution {
            Resolution::Settled { tx_hash } => {
                let withdrawal = self.store.transact(user_id, |unit| {
                    ensure_transferring(unit, withdrawal_id)?;
                    apply_settled(unit, withdrawal_id, &tx_hash)
                })?;
                self.metrics.withdrawals_settled.inc();
                tracing::info!(user_id, withdrawal_id, tx_hash = %tx_hash, "Stuck withdrawal settled");
                self.record_settled(&withdrawal, &tx_hash);
                Ok(withdrawal)
            }
            Resolution::Failed => {
                let withdrawal = self.store.transact(user_id, |unit| {
                    ensure_transferring(unit, withdrawal_id)?;
                    apply_failed(unit, withdrawal_id)
                })?;
                self.metrics.withdrawals_failed.inc();
                tracing::info!(user_id, withdrawal_id, "Stuck withdrawal marked failed");
                Ok(withdrawal)
            }
        }
    }
}
