//! Investment lifecycle
//!
//! Positions are opened against the available balance and closed back into it.
//! Yield is settled on demand in whole weeks, and each settled profit is
//! handed to the referral cascade.

use crate::{config::EngineConfig, metrics::Metrics, referral::ReferralEngine, Error, Result};
use chrono::{DateTime, Duration, Utc};
use ledger_core::{
    Amount, Investment, InvestmentId, NewOperation, OperationType, ReferralEarning, Sequence,
    Store, UserId,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Result of opening a position
#[derive(Debug, Clone, Serialize)]
pub struct OpenedInvestment {
    /// The new position
    pub investment: Investment,
    /// Balance left after the debit
    pub remaining_balance: Amount,
    /// Configured weekly yield
    pub weekly_percent: Decimal,
    /// `principal * weekly_percent / 100`, display only
    pub example_weekly_profit: Amount,
    /// Lock period of the type
    pub lock_period_days: u32,
    /// Lock rule as text
    pub lock_description: String,
}

/// Result of closing a position
#[derive(Debug, Clone, Serialize)]
pub struct ClosedInvestment {
    /// The removed position
    pub investment: Investment,
    /// Balance after the principal came back
    pub balance: Amount,
    /// Whole days the position was open
    pub duration_days: i64,
}

/// Result of a yield settlement
#[derive(Debug, Clone, Serialize)]
pub struct YieldSettlement {
    /// Position settled
    pub investment_id: InvestmentId,
    /// Whole weeks paid out
    pub weeks: i64,
    /// Profit credited
    pub profit: Amount,
    /// Balance after the credit
    pub balance: Amount,
    /// Referral earnings produced by the profit
    pub referral_earnings: Vec<ReferralEarning>,
}

/// Opens, closes and settles investment positions
#[derive(Debug)]
pub struct InvestmentService {
    store: Arc<Store>,
    config: Arc<EngineConfig>,
    referrals: Arc<ReferralEngine>,
    metrics: Arc<Metrics>,
}

impl InvestmentService {
    /// Create new investment service
    pub fn new(
        store: Arc<Store>,
        config: Arc<EngineConfig>,
        referrals: Arc<ReferralEngine>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            config,
            referrals,
            metrics,
        }
    }

    /// Open a position of `kind`, debiting `amount` from the user's balance
    pub fn open(&self, user_id: UserId, kind: &str, amount: Amount) -> Result<OpenedInvestment> {
        let rules = self
            .config
            .investment_type(kind)
            .ok_or_else(|| Error::InvalidType(kind.to_string()))?;

        if !amount.is_positive() {
            return Err(Error::InvalidAmount(amount));
        }

        let minimum = rules.min_amount()?;
        if amount < minimum {
            return Err(Error::BelowMinimum {
                kind: kind.to_string(),
                amount,
                minimum,
            });
        }

        let (investment, remaining_balance) = self.store.transact(user_id, |unit| {
            let now = Utc::now();
            let investment = Investment {
                id: unit.next_id(Sequence::Investment)?,
                user_id,
                kind: kind.to_string(),
                principal: amount,
                created_at: now,
                yield_settled_at: now,
            };

            let remaining = unit.debit(amount)?;
            unit.put_investment(&investment)?;
            unit.record(NewOperation {
                user_id,
                op_type: OperationType::InvestmentCreated,
                amount,
                description: format!("Opened {} investment", kind),
                metadata: json!({
                    "investment_id": investment.id,
                    "type": kind,
                    "weekly_percent": rules.weekly_percent.to_string(),
                    "lock_period_days": rules.lock_period_days,
                }),
            })?;

            Ok::<_, Error>((investment, remaining))
        })?;

        self.metrics.investments_opened.inc();
        tracing::info!(
            user_id,
            investment_id = investment.id,
            kind,
            amount = %amount,
            "Investment opened"
        );

        Ok(OpenedInvestment {
            example_weekly_profit: amount.percent(rules.weekly_percent),
            weekly_percent: rules.weekly_percent,
            lock_period_days: rules.lock_period_days,
            lock_description: rules.lock_description(),
            remaining_balance,
            investment,
        })
    }

    /// Close a position, returning its principal to the balance
    pub fn close(&self, user_id: UserId, investment_id: InvestmentId) -> Result<ClosedInvestment> {
        self.close_at(user_id, investment_id, Utc::now())
    }

    /// [`close`](Self::close) evaluated at `now`
    pub fn close_at(
        &self,
        user_id: UserId,
        investment_id: InvestmentId,
        now: DateTime<Utc>,
    ) -> Result<ClosedInvestment> {
        let closed = self.store.transact(user_id, |unit| {
            let investment = unit
                .investment(investment_id)?
                .ok_or_else(|| Error::NotFound {
                    entity: "investment",
                    id: investment_id.to_string(),
                })?;

            // Types dropped from configuration no longer lock anything
            if let Some(rules) = self.config.investment_type(&investment.kind) {
                let unlocks_at = investment
                    .created_at
                    .checked_add_signed(Duration::days(i64::from(rules.lock_period_days)))
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "{}: lock period of {} days is out of range",
                            investment.kind, rules.lock_period_days
                        ))
                    })?;
                if now < unlocks_at {
                    return Err(Error::InvestmentLocked { unlocks_at });
                }
            }

            let duration_days = (now - investment.created_at).num_days().max(0);

            unit.delete_investment(investment.id)?;
            let balance = unit.credit(investment.principal)?;
            unit.record(NewOperation {
                user_id,
                op_type: OperationType::InvestmentClosed,
                amount: investment.principal,
                description: format!("Closed {} investment", investment.kind),
                metadata: json!({
                    "investment_id": investment.id,
                    "type": investment.kind,
                    "original_created_at": investment.created_at.to_rfc3339(),
                    "duration_days": duration_days,
                }),
            })?;

            Ok::<_, Error>(ClosedInvestment {
                investment,
                balance,
                duration_days,
            })
        })?;

        self.metrics.investments_closed.inc();
        tracing::info!(
            user_id,
            investment_id,
            amount = %closed.investment.principal,
            duration_days = closed.duration_days,
            "Investment closed"
        );

        Ok(closed)
    }

    /// Open positions of a user, ordered by id
    pub fn list(&self, user_id: UserId) -> Result<Vec<Investment>> {
        self.store.get_user(user_id)?;
        Ok(self.store.list_investments(user_id)?)
    }

    /// Credit whole weeks of yield accrued since the last settlement
    pub fn settle_yield(&self, user_id: UserId, investment_id: InvestmentId) -> Result<YieldSettlement> {
        self.settle_yield_at(user_id, investment_id, Utc::now())
    }

    /// [`settle_yield`](Self::settle_yield) evaluated at `now`
    ///
    /// A referral cascade failure is returned as an error; the yield credit
    /// itself has already committed by then.
    pub fn settle_yield_at(
        &self,
        user_id: UserId,
        investment_id: InvestmentId,
        now: DateTime<Utc>,
    ) -> Result<YieldSettlement> {
        let (weeks, profit, balance) = self.store.transact(user_id, |unit| {
            let mut investment = unit
                .investment(investment_id)?
                .ok_or_else(|| Error::NotFound {
                    entity: "investment",
                    id: investment_id.to_string(),
                })?;

            let weeks = (now - investment.yield_settled_at).num_weeks().max(0);
            if weeks == 0 {
                return Ok((0, Amount::ZERO, unit.user().balance));
            }

            let rules = self
                .config
                .investment_type(&investment.kind)
                .ok_or_else(|| Error::InvalidType(investment.kind.clone()))?;
            let factor = rules.weekly_percent * Decimal::from(weeks) / Decimal::ONE_HUNDRED;
            let profit = investment.principal.mul_decimal(factor);

            investment.yield_settled_at = investment.yield_settled_at + Duration::weeks(weeks);
            unit.put_investment(&investment)?;
            let balance = unit.credit(profit)?;
            unit.record(NewOperation {
                user_id,
                op_type: OperationType::YieldAccrued,
                amount: profit,
                description: format!("{} week(s) of {} yield", weeks, investment.kind),
                metadata: json!({
                    "investment_id": investment.id,
                    "type": investment.kind,
                    "weeks": weeks,
                    "weekly_percent": rules.weekly_percent.to_string(),
                }),
            })?;

            Ok::<_, Error>((weeks, profit, balance))
        })?;

        if weeks == 0 {
            return Ok(YieldSettlement {
                investment_id,
                weeks,
                profit,
                balance,
                referral_earnings: Vec::new(),
            });
        }

        self.metrics.yield_settlements.inc();
        tracing::info!(user_id, investment_id, weeks, amount = %profit, "Yield settled");

        let referral_earnings = self.referrals.distribute(user_id, profit)?;

        Ok(YieldSettlement {
            investment_id,
            weeks,
            profit,
            balance,
            referral_earnings,
        })
    }
}
