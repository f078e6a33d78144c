//! Referral cascade
//!
//! Realized profit at a user is shared with up to three referrers above them.
//! Each hop is its own unit of work: a failure at hop 2 leaves hop 1 credited
//! and stops the walk.

use crate::{config::ReferralConfig, metrics::Metrics, Error, Result};
use chrono::Utc;
use ledger_core::{
    Amount, NewOperation, OperationType, ReferralEarning, Sequence, Store, UserId,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Referral summary for one user
#[derive(Debug, Clone, Serialize)]
pub struct ReferralStats {
    /// Users referred directly or indirectly, all levels
    pub total_referrals: usize,

    /// Sum of every referral earning credited to the user
    pub total_earnings: Amount,

    /// Per-level counts and earnings, level 1 first
    pub levels: Vec<LevelSummary>,

    /// One entry per referred user
    pub referrals: Vec<ReferralDetail>,
}

/// Referral totals for one level
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelSummary {
    /// Hop distance
    pub level: u8,
    /// Referred users at this level
    pub referrals: usize,
    /// Earnings credited for this level
    pub earnings: Amount,
}

/// One referred user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferralDetail {
    /// Referred user
    pub user_id: UserId,
    /// Hop distance
    pub level: u8,
    /// Principal currently invested by the referred user
    pub total_invested: Amount,
    /// Earnings this user's profits produced for the referrer
    pub earnings_from_user: Amount,
}

/// Walks the referrer chain and credits earnings
#[derive(Debug)]
pub struct ReferralEngine {
    store: Arc<Store>,
    config: ReferralConfig,
    metrics: Arc<Metrics>,
}

impl ReferralEngine {
    /// Create new referral engine
    pub fn new(store: Arc<Store>, config: ReferralConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    fn depth(&self) -> u8 {
        let levels = self.config.percents().len() as u8;
        levels.min(self.store.config().max_referral_depth)
    }

    /// Credit the referrers of `user_id` with their share of `profit`
    ///
    /// Returns the earnings created, nearest referrer first. Hops whose share
    /// truncates to zero are skipped without ending the walk.
    pub fn distribute(&self, user_id: UserId, profit: Amount) -> Result<Vec<ReferralEarning>> {
        if profit.is_negative() {
            return Err(Error::InvalidAmount(profit));
        }

        let chain = self.store.referrer_chain(user_id, self.depth())?;
        let percents = self.config.percents();
        let mut earnings = Vec::with_capacity(chain.len());

        for (index, referrer) in chain.iter().enumerate() {
            let level = index as u8 + 1;
            let percent = percents[index];
            let amount = profit.percent(percent);

            if !amount.is_positive() {
                tracing::debug!(user_id, level, %profit, "Referral share rounds to zero");
                continue;
            }

            match self.credit_hop(referrer.id, user_id, level, percent, amount) {
                Ok(earning) => earnings.push(earning),
                Err(Error::NotFound { entity: "user", .. }) => {
                    tracing::warn!(
                        user_id,
                        referrer_id = referrer.id,
                        level,
                        "Referrer removed during cascade, stopping"
                    );
                    break;
                }
                Err(err) => {
                    tracing::error!(
                        user_id,
                        referrer_id = referrer.id,
                        level,
                        error = %err,
                        "Referral hop failed, remaining hops skipped"
                    );
                    return Err(err);
                }
            }
        }

        Ok(earnings)
    }

    fn credit_hop(
        &self,
        referrer_id: UserId,
        referred_id: UserId,
        level: u8,
        percent: Decimal,
        amount: Amount,
    ) -> Result<ReferralEarning> {
        let earning = self.store.transact(referrer_id, |unit| {
            let earning = ReferralEarning {
                id: unit.next_id(Sequence::Earning)?,
                referrer_id,
                referred_id,
                amount,
                level,
                created_at: Utc::now(),
            };

            unit.credit(amount)?;
            unit.put_earning(&earning)?;
            unit.record(NewOperation {
                user_id: referrer_id,
                op_type: OperationType::ReferralEarning,
                amount,
                description: format!("Level {} referral earning from user {}", level, referred_id),
                metadata: json!({
                    "earning_id": earning.id,
                    "referred_id": referred_id,
                    "level": level,
                    "percent": percent.to_string(),
                }),
            })?;

            Ok::<_, Error>(earning)
        })?;

        self.metrics.referral_payouts.inc();
        tracing::info!(
            user_id = referrer_id,
            referred_id,
            level,
            amount = %amount,
            "Referral earning credited"
        );

        Ok(earning)
    }

    /// Referral summary: downline per level and what it earned the user
    pub fn stats(&self, user_id: UserId) -> Result<ReferralStats> {
        self.store.get_user(user_id)?;

        let depth = self.depth();
        let downline: Vec<_> = self
            .store
            .downline(user_id)?
            .into_iter()
            .filter(|member| member.level <= depth)
            .collect();
        let earnings = self.store.list_earnings(user_id)?;

        let mut by_referred: BTreeMap<UserId, Amount> = BTreeMap::new();
        let mut by_level: BTreeMap<u8, Amount> = BTreeMap::new();
        for earning in &earnings {
            let from_user = by_referred.entry(earning.referred_id).or_default();
            *from_user = *from_user + earning.amount;
            let at_level = by_level.entry(earning.level).or_default();
            *at_level = *at_level + earning.amount;
        }

        let mut referrals = Vec::with_capacity(downline.len());
        for member in &downline {
            let total_invested = self
                .store
                .list_investments(member.user_id)?
                .iter()
                .map(|investment| investment.principal)
                .sum();
            referrals.push(ReferralDetail {
                user_id: member.user_id,
                level: member.level,
                total_invested,
                earnings_from_user: by_referred.get(&member.user_id).copied().unwrap_or_default(),
            });
        }

        let levels = (1..=depth)
            .map(|level| LevelSummary {
                level,
                referrals: downline.iter().filter(|d| d.level == level).count(),
                earnings: by_level.get(&level).copied().unwrap_or_default(),
            })
            .collect();

        Ok(ReferralStats {
            total_referrals: downline.len(),
            total_earnings: earnings.iter().map(|e| e.amount).sum(),
            levels,
            referrals,
        })
    }
}
