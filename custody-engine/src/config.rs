//! Configuration for the custody engine

use crate::{Error, Result};
use ledger_core::Amount;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Longest lock period an investment type may declare
pub const MAX_LOCK_PERIOD_DAYS: u32 = 36_500;

/// Custody engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ledger store configuration
    pub ledger: ledger_core::Config,

    /// Investment types by name
    pub investment_types: BTreeMap<String, InvestmentTypeConfig>,

    /// Referral payout percents
    pub referral: ReferralConfig,

    /// Withdrawal rules
    pub withdrawal: WithdrawalConfig,

    /// Deposit reconciliation
    pub deposit: DepositConfig,

    /// Chain transport
    pub transport: TransportConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut investment_types = BTreeMap::new();
        investment_types.insert(
            "low".to_string(),
            InvestmentTypeConfig {
                weekly_percent: dec!(1.5),
                min_amount: dec!(1),
                lock_period_days: 0,
            },
        );
        investment_types.insert(
            "medium".to_string(),
            InvestmentTypeConfig {
                weekly_percent: dec!(3),
                min_amount: dec!(10),
                lock_period_days: 30,
            },
        );
        investment_types.insert(
            "high".to_string(),
            InvestmentTypeConfig {
                weekly_percent: dec!(5),
                min_amount: dec!(100),
                lock_period_days: 90,
            },
        );

        Self {
            ledger: ledger_core::Config::default(),
            investment_types,
            referral: ReferralConfig::default(),
            withdrawal: WithdrawalConfig::default(),
            deposit: DepositConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Rules for one investment type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestmentTypeConfig {
    /// Yield per week, in percent of principal
    pub weekly_percent: Decimal,

    /// Smallest principal accepted
    pub min_amount: Decimal,

    /// Days after opening before the position may be closed (0 = anytime)
    pub lock_period_days: u32,
}

impl InvestmentTypeConfig {
    /// Minimum principal as a ledger amount
    pub fn min_amount(&self) -> Result<Amount> {
        Ok(Amount::from_decimal(self.min_amount)?)
    }

    /// Human-readable lock rule
    pub fn lock_description(&self) -> String {
        if self.lock_period_days == 0 {
            "can withdraw anytime".to_string()
        } else {
            format!("locked for {} days", self.lock_period_days)
        }
    }
}

/// Referral payout percents by level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralConfig {
    /// Direct referrer
    pub level1_percent: Decimal,
    /// Referrer's referrer
    pub level2_percent: Decimal,
    /// Third hop
    pub level3_percent: Decimal,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            level1_percent: dec!(7),
            level2_percent: dec!(3),
            level3_percent: dec!(1),
        }
    }
}

impl ReferralConfig {
    /// Percents ordered by level, level 1 first
    pub fn percents(&self) -> [Decimal; 3] {
        [self.level1_percent, self.level2_percent, self.level3_percent]
    }
}

/// Withdrawal rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WithdrawalConfig {
    /// Share of each completed deposit kept by the platform
    pub fee_fraction: Decimal,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            fee_fraction: dec!(0.2),
        }
    }
}

/// What to do when forwarding the platform fee fails during confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeePolicy {
    /// Abort confirmation, deposit stays pending
    Strict,
    /// Log, count and credit anyway
    BestEffort,
}

/// Deposit reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepositConfig {
    /// How far back the transport scans for a matching payment
    pub lookback_minutes: u32,

    /// Fee forwarding policy
    pub fee_policy: FeePolicy,
}

impl Default for DepositConfig {
    fn default() -> Self {
        Self {
            lookback_minutes: 30,
            fee_policy: FeePolicy::Strict,
        }
    }
}

/// Chain transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Upper bound on any single transport call
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl EngineConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = EngineConfig::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `CUSTODY_*` and `LEDGER_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.ledger.apply_env()?;

        if let Ok(fraction) = std::env::var("CUSTODY_FEE_FRACTION") {
            self.withdrawal.fee_fraction = fraction
                .parse()
                .map_err(|e| Error::Config(format!("CUSTODY_FEE_FRACTION: {}", e)))?;
        }

        if let Ok(minutes) = std::env::var("CUSTODY_DEPOSIT_LOOKBACK_MINUTES") {
            self.deposit.lookback_minutes = minutes
                .parse()
                .map_err(|e| Error::Config(format!("CUSTODY_DEPOSIT_LOOKBACK_MINUTES: {}", e)))?;
        }

        if let Ok(secs) = std::env::var("CUSTODY_TRANSPORT_TIMEOUT_SECS") {
            self.transport.timeout_secs = secs
                .parse()
                .map_err(|e| Error::Config(format!("CUSTODY_TRANSPORT_TIMEOUT_SECS: {}", e)))?;
        }

        self.validate()
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.ledger
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        if self.investment_types.is_empty() {
            return Err(Error::Config("no investment types configured".to_string()));
        }

        for (name, kind) in &self.investment_types {
            if kind.weekly_percent.is_sign_negative() {
                return Err(Error::Config(format!("{}: weekly_percent is negative", name)));
            }
            if kind.min_amount.is_sign_negative() {
                return Err(Error::Config(format!("{}: min_amount is negative", name)));
            }
            kind.min_amount()
                .map_err(|e| Error::Config(format!("{}: {}", name, e)))?;
            if kind.lock_period_days > MAX_LOCK_PERIOD_DAYS {
                return Err(Error::Config(format!(
                    "{}: lock_period_days exceeds {}",
                    name, MAX_LOCK_PERIOD_DAYS
                )));
            }
        }

        for (level, percent) in self.referral.percents().iter().enumerate() {
            if percent.is_sign_negative() {
                return Err(Error::Config(format!(
                    "referral level{}_percent is negative",
                    level + 1
                )));
            }
        }

        let fee = self.withdrawal.fee_fraction;
        if fee.is_sign_negative() || fee >= Decimal::ONE {
            return Err(Error::Config(format!(
                "fee_fraction must be within [0, 1), got {}",
                fee
            )));
        }

        if self.transport.timeout_secs == 0 {
            return Err(Error::Config("transport timeout_secs must be positive".to_string()));
        }

        Ok(())
    }

    /// Ledger data directory
    pub fn data_dir(&self) -> &PathBuf {
        &self.ledger.data_dir
    }

    /// Rules for a named investment type
    pub fn investment_type(&self, name: &str) -> Option<&InvestmentTypeConfig> {
        self.investment_types.get(name)
    }
}
