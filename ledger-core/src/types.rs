//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode rows)
//! - Exact arithmetic (fixed-point nano-units for money)

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// User identifier
pub type UserId = u64;
/// Investment identifier
pub type InvestmentId = u64;
/// Deposit request identifier
pub type DepositId = u64;
/// Withdrawal request identifier
pub type WithdrawalId = u64;
/// Operation log entry identifier
pub type OperationId = u64;
/// Referral earning identifier
pub type EarningId = u64;

/// Number of fractional digits carried by [`Amount`]
pub const AMOUNT_SCALE: u32 = 9;

const NANOS_PER_UNIT: i64 = 1_000_000_000;

/// Monetary amount in nano-units (1 unit = 10^9 nanos)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    /// Zero
    pub const ZERO: Amount = Amount(0);

    /// Create from raw nano-units
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create from whole units
    pub const fn from_units(units: i64) -> Self {
        Self(units.saturating_mul(NANOS_PER_UNIT))
    }

    /// Raw nano-units
    pub const fn nanos(self) -> i64 {
        self.0
    }

    /// Convert an exact decimal; more than 9 fractional digits is rejected
    pub fn from_decimal(value: Decimal) -> Result<Self> {
        let normalized = value.normalize();
        if normalized.scale() > AMOUNT_SCALE {
            return Err(Error::InvalidInput(format!(
                "amount {} has more than {} decimal places",
                value, AMOUNT_SCALE
            )));
        }

        normalized
            .checked_mul(Decimal::from(NANOS_PER_UNIT))
            .and_then(|nanos| nanos.to_i64())
            .map(Self)
            .ok_or_else(|| Error::InvalidInput(format!("amount {} out of range", value)))
    }

    /// Exact decimal representation
    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, AMOUNT_SCALE).normalize()
    }

    /// Strictly greater than zero
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Strictly less than zero
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Checked addition
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Multiply by a decimal factor, truncating toward zero to whole nanos
    pub fn mul_decimal(self, factor: Decimal) -> Amount {
        Decimal::from(self.0)
            .checked_mul(factor)
            .and_then(|product| product.trunc().to_i64())
            .map(Amount)
            .unwrap_or(if factor.is_sign_negative() == self.is_negative() {
                Amount(i64::MAX)
            } else {
                Amount(i64::MIN)
            })
    }

    /// `self * percent / 100`, truncated toward zero
    pub fn percent(self, percent: Decimal) -> Amount {
        self.mul_decimal(percent / Decimal::ONE_HUNDRED)
    }

    /// Smaller of two amounts
    pub fn min(self, other: Amount) -> Amount {
        if self <= other {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = Decimal::from_str(s.trim())
            .map_err(|e| Error::InvalidInput(format!("invalid amount '{}': {}", s, e)))?;
        Amount::from_decimal(value)
    }
}

/// Saturating; ledger writes use [`Amount::checked_add`] to reject overflow
impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

/// Saturating; ledger writes use [`Amount::checked_sub`] to reject overflow
impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

/// Platform user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Numeric identity
    pub id: UserId,

    /// Wallet public key (hex), unique
    pub pub_key: String,

    /// Ledger balance, never negative
    pub balance: Amount,

    /// Portion of `balance` held for in-flight withdrawals
    pub reserved: Amount,

    /// Single upward referral edge
    pub referrer_id: Option<UserId>,

    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Balance that can be debited right now
    pub fn available(&self) -> Amount {
        self.balance - self.reserved
    }
}

/// Parameters for user creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUser {
    /// Wallet public key
    pub pub_key: String,

    /// Referring user, if any
    pub referrer_id: Option<UserId>,

    /// Caller-chosen id; a random one is allocated when absent
    pub id: Option<UserId>,
}

/// Open investment position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Investment {
    /// Investment ID
    pub id: InvestmentId,

    /// Owner
    pub user_id: UserId,

    /// Investment type name (low / medium / high)
    pub kind: String,

    /// Principal debited from balance at open
    pub principal: Amount,

    /// Open time
    pub created_at: DateTime<Utc>,

    /// Yield has been settled up to this instant
    pub yield_settled_at: DateTime<Utc>,
}

/// Immutable record of a referral payout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralEarning {
    /// Earning ID
    pub id: EarningId,

    /// User credited
    pub referrer_id: UserId,

    /// User whose profit triggered the payout
    pub referred_id: UserId,

    /// Amount credited
    pub amount: Amount,

    /// Hop distance, 1..=3
    pub level: u8,

    /// Payout time
    pub created_at: DateTime<Utc>,
}

/// Deposit request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// Waiting for an on-chain payment
    Pending,
    /// Credited (terminal)
    Completed,
    /// Abandoned (terminal)
    Failed,
}

impl DepositStatus {
    /// Status label
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Completed => "completed",
            DepositStatus::Failed => "failed",
        }
    }
}

/// Deposit intent awaiting reconciliation against the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequest {
    /// Deposit ID
    pub id: DepositId,

    /// Owner
    pub user_id: UserId,

    /// Expected amount
    pub amount: Amount,

    /// Unique token the payer attaches to the transfer
    pub memo: String,

    /// Current status
    pub status: DepositStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// Withdrawal state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    /// Accepted, nothing held yet
    Requested,
    /// Amount held against the balance
    Reserved,
    /// Outbound transfer in flight
    Transferring,
    /// Transfer confirmed, balance debited (terminal)
    Settled,
    /// Transfer failed, reservation released (terminal)
    TransferFailed,
}

impl WithdrawalStatus {
    /// Status label
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Requested => "requested",
            WithdrawalStatus::Reserved => "reserved",
            WithdrawalStatus::Transferring => "transferring",
            WithdrawalStatus::Settled => "settled",
            WithdrawalStatus::TransferFailed => "transfer_failed",
        }
    }

    /// Check if withdrawal is in terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Settled | WithdrawalStatus::TransferFailed
        )
    }

    /// Whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: WithdrawalStatus) -> bool {
        use WithdrawalStatus::*;
        matches!(
            (self, next),
            (Requested, Reserved)
                | (Reserved, Transferring)
                | (Reserved, TransferFailed)
                | (Transferring, Settled)
                | (Transferring, TransferFailed)
        )
    }
}

/// Outbound withdrawal record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    /// Withdrawal ID
    pub id: WithdrawalId,

    /// Owner
    pub user_id: UserId,

    /// Amount to send
    pub amount: Amount,

    /// Current status
    pub status: WithdrawalStatus,

    /// Destination address
    pub destination: Option<String>,

    /// External transaction hash, set when settled
    pub tx_hash: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// Audit operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Investment opened
    InvestmentCreated,
    /// Investment closed
    InvestmentClosed,
    /// Weekly yield credited
    YieldAccrued,
    /// Deposit credited
    Deposit,
    /// Withdrawal settled
    Withdrawal,
    /// Referral payout credited
    ReferralEarning,
}

impl OperationType {
    /// Wire label
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::InvestmentCreated => "investment_created",
            OperationType::InvestmentClosed => "investment_closed",
            OperationType::YieldAccrued => "yield_accrued",
            OperationType::Deposit => "deposit",
            OperationType::Withdrawal => "withdrawal",
            OperationType::ReferralEarning => "referral_earning",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation ID (monotonic)
    pub id: OperationId,

    /// Acting user
    pub user_id: UserId,

    /// Operation type
    #[serde(rename = "type")]
    pub op_type: OperationType,

    /// Amount moved
    pub amount: Amount,

    /// Human-readable summary
    pub description: String,

    /// Free-form structured details
    pub metadata: serde_json::Value,

    /// Append time
    pub created_at: DateTime<Utc>,
}

/// Operation to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    /// Acting user
    pub user_id: UserId,
    /// Operation type
    pub op_type: OperationType,
    /// Amount moved
    pub amount: Amount,
    /// Human-readable summary
    pub description: String,
    /// Structured details
    pub metadata: serde_json::Value,
}

/// One page of a user's operation history
#[derive(Debug, Clone, Serialize)]
pub struct OperationPage {
    /// Operations, newest first
    pub operations: Vec<Operation>,
    /// Total operations for the user
    pub total: u64,
    /// 1-based page number
    pub page: u32,
    /// Page size
    pub page_size: u32,
}

/// A user found `level` hops below a referrer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Downline {
    /// Referred user
    pub user_id: UserId,
    /// Hop distance from the referrer
    pub level: u8,
}
