//! Credit ledger domain: lots, transactions, allocations, and the ledger
//! service.
//!
//! Credits are abstract units. Every balance-affecting operation writes a
//! transaction row plus per-lot allocation rows, so the ledger can always
//! answer "which lots did this charge draw from".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::domain::ids::{JobId, LotId, StoryId, TxId, UserId};

mod allocation;
mod calculator;
mod service;

pub use allocation::{plan_debit, plan_refund, DebitPlan, LotDraw, ShortBalance};
pub use calculator::required_credits;
pub use service::{CreditLedger, CreditSummary, CreditsConfig, HistoryQuery, LedgerError};

/// Origin of a credit lot. Determines consumption priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CreditSource {
    Event,
    Monthly,
    Referral,
    AddOn,
    Free,
}

impl CreditSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Monthly => "monthly",
            Self::Referral => "referral",
            Self::AddOn => "add_on",
            Self::Free => "free",
        }
    }

    /// All sources in declaration order.
    pub const ALL: [CreditSource; 5] = [
        Self::Event,
        Self::Monthly,
        Self::Referral,
        Self::AddOn,
        Self::Free,
    ];
}

impl fmt::Display for CreditSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditSource {
    type Err = UnknownCreditSource;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "event" => Ok(Self::Event),
            "monthly" => Ok(Self::Monthly),
            "referral" => Ok(Self::Referral),
            "add_on" => Ok(Self::AddOn),
            "free" => Ok(Self::Free),
            other => Err(UnknownCreditSource {
                value: other.to_string(),
            }),
        }
    }
}

/// Raised when parsing an unrecognized credit source name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown credit source: {value}")]
pub struct UnknownCreditSource {
    pub value: String,
}

/// Configured consumption order over credit sources.
///
/// Earlier sources are consumed first. Sources absent from the configured
/// list rank after every listed source, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePriority(Vec<CreditSource>);

impl SourcePriority {
    pub fn new(order: Vec<CreditSource>) -> Self {
        let mut seen = Vec::with_capacity(order.len());
        for source in order {
            if !seen.contains(&source) {
                seen.push(source);
            }
        }
        Self(seen)
    }

    /// Parse a comma-separated priority list, e.g. `event,monthly,free`.
    pub fn parse(raw: &str) -> Result<Self, UnknownCreditSource> {
        let mut order = Vec::new();
        for item in raw.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            order.push(item.parse::<CreditSource>()?);
        }
        Ok(Self::new(order))
    }

    /// Rank of a source; lower ranks are consumed first.
    pub fn rank(&self, source: CreditSource) -> usize {
        self.0
            .iter()
            .position(|candidate| *candidate == source)
            .unwrap_or_else(|| {
                let offset = CreditSource::ALL
                    .iter()
                    .position(|candidate| *candidate == source)
                    .unwrap_or(CreditSource::ALL.len());
                self.0.len() + offset
            })
    }

    pub fn as_slice(&self) -> &[CreditSource] {
        &self.0
    }
}

impl Default for SourcePriority {
    fn default() -> Self {
        Self(CreditSource::ALL.to_vec())
    }
}

/// A pool of credits from one source with one expiration.
///
/// Rows are retained for audit after expiry or full consumption;
/// `amount_remaining` stays within `[0, amount_granted]` except where a
/// refund restores credits to an already-expired lot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CreditLot {
    pub id: LotId,
    pub user_id: UserId,
    pub source: CreditSource,
    pub amount_granted: i64,
    pub amount_remaining: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CreditLot {
    /// Whether the lot has passed its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the lot can still be drawn from.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.amount_remaining > 0 && !self.is_expired(now)
    }
}

/// Kind of a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Debit,
    Credit,
    Refund,
    Expire,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
            Self::Refund => "refund",
            Self::Expire => "expire",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "debit" => Ok(Self::Debit),
            "credit" => Ok(Self::Credit),
            "refund" => Ok(Self::Refund),
            "expire" => Ok(Self::Expire),
            other => Err(format!("unknown transaction kind: {other}")),
        }
    }
}

/// Lifecycle status of a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Applied,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Refunded => "refunded",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "applied" => Ok(Self::Applied),
            "refunded" => Ok(Self::Refunded),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

/// One ledger row. `amount` is signed: negative for debits, positive for
/// credits, refunds, and the (negative) lost amount of expirations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CreditTransaction {
    pub id: TxId,
    pub user_id: UserId,
    pub amount: i64,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub reason: String,
    pub job_id: Option<JobId>,
    pub story_id: Option<StoryId>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Mapping between a transaction and one lot it touched.
///
/// The amount carries the same sign as the parent transaction for debits and
/// the opposite sign for refunds; the sum of a transaction's allocations
/// always equals the transaction amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CreditAllocation {
    pub tx_id: TxId,
    pub lot_id: LotId,
    pub amount: i64,
}
