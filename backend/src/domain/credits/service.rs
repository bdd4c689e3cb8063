//! Credit ledger domain service.
//!
//! Validates arguments, delegates atomic work to the [`LedgerStore`] port,
//! and owns the cached-balance reconciliation and the monthly grant sweep.

use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use mockable::Clock;
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::credits::{
    required_credits, CreditLot, CreditSource, CreditTransaction, SourcePriority, TransactionKind,
};
use crate::domain::error::Error;
use crate::domain::ids::{JobId, StoryId, UserId};
use crate::domain::ports::{
    DebitOutcome, DebitRequest, ExpiredLot, GrantRequest, LedgerStore, LedgerStoreError,
    RefundOutcome,
};

/// Ledger configuration threaded in from [`crate::domain::AppConfig`].
#[derive(Debug, Clone)]
pub struct CreditsConfig {
    pub unit_size: u32,
    pub unit_label: String,
    pub priority: SourcePriority,
    pub initial_credits: i64,
    pub monthly_credits: i64,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            unit_size: 1000,
            unit_label: "Story Points".to_string(),
            priority: SourcePriority::default(),
            initial_credits: 0,
            monthly_credits: 0,
        }
    }
}

/// Expected failures of ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("insufficient credits: need {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger internal error: {0}")]
    Internal(String),
}

impl From<LedgerStoreError> for LedgerError {
    fn from(error: LedgerStoreError) -> Self {
        match error {
            LedgerStoreError::Insufficient {
                required,
                available,
            } => Self::InsufficientCredits {
                required,
                available,
            },
            LedgerStoreError::NotFound { message } => Self::NotFound(message),
            LedgerStoreError::Conflict { message } => Self::Conflict(message),
            LedgerStoreError::Connection { message } => Self::Unavailable(message),
            LedgerStoreError::Query { message } => Self::Internal(message),
        }
    }
}

impl From<LedgerError> for Error {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::InvalidArgument(message) => Error::invalid_request(message),
            LedgerError::InsufficientCredits {
                required,
                available,
            } => Error::insufficient_credits("active balance cannot cover this synthesis")
                .with_details(serde_json::json!({
                    "required": required,
                    "available": available,
                })),
            LedgerError::NotFound(message) => Error::not_found(message),
            LedgerError::Conflict(message) => Error::conflict(message),
            LedgerError::Unavailable(message) => Error::service_unavailable(message),
            LedgerError::Internal(message) => Error::internal(message),
        }
    }
}

/// Paging arguments for transaction history.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    pub offset: u32,
    pub kinds: Option<Vec<TransactionKind>>,
}

const HISTORY_DEFAULT_LIMIT: u32 = 20;
const HISTORY_MAX_LIMIT: u32 = 100;

/// A user's balances as reported to clients.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditSummary {
    pub active_balance: i64,
    pub cached_balance: i64,
    /// Set when the cached balance disagreed with the active balance and was
    /// repaired during this read.
    pub reconciled: bool,
    pub lots: Vec<CreditLot>,
}

/// The credit ledger service.
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: CreditsConfig,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, config: CreditsConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn unit_size(&self) -> u32 {
        self.config.unit_size
    }

    pub fn unit_label(&self) -> &str {
        &self.config.unit_label
    }

    /// Credits required to synthesize `text` under the configured unit size.
    pub fn required_credits(&self, text: &str) -> i64 {
        required_credits(text, self.config.unit_size)
    }

    /// Create a lot for `user_id`.
    pub async fn grant(
        &self,
        user_id: UserId,
        amount: i64,
        source: CreditSource,
        expires_at: Option<DateTime<Utc>>,
        reason: impl Into<String>,
        metadata: Option<Value>,
    ) -> Result<CreditLot, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidArgument(
                "grant amount must be positive".to_string(),
            ));
        }
        let now = self.clock.utc();
        if expires_at.is_some_and(|at| at <= now) {
            return Err(LedgerError::InvalidArgument(
                "grant expiry must lie in the future".to_string(),
            ));
        }

        self.store.ensure_user(user_id, now).await?;
        let (lot, _tx) = self
            .store
            .grant(
                GrantRequest {
                    user_id,
                    amount,
                    source,
                    expires_at,
                    reason: reason.into(),
                    metadata,
                },
                now,
            )
            .await?;
        info!(%user_id, amount, source = %source, "credits granted");
        Ok(lot)
    }

    /// Provision a user row, granting the configured initial credits exactly
    /// once on first sight.
    pub async fn bootstrap_user(&self, user_id: UserId) -> Result<bool, LedgerError> {
        let now = self.clock.utc();
        let created = self.store.ensure_user(user_id, now).await?;
        if created && self.config.initial_credits > 0 {
            self.store
                .grant(
                    GrantRequest {
                        user_id,
                        amount: self.config.initial_credits,
                        source: CreditSource::Free,
                        expires_at: None,
                        reason: "initial_grant".to_string(),
                        metadata: None,
                    },
                    now,
                )
                .await?;
            info!(%user_id, amount = self.config.initial_credits, "initial credits granted");
        }
        Ok(created)
    }

    /// Atomically consume `amount` credits against `job_id`.
    ///
    /// Retries are safe: a second call for the same job observes the original
    /// applied debit instead of charging again.
    pub async fn debit(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        story_id: Option<StoryId>,
        reason: impl Into<String>,
    ) -> Result<DebitOutcome, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidArgument(
                "debit amount must be positive".to_string(),
            ));
        }
        let outcome = self
            .store
            .debit(
                DebitRequest {
                    user_id,
                    amount,
                    job_id,
                    story_id,
                    reason: reason.into(),
                    priority: self.config.priority.clone(),
                },
                self.clock.utc(),
            )
            .await?;
        match &outcome {
            DebitOutcome::Charged(tx) => {
                info!(%user_id, %job_id, amount, tx_id = %tx.id, "credits debited");
            }
            DebitOutcome::AlreadyCharged(tx) => {
                info!(%user_id, %job_id, tx_id = %tx.id, "debit replayed idempotently");
            }
        }
        Ok(outcome)
    }

    /// Refund the applied debit for `job_id`, if any. Idempotent.
    pub async fn refund_by_job(
        &self,
        job_id: JobId,
        reason: impl Into<String>,
    ) -> Result<RefundOutcome, LedgerError> {
        let outcome = self
            .store
            .refund_by_job(job_id, &reason.into(), self.clock.utc())
            .await?;
        if let RefundOutcome::Refunded(tx) = &outcome {
            info!(%job_id, amount = tx.amount, tx_id = %tx.id, "debit refunded");
        }
        Ok(outcome)
    }

    /// Zero all lots due at `as_of` (defaults to now), one expire transaction
    /// per lot.
    pub async fn expire_now(
        &self,
        user_id: Option<UserId>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExpiredLot>, LedgerError> {
        let as_of = as_of.unwrap_or_else(|| self.clock.utc());
        let expired = self.store.expire_due_lots(user_id, as_of).await?;
        for lot in &expired {
            info!(
                user_id = %lot.user_id,
                lot_id = %lot.lot_id,
                amount = lot.amount_expired,
                "credit lot expired"
            );
        }
        Ok(expired)
    }

    /// Balances and lots for one user, repairing the cached balance when it
    /// has drifted from the active balance.
    pub async fn summary(&self, user_id: UserId) -> Result<CreditSummary, LedgerError> {
        let now = self.clock.utc();
        let snapshot = self.store.snapshot(user_id, now).await?;
        let mut cached = snapshot.cached_balance;
        let reconciled = cached != snapshot.active_balance;
        if reconciled {
            warn!(
                %user_id,
                cached,
                active = snapshot.active_balance,
                "cached balance drifted; reconciling"
            );
            cached = self.store.reconcile_cached_balance(user_id, now).await?;
        }
        Ok(CreditSummary {
            active_balance: snapshot.active_balance,
            cached_balance: cached,
            reconciled,
            lots: snapshot.lots,
        })
    }

    /// Page transactions, newest first. Limits clamp to `[1, 100]`.
    pub async fn history(
        &self,
        user_id: UserId,
        query: HistoryQuery,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        let limit = query
            .limit
            .unwrap_or(HISTORY_DEFAULT_LIMIT)
            .clamp(1, HISTORY_MAX_LIMIT);
        Ok(self
            .store
            .history(user_id, query.kinds, limit, query.offset)
            .await?)
    }

    /// Grant the configured monthly credits to every user lacking a monthly
    /// lot this calendar month. Returns the number of users granted.
    pub async fn grant_monthly(&self) -> Result<u32, LedgerError> {
        if self.config.monthly_credits <= 0 {
            return Ok(0);
        }
        let now = self.clock.utc();
        let start_of_month = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .ok_or_else(|| LedgerError::Internal("month start out of range".to_string()))?;

        let candidates = self
            .store
            .users_without_monthly_lot_since(start_of_month)
            .await?;
        let mut granted = 0_u32;
        for user_id in candidates {
            match self
                .store
                .grant(
                    GrantRequest {
                        user_id,
                        amount: self.config.monthly_credits,
                        source: CreditSource::Monthly,
                        expires_at: None,
                        reason: "monthly_grant".to_string(),
                        metadata: None,
                    },
                    now,
                )
                .await
            {
                Ok(_) => granted += 1,
                Err(error) => {
                    warn!(%user_id, %error, "monthly grant failed for user");
                }
            }
        }
        info!(granted, "monthly credit sweep complete");
        Ok(granted)
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
