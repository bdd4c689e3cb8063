//! Port for ledger persistence: users, lots, transactions, allocations.
//!
//! Implementations must make every mutating method atomic with respect to a
//! single user: the user row and all touched lot rows are locked for the
//! duration of the operation, so concurrent debits for one user serialize
//! while debits for different users proceed in parallel.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::credits::{
    plan_debit, plan_refund, CreditAllocation, CreditLot, CreditSource, CreditTransaction,
    SourcePriority, TransactionKind, TransactionStatus,
};
use crate::domain::ids::{JobId, LotId, StoryId, TxId, UserId};

/// Errors raised by ledger store adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerStoreError {
    /// The active balance cannot cover the requested debit.
    #[error("insufficient credits: need {required}, available {available}")]
    Insufficient { required: i64, available: i64 },
    /// A referenced row does not exist.
    #[error("ledger row not found: {message}")]
    NotFound { message: String },
    /// A concurrent writer invalidated this operation; safe to retry.
    #[error("ledger conflict: {message}")]
    Conflict { message: String },
    /// Store connection could not be established.
    #[error("ledger store connection failed: {message}")]
    Connection { message: String },
    /// Query or mutation failed during execution.
    #[error("ledger store query failed: {message}")]
    Query { message: String },
}

impl LedgerStoreError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }
}

/// Inputs for creating one credit lot.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub user_id: UserId,
    pub amount: i64,
    pub source: CreditSource,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub metadata: Option<Value>,
}

/// Inputs for one atomic debit.
#[derive(Debug, Clone)]
pub struct DebitRequest {
    pub user_id: UserId,
    pub amount: i64,
    pub job_id: JobId,
    pub story_id: Option<StoryId>,
    pub reason: String,
    pub priority: SourcePriority,
}

/// Result of a debit attempt.
///
/// `AlreadyCharged` carries the existing applied debit for the job: the
/// unique-open-debit constraint is the idempotency key, so retries observe
/// the original transaction instead of creating a second one.
#[derive(Debug, Clone, PartialEq)]
pub enum DebitOutcome {
    Charged(CreditTransaction),
    AlreadyCharged(CreditTransaction),
}

impl DebitOutcome {
    pub fn transaction(&self) -> &CreditTransaction {
        match self {
            Self::Charged(tx) | Self::AlreadyCharged(tx) => tx,
        }
    }
}

/// Result of a refund attempt. `NoOp` means the debit was already refunded
/// or never existed.
#[derive(Debug, Clone, PartialEq)]
pub enum RefundOutcome {
    Refunded(CreditTransaction),
    NoOp,
}

/// A lot zeroed by the expiration sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredLot {
    pub lot_id: LotId,
    pub user_id: UserId,
    pub amount_expired: i64,
}

/// Balances and lots for one user at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSnapshot {
    pub active_balance: i64,
    pub cached_balance: i64,
    pub lots: Vec<CreditLot>,
}

/// Port for ledger persistence.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the user row if absent. Returns whether a row was created.
    async fn ensure_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError>;

    /// Create a lot plus its credit transaction and single allocation;
    /// update the cached balance.
    async fn grant(
        &self,
        request: GrantRequest,
        now: DateTime<Utc>,
    ) -> Result<(CreditLot, CreditTransaction), LedgerStoreError>;

    /// Consume credits across active lots in priority order, writing one
    /// debit transaction with one allocation per touched lot.
    async fn debit(
        &self,
        request: DebitRequest,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome, LedgerStoreError>;

    /// Restore the applied debit for `job_id` to the exact lots it drew
    /// from, marking the debit refunded. Idempotent.
    async fn refund_by_job(
        &self,
        job_id: JobId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, LedgerStoreError>;

    /// Zero every lot with `expires_at <= as_of`, writing one expire
    /// transaction per affected lot. `user_id` narrows the sweep to one user.
    async fn expire_due_lots(
        &self,
        user_id: Option<UserId>,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<ExpiredLot>, LedgerStoreError>;

    /// Read balances and lots without mutating anything.
    async fn snapshot(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<LedgerSnapshot, LedgerStoreError>;

    /// Set the cached balance to the active balance; returns the new value.
    async fn reconcile_cached_balance(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<i64, LedgerStoreError>;

    /// Page transactions, newest first.
    async fn history(
        &self,
        user_id: UserId,
        kinds: Option<Vec<TransactionKind>>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CreditTransaction>, LedgerStoreError>;

    /// Allocations belonging to one transaction.
    async fn allocations_for(&self, tx_id: TxId)
        -> Result<Vec<CreditAllocation>, LedgerStoreError>;

    /// Users lacking a `monthly` lot created at or after `since`.
    async fn users_without_monthly_lot_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UserId>, LedgerStoreError>;
}

#[derive(Default)]
struct LedgerState {
    users: HashMap<UserId, i64>,
    lots: Vec<CreditLot>,
    transactions: Vec<CreditTransaction>,
    allocations: Vec<CreditAllocation>,
}

/// In-memory ledger store mirroring the relational adapter's semantics.
///
/// The single mutex stands in for row locking: every operation observes and
/// mutates a consistent snapshot, which is exactly the serialization the
/// relational adapter provides per user.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<LedgerState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_balance(state: &LedgerState, user_id: UserId, now: DateTime<Utc>) -> i64 {
        state
            .lots
            .iter()
            .filter(|lot| lot.user_id == user_id && !lot.is_expired(now))
            .map(|lot| lot.amount_remaining)
            .sum()
    }

    fn applied_debit(state: &LedgerState, job_id: JobId) -> Option<CreditTransaction> {
        state
            .transactions
            .iter()
            .find(|tx| {
                tx.job_id == Some(job_id)
                    && tx.kind == TransactionKind::Debit
                    && tx.status == TransactionStatus::Applied
            })
            .cloned()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn ensure_user(
        &self,
        user_id: UserId,
        _now: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError> {
        let mut state = self.lock();
        if state.users.contains_key(&user_id) {
            return Ok(false);
        }
        state.users.insert(user_id, 0);
        Ok(true)
    }

    async fn grant(
        &self,
        request: GrantRequest,
        now: DateTime<Utc>,
    ) -> Result<(CreditLot, CreditTransaction), LedgerStoreError> {
        let mut state = self.lock();
        let lot = CreditLot {
            id: LotId::random(),
            user_id: request.user_id,
            source: request.source,
            amount_granted: request.amount,
            amount_remaining: request.amount,
            expires_at: request.expires_at,
            created_at: now,
        };
        let tx = CreditTransaction {
            id: TxId::random(),
            user_id: request.user_id,
            amount: request.amount,
            kind: TransactionKind::Credit,
            status: TransactionStatus::Applied,
            reason: request.reason,
            job_id: None,
            story_id: None,
            metadata: request.metadata,
            created_at: now,
        };
        state.allocations.push(CreditAllocation {
            tx_id: tx.id,
            lot_id: lot.id,
            amount: request.amount,
        });
        state.lots.push(lot.clone());
        state.transactions.push(tx.clone());
        *state.users.entry(request.user_id).or_insert(0) += request.amount;
        Ok((lot, tx))
    }

    async fn debit(
        &self,
        request: DebitRequest,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome, LedgerStoreError> {
        let mut state = self.lock();

        if let Some(existing) = Self::applied_debit(&state, request.job_id) {
            return Ok(DebitOutcome::AlreadyCharged(existing));
        }

        let user_lots: Vec<CreditLot> = state
            .lots
            .iter()
            .filter(|lot| lot.user_id == request.user_id)
            .cloned()
            .collect();
        let plan = plan_debit(&user_lots, request.amount, &request.priority, now).map_err(
            |short| LedgerStoreError::Insufficient {
                required: short.required,
                available: short.available,
            },
        )?;

        let tx = CreditTransaction {
            id: TxId::random(),
            user_id: request.user_id,
            amount: -request.amount,
            kind: TransactionKind::Debit,
            status: TransactionStatus::Applied,
            reason: request.reason,
            job_id: Some(request.job_id),
            story_id: request.story_id,
            metadata: None,
            created_at: now,
        };
        for draw in &plan.draws {
            let lot = state
                .lots
                .iter_mut()
                .find(|lot| lot.id == draw.lot_id)
                .ok_or_else(|| LedgerStoreError::not_found("planned lot vanished"))?;
            lot.amount_remaining -= draw.amount;
            state.allocations.push(CreditAllocation {
                tx_id: tx.id,
                lot_id: draw.lot_id,
                amount: -draw.amount,
            });
        }
        state.transactions.push(tx.clone());
        *state.users.entry(request.user_id).or_insert(0) -= request.amount;
        Ok(DebitOutcome::Charged(tx))
    }

    async fn refund_by_job(
        &self,
        job_id: JobId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, LedgerStoreError> {
        let mut state = self.lock();

        let Some(debit) = Self::applied_debit(&state, job_id) else {
            return Ok(RefundOutcome::NoOp);
        };

        let debit_allocations: Vec<CreditAllocation> = state
            .allocations
            .iter()
            .filter(|allocation| allocation.tx_id == debit.id)
            .cloned()
            .collect();
        let to_refund = -debit.amount;
        let draws = plan_refund(&debit_allocations, to_refund);

        let refund = CreditTransaction {
            id: TxId::random(),
            user_id: debit.user_id,
            amount: to_refund,
            kind: TransactionKind::Refund,
            status: TransactionStatus::Applied,
            reason: reason.to_string(),
            job_id: Some(job_id),
            story_id: debit.story_id,
            metadata: None,
            created_at: now,
        };
        for draw in &draws {
            let lot = state
                .lots
                .iter_mut()
                .find(|lot| lot.id == draw.lot_id)
                .ok_or_else(|| LedgerStoreError::not_found("refunded lot vanished"))?;
            lot.amount_remaining += draw.amount;
            state.allocations.push(CreditAllocation {
                tx_id: refund.id,
                lot_id: draw.lot_id,
                amount: draw.amount,
            });
        }
        if let Some(original) = state.transactions.iter_mut().find(|tx| tx.id == debit.id) {
            original.status = TransactionStatus::Refunded;
        }
        state.transactions.push(refund.clone());
        *state.users.entry(debit.user_id).or_insert(0) += to_refund;
        Ok(RefundOutcome::Refunded(refund))
    }

    async fn expire_due_lots(
        &self,
        user_id: Option<UserId>,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<ExpiredLot>, LedgerStoreError> {
        let mut state = self.lock();
        let mut expired = Vec::new();
        let mut postings = Vec::new();

        for lot in state.lots.iter_mut() {
            if let Some(filter) = user_id {
                if lot.user_id != filter {
                    continue;
                }
            }
            if lot.amount_remaining > 0 && lot.expires_at.is_some_and(|at| at <= as_of) {
                let lost = lot.amount_remaining;
                lot.amount_remaining = 0;
                expired.push(ExpiredLot {
                    lot_id: lot.id,
                    user_id: lot.user_id,
                    amount_expired: lost,
                });
                postings.push((lot.user_id, lot.id, lost));
            }
        }

        for (owner, lot_id, lost) in postings {
            let tx = CreditTransaction {
                id: TxId::random(),
                user_id: owner,
                amount: -lost,
                kind: TransactionKind::Expire,
                status: TransactionStatus::Applied,
                reason: "lot_expired".to_string(),
                job_id: None,
                story_id: None,
                metadata: None,
                created_at: as_of,
            };
            state.allocations.push(CreditAllocation {
                tx_id: tx.id,
                lot_id,
                amount: -lost,
            });
            state.transactions.push(tx);
            *state.users.entry(owner).or_insert(0) -= lost;
        }

        Ok(expired)
    }

    async fn snapshot(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<LedgerSnapshot, LedgerStoreError> {
        let state = self.lock();
        let mut lots: Vec<CreditLot> = state
            .lots
            .iter()
            .filter(|lot| lot.user_id == user_id)
            .cloned()
            .collect();
        lots.sort_by_key(|lot| lot.created_at);
        Ok(LedgerSnapshot {
            active_balance: Self::active_balance(&state, user_id, now),
            cached_balance: state.users.get(&user_id).copied().unwrap_or(0),
            lots,
        })
    }

    async fn reconcile_cached_balance(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<i64, LedgerStoreError> {
        let mut state = self.lock();
        let active = Self::active_balance(&state, user_id, now);
        state.users.insert(user_id, active);
        Ok(active)
    }

    async fn history(
        &self,
        user_id: UserId,
        kinds: Option<Vec<TransactionKind>>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CreditTransaction>, LedgerStoreError> {
        let state = self.lock();
        let mut rows: Vec<CreditTransaction> = state
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.user_id == user_id)
            .filter(|tx| {
                kinds
                    .as_ref()
                    .is_none_or(|wanted| wanted.contains(&tx.kind))
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn allocations_for(
        &self,
        tx_id: TxId,
    ) -> Result<Vec<CreditAllocation>, LedgerStoreError> {
        let state = self.lock();
        Ok(state
            .allocations
            .iter()
            .filter(|allocation| allocation.tx_id == tx_id)
            .cloned()
            .collect())
    }

    async fn users_without_monthly_lot_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UserId>, LedgerStoreError> {
        let state = self.lock();
        let mut users: Vec<UserId> = state
            .users
            .keys()
            .filter(|user_id| {
                !state.lots.iter().any(|lot| {
                    lot.user_id == **user_id
                        && lot.source == CreditSource::Monthly
                        && lot.created_at >= since
                })
            })
            .copied()
            .collect();
        users.sort();
        Ok(users)
    }
}
