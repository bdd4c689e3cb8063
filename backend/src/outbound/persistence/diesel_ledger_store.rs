//! PostgreSQL-backed `LedgerStore` implementation using Diesel.
//!
//! Every mutating method runs in a single transaction that locks the user
//! row (`FOR UPDATE`) before touching lots, so ledger operations per user
//! serialize exactly as the port contract requires. The partial unique index
//! on `(job_id) where kind='debit' and status='applied'` backs the
//! unique-open-debit invariant even across racing transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::debug;
use uuid::Uuid;

use crate::domain::credits::{
    plan_debit, plan_refund, CreditAllocation, CreditTransaction, TransactionKind,
    TransactionStatus,
};
use crate::domain::ids::{JobId, TxId, UserId};
use crate::domain::ports::{
    DebitOutcome, DebitRequest, ExpiredLot, GrantRequest, LedgerSnapshot, LedgerStore,
    LedgerStoreError, RefundOutcome,
};

use super::models::{
    CreditAllocationRow, CreditLotRow, CreditTransactionRow, NewCreditLotRow,
    NewCreditTransactionRow, NewUserRow, RowDecodeError,
};
use super::pool::{DbPool, PoolError};
use super::schema::{credit_allocations, credit_lots, credit_transactions, users};

/// Diesel-backed implementation of the `LedgerStore` port.
#[derive(Clone)]
pub struct DieselLedgerStore {
    pool: DbPool,
}

impl DieselLedgerStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn map_pool_error(error: PoolError) -> LedgerStoreError {
    match error {
        PoolError::Checkout { message } | PoolError::Build { message } => {
            LedgerStoreError::connection(message)
        }
    }
}

fn map_diesel_error(error: diesel::result::Error) -> LedgerStoreError {
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    match &error {
        DieselError::DatabaseError(kind, info) => {
            debug!(?kind, message = info.message(), "diesel operation failed");
        }
        _ => debug!(
            error_type = %std::any::type_name_of_val(&error),
            "diesel operation failed"
        ),
    }

    match error {
        DieselError::NotFound => LedgerStoreError::not_found("record not found"),
        DieselError::DatabaseError(kind, _) => match kind {
            DatabaseErrorKind::UniqueViolation | DatabaseErrorKind::SerializationFailure => {
                LedgerStoreError::conflict("concurrent ledger write detected")
            }
            DatabaseErrorKind::ClosedConnection => {
                LedgerStoreError::connection("database connection error")
            }
            _ => LedgerStoreError::query("database error"),
        },
        _ => LedgerStoreError::query("database error"),
    }
}

fn map_decode_error(error: RowDecodeError) -> LedgerStoreError {
    LedgerStoreError::query(error.to_string())
}

/// Errors threaded through ledger transactions: Diesel failures roll the
/// transaction back, domain failures carry structured outcomes out.
#[derive(Debug)]
enum LedgerTxError {
    Diesel(diesel::result::Error),
    Domain(LedgerStoreError),
}

impl From<diesel::result::Error> for LedgerTxError {
    fn from(error: diesel::result::Error) -> Self {
        Self::Diesel(error)
    }
}

impl From<RowDecodeError> for LedgerTxError {
    fn from(error: RowDecodeError) -> Self {
        Self::Domain(map_decode_error(error))
    }
}

fn unwrap_tx_error(error: LedgerTxError) -> LedgerStoreError {
    match error {
        LedgerTxError::Diesel(error) => map_diesel_error(error),
        LedgerTxError::Domain(error) => error,
    }
}

async fn lock_user(
    conn: &mut diesel_async::AsyncPgConnection,
    user_id: Uuid,
) -> Result<Option<i64>, diesel::result::Error> {
    users::table
        .find(user_id)
        .for_update()
        .select(users::credits_balance_cached)
        .first::<i64>(conn)
        .await
        .optional()
}

async fn applied_debit_row(
    conn: &mut diesel_async::AsyncPgConnection,
    job_id: Uuid,
) -> Result<Option<CreditTransactionRow>, diesel::result::Error> {
    credit_transactions::table
        .filter(credit_transactions::job_id.eq(job_id))
        .filter(credit_transactions::kind.eq(TransactionKind::Debit.as_str()))
        .filter(credit_transactions::status.eq(TransactionStatus::Applied.as_str()))
        .select(CreditTransactionRow::as_select())
        .first(conn)
        .await
        .optional()
}

#[async_trait]
impl LedgerStore for DieselLedgerStore {
    async fn ensure_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let inserted = diesel::insert_into(users::table)
            .values(&NewUserRow {
                id: *user_id.as_uuid(),
                credits_balance_cached: 0,
                created_at: now,
                updated_at: now,
            })
            .on_conflict(users::id)
            .do_nothing()
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(inserted > 0)
    }

    async fn grant(
        &self,
        request: GrantRequest,
        now: DateTime<Utc>,
    ) -> Result<(crate::domain::credits::CreditLot, CreditTransaction), LedgerStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let user_id = *request.user_id.as_uuid();

        conn.transaction::<_, LedgerTxError, _>(|conn| {
            async move {
                if lock_user(conn, user_id).await?.is_none() {
                    diesel::insert_into(users::table)
                        .values(&NewUserRow {
                            id: user_id,
                            credits_balance_cached: 0,
                            created_at: now,
                            updated_at: now,
                        })
                        .execute(conn)
                        .await?;
                }

                let lot_row = NewCreditLotRow {
                    id: Uuid::new_v4(),
                    user_id,
                    source: request.source.as_str(),
                    amount_granted: request.amount,
                    amount_remaining: request.amount,
                    expires_at: request.expires_at,
                    created_at: now,
                    updated_at: now,
                };
                let lot: CreditLotRow = diesel::insert_into(credit_lots::table)
                    .values(&lot_row)
                    .get_result(conn)
                    .await?;

                let tx_row = NewCreditTransactionRow {
                    id: Uuid::new_v4(),
                    user_id,
                    amount: request.amount,
                    kind: TransactionKind::Credit.as_str(),
                    status: TransactionStatus::Applied.as_str(),
                    reason: &request.reason,
                    job_id: None,
                    story_id: None,
                    metadata: request.metadata.as_ref(),
                    created_at: now,
                };
                let tx: CreditTransactionRow = diesel::insert_into(credit_transactions::table)
                    .values(&tx_row)
                    .get_result(conn)
                    .await?;

                diesel::insert_into(credit_allocations::table)
                    .values(&CreditAllocationRow {
                        tx_id: tx.id,
                        lot_id: lot.id,
                        amount: request.amount,
                    })
                    .execute(conn)
                    .await?;

                diesel::update(users::table.find(user_id))
                    .set((
                        users::credits_balance_cached
                            .eq(users::credits_balance_cached + request.amount),
                        users::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                Ok((lot.into_domain()?, tx.into_domain()?))
            }
            .scope_boxed()
        })
        .await
        .map_err(unwrap_tx_error)
    }

    async fn debit(
        &self,
        request: DebitRequest,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome, LedgerStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let user_id = *request.user_id.as_uuid();
        let job_id = *request.job_id.as_uuid();
        let priority = request.priority.clone();

        let result = conn
            .transaction::<_, LedgerTxError, _>(|conn| {
                async move {
                    if let Some(existing) = applied_debit_row(conn, job_id).await? {
                        return Ok(DebitOutcome::AlreadyCharged(existing.into_domain()?));
                    }

                    let cached = lock_user(conn, user_id).await?;
                    if cached.is_none() {
                        return Err(LedgerTxError::Domain(LedgerStoreError::Insufficient {
                            required: request.amount,
                            available: 0,
                        }));
                    }

                    let lot_rows: Vec<CreditLotRow> = credit_lots::table
                        .filter(credit_lots::user_id.eq(user_id))
                        .filter(credit_lots::amount_remaining.gt(0))
                        .filter(
                            credit_lots::expires_at
                                .is_null()
                                .or(credit_lots::expires_at.gt(now)),
                        )
                        .for_update()
                        .select(CreditLotRow::as_select())
                        .load(conn)
                        .await?;
                    let lots = lot_rows
                        .into_iter()
                        .map(CreditLotRow::into_domain)
                        .collect::<Result<Vec<_>, _>>()?;

                    let plan = plan_debit(&lots, request.amount, &priority, now).map_err(
                        |short| {
                            LedgerTxError::Domain(LedgerStoreError::Insufficient {
                                required: short.required,
                                available: short.available,
                            })
                        },
                    )?;

                    let tx_row = NewCreditTransactionRow {
                        id: Uuid::new_v4(),
                        user_id,
                        amount: -request.amount,
                        kind: TransactionKind::Debit.as_str(),
                        status: TransactionStatus::Applied.as_str(),
                        reason: &request.reason,
                        job_id: Some(job_id),
                        story_id: request.story_id.map(|id| *id.as_uuid()),
                        metadata: None,
                        created_at: now,
                    };
                    let tx: CreditTransactionRow = diesel::insert_into(credit_transactions::table)
                        .values(&tx_row)
                        .get_result(conn)
                        .await?;

                    for draw in &plan.draws {
                        diesel::update(credit_lots::table.find(*draw.lot_id.as_uuid()))
                            .set((
                                credit_lots::amount_remaining
                                    .eq(credit_lots::amount_remaining - draw.amount),
                                credit_lots::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?;
                        diesel::insert_into(credit_allocations::table)
                            .values(&CreditAllocationRow {
                                tx_id: tx.id,
                                lot_id: *draw.lot_id.as_uuid(),
                                amount: -draw.amount,
                            })
                            .execute(conn)
                            .await?;
                    }

                    diesel::update(users::table.find(user_id))
                        .set((
                            users::credits_balance_cached
                                .eq(users::credits_balance_cached - request.amount),
                            users::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;

                    Ok(DebitOutcome::Charged(tx.into_domain()?))
                }
                .scope_boxed()
            })
            .await;

        match result {
            Ok(outcome) => Ok(outcome),
            // A racing debit hit the partial unique index first; its
            // transaction is the one the caller should observe.
            Err(LedgerTxError::Diesel(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            ))) => {
                let mut conn = self.pool.get().await.map_err(map_pool_error)?;
                let existing = applied_debit_row(&mut conn, job_id)
                    .await
                    .map_err(map_diesel_error)?
                    .ok_or_else(|| {
                        LedgerStoreError::conflict("debit conflicted but no applied debit found")
                    })?;
                Ok(DebitOutcome::AlreadyCharged(
                    existing.into_domain().map_err(map_decode_error)?,
                ))
            }
            Err(error) => Err(unwrap_tx_error(error)),
        }
    }

    async fn refund_by_job(
        &self,
        job_id: JobId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, LedgerStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let job_id = *job_id.as_uuid();
        let reason = reason.to_string();

        conn.transaction::<_, LedgerTxError, _>(|conn| {
            async move {
                let Some(debit) = applied_debit_row(conn, job_id).await? else {
                    return Ok(RefundOutcome::NoOp);
                };
                let debit = debit.into_domain()?;
                lock_user(conn, *debit.user_id.as_uuid()).await?;

                // Reload under the user lock: a concurrent refund may have
                // won between the lookup and the lock.
                let Some(debit_row) = applied_debit_row(conn, job_id).await? else {
                    return Ok(RefundOutcome::NoOp);
                };
                let debit = debit_row.into_domain()?;

                let allocation_rows: Vec<CreditAllocationRow> = credit_allocations::table
                    .filter(credit_allocations::tx_id.eq(*debit.id.as_uuid()))
                    .select(CreditAllocationRow::as_select())
                    .load(conn)
                    .await?;
                let allocations: Vec<CreditAllocation> = allocation_rows
                    .into_iter()
                    .map(CreditAllocation::from)
                    .collect();

                let to_refund = -debit.amount;
                let draws = plan_refund(&allocations, to_refund);

                let refund_row = NewCreditTransactionRow {
                    id: Uuid::new_v4(),
                    user_id: *debit.user_id.as_uuid(),
                    amount: to_refund,
                    kind: TransactionKind::Refund.as_str(),
                    status: TransactionStatus::Applied.as_str(),
                    reason: &reason,
                    job_id: Some(job_id),
                    story_id: debit.story_id.map(|id| *id.as_uuid()),
                    metadata: None,
                    created_at: now,
                };
                let refund: CreditTransactionRow = diesel::insert_into(credit_transactions::table)
                    .values(&refund_row)
                    .get_result(conn)
                    .await?;

                for draw in &draws {
                    diesel::update(credit_lots::table.find(*draw.lot_id.as_uuid()))
                        .set((
                            credit_lots::amount_remaining
                                .eq(credit_lots::amount_remaining + draw.amount),
                            credit_lots::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;
                    diesel::insert_into(credit_allocations::table)
                        .values(&CreditAllocationRow {
                            tx_id: refund.id,
                            lot_id: *draw.lot_id.as_uuid(),
                            amount: draw.amount,
                        })
                        .execute(conn)
                        .await?;
                }

                diesel::update(credit_transactions::table.find(*debit.id.as_uuid()))
                    .set(credit_transactions::status.eq(TransactionStatus::Refunded.as_str()))
                    .execute(conn)
                    .await?;

                diesel::update(users::table.find(*debit.user_id.as_uuid()))
                    .set((
                        users::credits_balance_cached
                            .eq(users::credits_balance_cached + to_refund),
                        users::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                Ok(RefundOutcome::Refunded(refund.into_domain()?))
            }
            .scope_boxed()
        })
        .await
        .map_err(unwrap_tx_error)
    }

    async fn expire_due_lots(
        &self,
        user_id: Option<UserId>,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<ExpiredLot>, LedgerStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let user_filter = user_id.map(|id| *id.as_uuid());

        conn.transaction::<_, LedgerTxError, _>(|conn| {
            async move {
                // Boxed queries cannot carry a locking clause, so the user
                // filter is two explicit branches.
                let due: Vec<CreditLotRow> = match user_filter {
                    Some(user_id) => {
                        credit_lots::table
                            .filter(credit_lots::user_id.eq(user_id))
                            .filter(credit_lots::amount_remaining.gt(0))
                            .filter(credit_lots::expires_at.le(as_of))
                            .for_update()
                            .select(CreditLotRow::as_select())
                            .load(conn)
                            .await?
                    }
                    None => {
                        credit_lots::table
                            .filter(credit_lots::amount_remaining.gt(0))
                            .filter(credit_lots::expires_at.le(as_of))
                            .for_update()
                            .select(CreditLotRow::as_select())
                            .load(conn)
                            .await?
                    }
                };

                let mut expired = Vec::with_capacity(due.len());
                for lot in due {
                    let lost = lot.amount_remaining;
                    diesel::update(credit_lots::table.find(lot.id))
                        .set((
                            credit_lots::amount_remaining.eq(0),
                            credit_lots::updated_at.eq(as_of),
                        ))
                        .execute(conn)
                        .await?;

                    let tx_row = NewCreditTransactionRow {
                        id: Uuid::new_v4(),
                        user_id: lot.user_id,
                        amount: -lost,
                        kind: TransactionKind::Expire.as_str(),
                        status: TransactionStatus::Applied.as_str(),
                        reason: "lot_expired",
                        job_id: None,
                        story_id: None,
                        metadata: None,
                        created_at: as_of,
                    };
                    let tx: CreditTransactionRow = diesel::insert_into(credit_transactions::table)
                        .values(&tx_row)
                        .get_result(conn)
                        .await?;
                    diesel::insert_into(credit_allocations::table)
                        .values(&CreditAllocationRow {
                            tx_id: tx.id,
                            lot_id: lot.id,
                            amount: -lost,
                        })
                        .execute(conn)
                        .await?;
                    diesel::update(users::table.find(lot.user_id))
                        .set((
                            users::credits_balance_cached
                                .eq(users::credits_balance_cached - lost),
                            users::updated_at.eq(as_of),
                        ))
                        .execute(conn)
                        .await?;

                    expired.push(ExpiredLot {
                        lot_id: crate::domain::ids::LotId::from_uuid(lot.id),
                        user_id: UserId::from_uuid(lot.user_id),
                        amount_expired: lost,
                    });
                }
                Ok(expired)
            }
            .scope_boxed()
        })
        .await
        .map_err(unwrap_tx_error)
    }

    async fn snapshot(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<LedgerSnapshot, LedgerStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let user_uuid = *user_id.as_uuid();

        let cached_balance: i64 = users::table
            .find(user_uuid)
            .select(users::credits_balance_cached)
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?
            .unwrap_or(0);

        let lot_rows: Vec<CreditLotRow> = credit_lots::table
            .filter(credit_lots::user_id.eq(user_uuid))
            .order(credit_lots::created_at.asc())
            .select(CreditLotRow::as_select())
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        let lots = lot_rows
            .into_iter()
            .map(CreditLotRow::into_domain)
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_decode_error)?;

        let active_balance = lots
            .iter()
            .filter(|lot| !lot.is_expired(now))
            .map(|lot| lot.amount_remaining)
            .sum();

        Ok(LedgerSnapshot {
            active_balance,
            cached_balance,
            lots,
        })
    }

    async fn reconcile_cached_balance(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<i64, LedgerStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let user_uuid = *user_id.as_uuid();

        conn.transaction::<_, LedgerTxError, _>(|conn| {
            async move {
                lock_user(conn, user_uuid).await?;
                let active: Option<i64> = credit_lots::table
                    .filter(credit_lots::user_id.eq(user_uuid))
                    .filter(
                        credit_lots::expires_at
                            .is_null()
                            .or(credit_lots::expires_at.gt(now)),
                    )
                    .select(diesel::dsl::sql::<
                        diesel::sql_types::Nullable<diesel::sql_types::BigInt>,
                    >("CAST(SUM(amount_remaining) AS BIGINT)"))
                    .first::<Option<i64>>(conn)
                    .await?;
                let active = active.unwrap_or(0);
                diesel::update(users::table.find(user_uuid))
                    .set((
                        users::credits_balance_cached.eq(active),
                        users::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;
                Ok(active)
            }
            .scope_boxed()
        })
        .await
        .map_err(unwrap_tx_error)
    }

    async fn history(
        &self,
        user_id: UserId,
        kinds: Option<Vec<TransactionKind>>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CreditTransaction>, LedgerStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;

        let mut query = credit_transactions::table
            .filter(credit_transactions::user_id.eq(*user_id.as_uuid()))
            .order(credit_transactions::created_at.desc())
            .limit(i64::from(limit))
            .offset(i64::from(offset))
            .select(CreditTransactionRow::as_select())
            .into_boxed();
        if let Some(kinds) = kinds {
            let names: Vec<&'static str> = kinds.iter().map(TransactionKind::as_str).collect();
            query = query.filter(credit_transactions::kind.eq_any(names));
        }

        let rows: Vec<CreditTransactionRow> =
            query.load(&mut conn).await.map_err(map_diesel_error)?;
        rows.into_iter()
            .map(|row| row.into_domain().map_err(map_decode_error))
            .collect()
    }

    async fn allocations_for(
        &self,
        tx_id: TxId,
    ) -> Result<Vec<CreditAllocation>, LedgerStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let rows: Vec<CreditAllocationRow> = credit_allocations::table
            .filter(credit_allocations::tx_id.eq(*tx_id.as_uuid()))
            .select(CreditAllocationRow::as_select())
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(rows.into_iter().map(CreditAllocation::from).collect())
    }

    async fn users_without_monthly_lot_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UserId>, LedgerStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let granted = credit_lots::table
            .filter(credit_lots::source.eq("monthly"))
            .filter(credit_lots::created_at.ge(since))
            .select(credit_lots::user_id);
        let ids: Vec<Uuid> = users::table
            .filter(users::id.ne_all(granted))
            .select(users::id)
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(ids.into_iter().map(UserId::from_uuid).collect())
    }
}
