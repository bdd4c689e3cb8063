//! PostgreSQL-backed `SlotQueue` implementation using Diesel.
//!
//! Entries order by `(enqueued_at, sequence)` so ties from a single batch
//! keep their insertion order. `pop_ready` takes rows `FOR UPDATE SKIP
//! LOCKED`, letting concurrent drainers share the queue without handing the
//! same entry to two of them.

use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::debug;
use uuid::Uuid;

use crate::domain::ids::VoiceId;
use crate::domain::ports::{QueueEntry, SlotQueue, SlotQueueError};
use crate::domain::voices::Provider;

use super::models::{NewSlotQueueEntryRow, SlotQueueEntryRow};
use super::pool::{DbPool, PoolError};
use super::schema::slot_queue_entries;

/// Diesel-backed implementation of the `SlotQueue` port.
#[derive(Clone)]
pub struct DieselSlotQueue {
    pool: DbPool,
}

impl DieselSlotQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn map_pool_error(error: PoolError) -> SlotQueueError {
    match error {
        PoolError::Checkout { message } | PoolError::Build { message } => {
            SlotQueueError::connection(message)
        }
    }
}

fn map_diesel_error(error: diesel::result::Error) -> SlotQueueError {
    debug!(error = %error, "slot queue operation failed");
    SlotQueueError::query("database error")
}

#[async_trait]
impl SlotQueue for DieselSlotQueue {
    async fn enqueue(&self, entry: QueueEntry) -> Result<u32, SlotQueueError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::insert_into(slot_queue_entries::table)
            .values(&NewSlotQueueEntryRow {
                voice_id: *entry.voice_id.as_uuid(),
                user_id: *entry.user_id.as_uuid(),
                provider: entry.provider.as_str(),
                enqueued_at: entry.enqueued_at,
                attempts: entry.attempts,
            })
            .on_conflict(slot_queue_entries::voice_id)
            .do_nothing()
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;

        self.position(entry.voice_id)
            .await?
            .ok_or_else(|| SlotQueueError::query("entry vanished right after enqueue"))
    }

    async fn peek(&self, provider: Provider, n: u32) -> Result<Vec<QueueEntry>, SlotQueueError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let rows: Vec<SlotQueueEntryRow> = slot_queue_entries::table
            .filter(slot_queue_entries::provider.eq(provider.as_str()))
            .order((
                slot_queue_entries::enqueued_at.asc(),
                slot_queue_entries::sequence.asc(),
            ))
            .limit(i64::from(n))
            .select(SlotQueueEntryRow::as_select())
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        rows.into_iter()
            .map(|row| {
                row.into_domain()
                    .map_err(|err| SlotQueueError::query(err.to_string()))
            })
            .collect()
    }

    async fn pop_ready(
        &self,
        provider: Provider,
        capacity: u32,
    ) -> Result<Vec<QueueEntry>, SlotQueueError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let provider_name = provider.as_str();

        let rows = conn
            .transaction::<Vec<SlotQueueEntryRow>, diesel::result::Error, _>(|conn| {
                async move {
                    let rows: Vec<SlotQueueEntryRow> = slot_queue_entries::table
                        .filter(slot_queue_entries::provider.eq(provider_name))
                        .order((
                            slot_queue_entries::enqueued_at.asc(),
                            slot_queue_entries::sequence.asc(),
                        ))
                        .limit(i64::from(capacity))
                        .for_update()
                        .skip_locked()
                        .select(SlotQueueEntryRow::as_select())
                        .load(conn)
                        .await?;

                    let ids: Vec<Uuid> = rows.iter().map(|row| row.voice_id).collect();
                    if !ids.is_empty() {
                        diesel::delete(
                            slot_queue_entries::table
                                .filter(slot_queue_entries::voice_id.eq_any(&ids)),
                        )
                        .execute(conn)
                        .await?;
                    }
                    Ok(rows)
                }
                .scope_boxed()
            })
            .await
            .map_err(map_diesel_error)?;

        rows.into_iter()
            .map(|row| {
                row.into_domain()
                    .map_err(|err| SlotQueueError::query(err.to_string()))
            })
            .collect()
    }

    async fn remove(&self, voice_id: VoiceId) -> Result<(), SlotQueueError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::delete(slot_queue_entries::table.find(*voice_id.as_uuid()))
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(())
    }

    async fn len(&self, provider: Provider) -> Result<u32, SlotQueueError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let count: i64 = slot_queue_entries::table
            .filter(slot_queue_entries::provider.eq(provider.as_str()))
            .count()
            .get_result(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(count.max(0) as u32)
    }

    async fn position(&self, voice_id: VoiceId) -> Result<Option<u32>, SlotQueueError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let target: Option<SlotQueueEntryRow> = slot_queue_entries::table
            .find(*voice_id.as_uuid())
            .select(SlotQueueEntryRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;
        let Some(target) = target else {
            return Ok(None);
        };

        let ahead: i64 = slot_queue_entries::table
            .filter(slot_queue_entries::provider.eq(target.provider.as_str()))
            .filter(
                slot_queue_entries::enqueued_at.lt(target.enqueued_at).or(
                    slot_queue_entries::enqueued_at
                        .eq(target.enqueued_at)
                        .and(slot_queue_entries::sequence.lt(target.sequence)),
                ),
            )
            .count()
            .get_result(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(Some(ahead.max(0) as u32 + 1))
    }
}
