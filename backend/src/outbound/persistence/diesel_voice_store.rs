//! PostgreSQL-backed `VoiceStore` implementation using Diesel.
//!
//! Guarded transitions run in a transaction that re-reads the row `FOR
//! UPDATE`, so an illegal edge can never slip past a concurrent writer. The
//! slot lock lives on the row itself (`slot_lock_expires_at`); acquisition is
//! a single conditional `UPDATE`, which makes it atomic without advisory
//! locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::debug;
use uuid::Uuid;

use crate::domain::ids::{UserId, VoiceId};
use crate::domain::ports::{NewVoice, VoiceStore, VoiceStoreError};
use crate::domain::voices::{AllocationStatus, Provider, SlotEvent, Voice};

use super::models::{NewSlotEventRow, NewVoiceRow, RowDecodeError, SlotEventRow, VoiceRow};
use super::pool::{DbPool, PoolError};
use super::schema::{slot_events, voices};

/// Diesel-backed implementation of the `VoiceStore` port.
#[derive(Clone)]
pub struct DieselVoiceStore {
    pool: DbPool,
}

impl DieselVoiceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn map_pool_error(error: PoolError) -> VoiceStoreError {
    match error {
        PoolError::Checkout { message } | PoolError::Build { message } => {
            VoiceStoreError::connection(message)
        }
    }
}

fn map_diesel_error(error: diesel::result::Error) -> VoiceStoreError {
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
        DieselError::NotFound => VoiceStoreError::not_found("voice row not found"),
        DieselError::DatabaseError(kind, _) => match kind {
            DatabaseErrorKind::SerializationFailure => {
                VoiceStoreError::conflict("concurrent voice write detected")
            }
            DatabaseErrorKind::ClosedConnection => {
                VoiceStoreError::connection("database connection error")
            }
            _ => VoiceStoreError::query("database error"),
        },
        _ => VoiceStoreError::query("database error"),
    }
}

fn map_decode_error(error: RowDecodeError) -> VoiceStoreError {
    VoiceStoreError::query(error.to_string())
}

#[derive(Debug)]
enum VoiceTxError {
    Diesel(diesel::result::Error),
    Domain(VoiceStoreError),
}

impl From<diesel::result::Error> for VoiceTxError {
    fn from(error: diesel::result::Error) -> Self {
        Self::Diesel(error)
    }
}

impl From<RowDecodeError> for VoiceTxError {
    fn from(error: RowDecodeError) -> Self {
        Self::Domain(map_decode_error(error))
    }
}

fn unwrap_tx_error(error: VoiceTxError) -> VoiceStoreError {
    match error {
        VoiceTxError::Diesel(error) => map_diesel_error(error),
        VoiceTxError::Domain(error) => error,
    }
}

async fn locked_voice(
    conn: &mut diesel_async::AsyncPgConnection,
    voice_id: Uuid,
) -> Result<VoiceRow, VoiceTxError> {
    voices::table
        .find(voice_id)
        .for_update()
        .select(VoiceRow::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| {
            VoiceTxError::Domain(VoiceStoreError::not_found(format!("voice {voice_id}")))
        })
}

fn check_edge(
    row: &VoiceRow,
    allowed_from: &[AllocationStatus],
    to: AllocationStatus,
) -> Result<(), VoiceTxError> {
    let current: AllocationStatus = row
        .allocation_status
        .parse()
        .map_err(|err: String| VoiceTxError::Domain(VoiceStoreError::query(err)))?;
    if !allowed_from.contains(&current) || !current.may_transition_to(to) {
        return Err(VoiceTxError::Domain(VoiceStoreError::InvalidState {
            current,
            requested: to,
        }));
    }
    Ok(())
}

#[async_trait]
impl VoiceStore for DieselVoiceStore {
    async fn create(&self, voice: NewVoice, now: DateTime<Utc>) -> Result<Voice, VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let row: VoiceRow = diesel::insert_into(voices::table)
            .values(&NewVoiceRow {
                id: *voice.id.as_uuid(),
                user_id: *voice.user_id.as_uuid(),
                name: &voice.name,
                provider: voice.provider.as_str(),
                sample_blob_key: voice.sample_blob_key.as_deref(),
                sample_bytes: voice.sample_bytes,
                allocation_status: AllocationStatus::Recorded.as_str(),
                created_at: now,
                updated_at: now,
            })
            .get_result(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        row.into_domain().map_err(map_decode_error)
    }

    async fn find(&self, voice_id: VoiceId) -> Result<Option<Voice>, VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let row: Option<VoiceRow> = voices::table
            .find(*voice_id.as_uuid())
            .select(VoiceRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;
        row.map(|row| row.into_domain().map_err(map_decode_error))
            .transpose()
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Voice>, VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let rows: Vec<VoiceRow> = voices::table
            .filter(voices::user_id.eq(*user_id.as_uuid()))
            .order(voices::created_at.asc())
            .select(VoiceRow::as_select())
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        rows.into_iter()
            .map(|row| row.into_domain().map_err(map_decode_error))
            .collect()
    }

    async fn delete(&self, voice_id: VoiceId) -> Result<(), VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::delete(voices::table.find(*voice_id.as_uuid()))
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        voice_id: VoiceId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let updated = diesel::update(
            voices::table.find(*voice_id.as_uuid()).filter(
                voices::slot_lock_expires_at
                    .is_null()
                    .or(voices::slot_lock_expires_at.le(now)),
            ),
        )
        .set((
            voices::slot_lock_expires_at.eq(until),
            voices::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await
        .map_err(map_diesel_error)?;
        if updated > 0 {
            return Ok(true);
        }

        // Distinguish a held lock from a missing row.
        let exists: Option<Uuid> = voices::table
            .find(*voice_id.as_uuid())
            .select(voices::id)
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(VoiceStoreError::not_found(format!("voice {voice_id}"))),
        }
    }

    async fn release_lock(&self, voice_id: VoiceId) -> Result<(), VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::update(voices::table.find(*voice_id.as_uuid()))
            .set(voices::slot_lock_expires_at.eq(None::<DateTime<Utc>>))
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(())
    }

    async fn transition(
        &self,
        voice_id: VoiceId,
        allowed_from: &[AllocationStatus],
        to: AllocationStatus,
        now: DateTime<Utc>,
    ) -> Result<Voice, VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let voice_uuid = *voice_id.as_uuid();
        let allowed = allowed_from.to_vec();

        conn.transaction::<_, VoiceTxError, _>(|conn| {
            async move {
                let row = locked_voice(conn, voice_uuid).await?;
                check_edge(&row, &allowed, to)?;
                let updated: VoiceRow = diesel::update(voices::table.find(voice_uuid))
                    .set((
                        voices::allocation_status.eq(to.as_str()),
                        voices::updated_at.eq(now),
                    ))
                    .get_result(conn)
                    .await?;
                Ok(updated.into_domain()?)
            }
            .scope_boxed()
        })
        .await
        .map_err(unwrap_tx_error)
    }

    async fn mark_ready(
        &self,
        voice_id: VoiceId,
        remote_voice_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Voice, VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let voice_uuid = *voice_id.as_uuid();
        let remote = remote_voice_id.to_string();

        let result = conn
            .transaction::<_, VoiceTxError, _>(|conn| {
                async move {
                    let row = locked_voice(conn, voice_uuid).await?;
                    check_edge(&row, &[AllocationStatus::Allocating], AllocationStatus::Ready)?;
                    let updated: VoiceRow = diesel::update(voices::table.find(voice_uuid))
                        .set((
                            voices::allocation_status.eq(AllocationStatus::Ready.as_str()),
                            voices::remote_voice_id.eq(Some(remote.as_str())),
                            voices::allocated_at.eq(Some(now)),
                            voices::last_used_at.eq(Some(now)),
                            voices::error_message.eq(None::<String>),
                            voices::updated_at.eq(now),
                        ))
                        .get_result(conn)
                        .await?;
                    Ok(updated.into_domain()?)
                }
                .scope_boxed()
            })
            .await;

        match result {
            Ok(voice) => Ok(voice),
            Err(VoiceTxError::Diesel(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            ))) => Err(VoiceStoreError::RemoteIdTaken {
                remote_voice_id: remote_voice_id.to_string(),
            }),
            Err(error) => Err(unwrap_tx_error(error)),
        }
    }

    async fn mark_error(
        &self,
        voice_id: VoiceId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Voice, VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let row: VoiceRow = diesel::update(voices::table.find(*voice_id.as_uuid()))
            .set((
                voices::allocation_status.eq(AllocationStatus::Error.as_str()),
                voices::error_message.eq(Some(message)),
                voices::slot_lock_expires_at.eq(None::<DateTime<Utc>>),
                voices::updated_at.eq(now),
            ))
            .get_result(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        row.into_domain().map_err(map_decode_error)
    }

    async fn clear_remote(
        &self,
        voice_id: VoiceId,
        to: AllocationStatus,
        now: DateTime<Utc>,
    ) -> Result<Voice, VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let voice_uuid = *voice_id.as_uuid();

        conn.transaction::<_, VoiceTxError, _>(|conn| {
            async move {
                let row = locked_voice(conn, voice_uuid).await?;
                let current: AllocationStatus = row
                    .allocation_status
                    .parse()
                    .map_err(|err: String| VoiceTxError::Domain(VoiceStoreError::query(err)))?;
                if !current.may_transition_to(to) {
                    return Err(VoiceTxError::Domain(VoiceStoreError::InvalidState {
                        current,
                        requested: to,
                    }));
                }
                let updated: VoiceRow = diesel::update(voices::table.find(voice_uuid))
                    .set((
                        voices::allocation_status.eq(to.as_str()),
                        voices::remote_voice_id.eq(None::<String>),
                        voices::allocated_at.eq(None::<DateTime<Utc>>),
                        voices::updated_at.eq(now),
                    ))
                    .get_result(conn)
                    .await?;
                Ok(updated.into_domain()?)
            }
            .scope_boxed()
        })
        .await
        .map_err(unwrap_tx_error)
    }

    async fn touch_last_used(
        &self,
        voice_id: VoiceId,
        now: DateTime<Utc>,
    ) -> Result<(), VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::update(voices::table.find(*voice_id.as_uuid()))
            .set((voices::last_used_at.eq(Some(now)), voices::updated_at.eq(now)))
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(())
    }

    async fn count_holding_slots(&self, provider: Provider) -> Result<u32, VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let holding = [
            AllocationStatus::Allocating.as_str(),
            AllocationStatus::Ready.as_str(),
            AllocationStatus::Cooling.as_str(),
        ];
        let count: i64 = voices::table
            .filter(voices::provider.eq(provider.as_str()))
            .filter(voices::allocation_status.eq_any(holding))
            .count()
            .get_result(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(count.max(0) as u32)
    }

    async fn eviction_candidates(
        &self,
        provider: Provider,
        idle_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Voice>, VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let reclaimable = [
            AllocationStatus::Ready.as_str(),
            AllocationStatus::Cooling.as_str(),
        ];
        let rows: Vec<VoiceRow> = voices::table
            .filter(voices::provider.eq(provider.as_str()))
            .filter(voices::allocation_status.eq_any(reclaimable))
            .filter(voices::last_used_at.lt(idle_before))
            .filter(
                voices::slot_lock_expires_at
                    .is_null()
                    .or(voices::slot_lock_expires_at.le(now)),
            )
            .order(voices::last_used_at.asc())
            .limit(i64::from(limit))
            .select(VoiceRow::as_select())
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        rows.into_iter()
            .map(|row| row.into_domain().map_err(map_decode_error))
            .collect()
    }

    async fn record_event(&self, event: &SlotEvent) -> Result<(), VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::insert_into(slot_events::table)
            .values(&NewSlotEventRow {
                id: *event.id.as_uuid(),
                voice_id: *event.voice_id.as_uuid(),
                user_id: *event.user_id.as_uuid(),
                event_type: event.event_type.as_str(),
                reason: &event.reason,
                metadata: event.metadata.as_ref(),
                created_at: event.created_at,
            })
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(())
    }

    async fn recent_events(&self, limit: u32) -> Result<Vec<SlotEvent>, VoiceStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let rows: Vec<SlotEventRow> = slot_events::table
            .order(slot_events::created_at.desc())
            .limit(i64::from(limit))
            .select(SlotEventRow::as_select())
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        rows.into_iter()
            .map(|row| row.into_domain().map_err(map_decode_error))
            .collect()
    }
}
