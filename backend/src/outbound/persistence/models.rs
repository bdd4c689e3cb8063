//! Diesel row structs and their domain conversions.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::credits::{
    CreditAllocation, CreditLot, CreditSource, CreditTransaction, TransactionKind,
    TransactionStatus,
};
use crate::domain::ids::{EventId, JobId, LotId, StoryId, TxId, UserId, VoiceId};
use crate::domain::ports::{QueueEntry, Story};
use crate::domain::synthesis::{JobStatus, SynthesisJob};
use crate::domain::voices::{AllocationStatus, Provider, SlotEvent, SlotEventType, Voice};

use super::schema::{
    credit_allocations, credit_lots, credit_transactions, slot_events, slot_queue_entries,
    stories, synthesis_jobs, users, voices,
};

/// Raised when a stored enum value no longer parses.
#[derive(Debug, thiserror::Error)]
#[error("corrupted row: {0}")]
pub struct RowDecodeError(pub String);

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct UserRow {
    pub id: Uuid,
    pub credits_balance_cached: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUserRow {
    pub id: Uuid,
    pub credits_balance_cached: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = credit_lots)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreditLotRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source: String,
    pub amount_granted: i64,
    pub amount_remaining: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditLotRow {
    pub fn into_domain(self) -> Result<CreditLot, RowDecodeError> {
        Ok(CreditLot {
            id: LotId::from_uuid(self.id),
            user_id: UserId::from_uuid(self.user_id),
            source: CreditSource::from_str(&self.source)
                .map_err(|err| RowDecodeError(err.to_string()))?,
            amount_granted: self.amount_granted,
            amount_remaining: self.amount_remaining,
            expires_at: self.expires_at,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = credit_lots)]
pub struct NewCreditLotRow<'a> {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source: &'a str,
    pub amount_granted: i64,
    pub amount_remaining: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = credit_transactions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreditTransactionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub kind: String,
    pub status: String,
    pub reason: String,
    pub job_id: Option<Uuid>,
    pub story_id: Option<Uuid>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl CreditTransactionRow {
    pub fn into_domain(self) -> Result<CreditTransaction, RowDecodeError> {
        Ok(CreditTransaction {
            id: TxId::from_uuid(self.id),
            user_id: UserId::from_uuid(self.user_id),
            amount: self.amount,
            kind: TransactionKind::from_str(&self.kind).map_err(RowDecodeError)?,
            status: TransactionStatus::from_str(&self.status).map_err(RowDecodeError)?,
            reason: self.reason,
            job_id: self.job_id.map(JobId::from_uuid),
            story_id: self.story_id.map(StoryId::from_uuid),
            metadata: self.metadata,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = credit_transactions)]
pub struct NewCreditTransactionRow<'a> {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub kind: &'a str,
    pub status: &'a str,
    pub reason: &'a str,
    pub job_id: Option<Uuid>,
    pub story_id: Option<Uuid>,
    pub metadata: Option<&'a Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = credit_allocations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreditAllocationRow {
    pub tx_id: Uuid,
    pub lot_id: Uuid,
    pub amount: i64,
}

impl From<CreditAllocationRow> for CreditAllocation {
    fn from(row: CreditAllocationRow) -> Self {
        Self {
            tx_id: TxId::from_uuid(row.tx_id),
            lot_id: LotId::from_uuid(row.lot_id),
            amount: row.amount,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = voices)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct VoiceRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub provider: String,
    pub sample_blob_key: Option<String>,
    pub sample_bytes: i64,
    pub remote_voice_id: Option<String>,
    pub allocation_status: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub slot_lock_expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VoiceRow {
    pub fn into_domain(self) -> Result<Voice, RowDecodeError> {
        Ok(Voice {
            id: VoiceId::from_uuid(self.id),
            user_id: UserId::from_uuid(self.user_id),
            name: self.name,
            provider: Provider::from_str(&self.provider).map_err(RowDecodeError)?,
            sample_blob_key: self.sample_blob_key,
            sample_bytes: self.sample_bytes,
            remote_voice_id: self.remote_voice_id,
            allocation_status: AllocationStatus::from_str(&self.allocation_status)
                .map_err(RowDecodeError)?,
            last_used_at: self.last_used_at,
            allocated_at: self.allocated_at,
            slot_lock_expires_at: self.slot_lock_expires_at,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = voices)]
pub struct NewVoiceRow<'a> {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: &'a str,
    pub provider: &'a str,
    pub sample_blob_key: Option<&'a str>,
    pub sample_bytes: i64,
    pub allocation_status: &'a str,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = slot_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SlotEventRow {
    pub id: Uuid,
    pub voice_id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub reason: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl SlotEventRow {
    pub fn into_domain(self) -> Result<SlotEvent, RowDecodeError> {
        Ok(SlotEvent {
            id: EventId::from_uuid(self.id),
            voice_id: VoiceId::from_uuid(self.voice_id),
            user_id: UserId::from_uuid(self.user_id),
            event_type: SlotEventType::from_str(&self.event_type).map_err(RowDecodeError)?,
            reason: self.reason,
            metadata: self.metadata,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = slot_events)]
pub struct NewSlotEventRow<'a> {
    pub id: Uuid,
    pub voice_id: Uuid,
    pub user_id: Uuid,
    pub event_type: &'a str,
    pub reason: &'a str,
    pub metadata: Option<&'a Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = synthesis_jobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SynthesisJobRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub voice_id: Uuid,
    pub story_id: Uuid,
    pub status: String,
    pub credits_charged: i64,
    pub artifact_blob_key: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SynthesisJobRow {
    pub fn into_domain(self) -> Result<SynthesisJob, RowDecodeError> {
        Ok(SynthesisJob {
            id: JobId::from_uuid(self.id),
            user_id: UserId::from_uuid(self.user_id),
            voice_id: VoiceId::from_uuid(self.voice_id),
            story_id: StoryId::from_uuid(self.story_id),
            status: JobStatus::from_str(&self.status).map_err(RowDecodeError)?,
            credits_charged: self.credits_charged,
            artifact_blob_key: self.artifact_blob_key,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = synthesis_jobs)]
pub struct NewSynthesisJobRow<'a> {
    pub id: Uuid,
    pub user_id: Uuid,
    pub voice_id: Uuid,
    pub story_id: Uuid,
    pub status: &'a str,
    pub credits_charged: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = slot_queue_entries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SlotQueueEntryRow {
    pub voice_id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: i32,
    pub sequence: i64,
}

impl SlotQueueEntryRow {
    pub fn into_domain(self) -> Result<QueueEntry, RowDecodeError> {
        Ok(QueueEntry {
            voice_id: VoiceId::from_uuid(self.voice_id),
            user_id: UserId::from_uuid(self.user_id),
            provider: Provider::from_str(&self.provider).map_err(RowDecodeError)?,
            enqueued_at: self.enqueued_at,
            attempts: self.attempts,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = slot_queue_entries)]
pub struct NewSlotQueueEntryRow<'a> {
    pub voice_id: Uuid,
    pub user_id: Uuid,
    pub provider: &'a str,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: i32,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = stories)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StoryRow {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl From<StoryRow> for Story {
    fn from(row: StoryRow) -> Self {
        Self {
            id: StoryId::from_uuid(row.id),
            title: row.title,
            text: row.body,
        }
    }
}
