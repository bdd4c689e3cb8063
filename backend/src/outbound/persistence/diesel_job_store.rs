//! PostgreSQL-backed `JobStore` implementation using Diesel.
//!
//! The unique index on `(user_id, voice_id, story_id)` makes `get_or_create`
//! race-safe: a losing insert falls back to selecting the winner's row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tracing::debug;
use uuid::Uuid;

use crate::domain::ids::{JobId, StoryId, UserId, VoiceId};
use crate::domain::ports::{JobStore, JobStoreError, NewJob};
use crate::domain::synthesis::{JobStatus, SynthesisJob};

use super::models::{NewSynthesisJobRow, RowDecodeError, SynthesisJobRow};
use super::pool::{DbPool, PoolError};
use super::schema::synthesis_jobs;

/// Diesel-backed implementation of the `JobStore` port.
#[derive(Clone)]
pub struct DieselJobStore {
    pool: DbPool,
}

impl DieselJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn map_pool_error(error: PoolError) -> JobStoreError {
    match error {
        PoolError::Checkout { message } | PoolError::Build { message } => {
            JobStoreError::connection(message)
        }
    }
}

fn map_diesel_error(error: diesel::result::Error) -> JobStoreError {
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
        DieselError::NotFound => JobStoreError::not_found("job row not found"),
        DieselError::DatabaseError(kind, _) => match kind {
            DatabaseErrorKind::UniqueViolation | DatabaseErrorKind::SerializationFailure => {
                JobStoreError::conflict("concurrent job write detected")
            }
            DatabaseErrorKind::ClosedConnection => {
                JobStoreError::connection("database connection error")
            }
            _ => JobStoreError::query("database error"),
        },
        _ => JobStoreError::query("database error"),
    }
}

fn map_decode_error(error: RowDecodeError) -> JobStoreError {
    JobStoreError::query(error.to_string())
}

fn decode(row: SynthesisJobRow) -> Result<SynthesisJob, JobStoreError> {
    row.into_domain().map_err(map_decode_error)
}

#[async_trait]
impl JobStore for DieselJobStore {
    async fn find(&self, job_id: JobId) -> Result<Option<SynthesisJob>, JobStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let row: Option<SynthesisJobRow> = synthesis_jobs::table
            .find(*job_id.as_uuid())
            .select(SynthesisJobRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;
        row.map(decode).transpose()
    }

    async fn find_for_story(
        &self,
        user_id: UserId,
        voice_id: VoiceId,
        story_id: StoryId,
    ) -> Result<Option<SynthesisJob>, JobStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let row: Option<SynthesisJobRow> = synthesis_jobs::table
            .filter(synthesis_jobs::user_id.eq(*user_id.as_uuid()))
            .filter(synthesis_jobs::voice_id.eq(*voice_id.as_uuid()))
            .filter(synthesis_jobs::story_id.eq(*story_id.as_uuid()))
            .select(SynthesisJobRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;
        row.map(decode).transpose()
    }

    async fn get_or_create(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<SynthesisJob, JobStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let inserted: Option<SynthesisJobRow> = diesel::insert_into(synthesis_jobs::table)
            .values(&NewSynthesisJobRow {
                id: *job.id.as_uuid(),
                user_id: *job.user_id.as_uuid(),
                voice_id: *job.voice_id.as_uuid(),
                story_id: *job.story_id.as_uuid(),
                status: JobStatus::Pending.as_str(),
                credits_charged: job.credits_charged,
                created_at: now,
                updated_at: now,
            })
            .on_conflict((
                synthesis_jobs::user_id,
                synthesis_jobs::voice_id,
                synthesis_jobs::story_id,
            ))
            .do_nothing()
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;

        match inserted {
            Some(row) => decode(row),
            None => self
                .find_for_story(job.user_id, job.voice_id, job.story_id)
                .await?
                .ok_or_else(|| JobStoreError::conflict("job insert lost its race twice")),
        }
    }

    async fn transition(
        &self,
        job_id: JobId,
        allowed_from: &[JobStatus],
        to: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<SynthesisJob, JobStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let allowed: Vec<&'static str> = allowed_from.iter().map(JobStatus::as_str).collect();
        let updated: Option<SynthesisJobRow> = diesel::update(
            synthesis_jobs::table
                .find(*job_id.as_uuid())
                .filter(synthesis_jobs::status.eq_any(allowed)),
        )
        .set((
            synthesis_jobs::status.eq(to.as_str()),
            synthesis_jobs::updated_at.eq(now),
        ))
        .get_result(&mut conn)
        .await
        .optional()
        .map_err(map_diesel_error)?;

        match updated {
            Some(row) => decode(row),
            None => {
                // Work out whether the row is missing or mid-flight.
                let current: Option<String> = synthesis_jobs::table
                    .find(*job_id.as_uuid())
                    .select(synthesis_jobs::status)
                    .first(&mut conn)
                    .await
                    .optional()
                    .map_err(map_diesel_error)?;
                match current {
                    None => Err(JobStoreError::not_found(format!("job {job_id}"))),
                    Some(status) => {
                        let current = status
                            .parse::<JobStatus>()
                            .map_err(JobStoreError::query)?;
                        Err(JobStoreError::InvalidState {
                            current,
                            requested: to,
                        })
                    }
                }
            }
        }
    }

    async fn set_credits_charged(
        &self,
        job_id: JobId,
        credits: i64,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::update(synthesis_jobs::table.find(*job_id.as_uuid()))
            .set((
                synthesis_jobs::credits_charged.eq(credits),
                synthesis_jobs::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(())
    }

    async fn mark_ready(
        &self,
        job_id: JobId,
        artifact_blob_key: &str,
        now: DateTime<Utc>,
    ) -> Result<SynthesisJob, JobStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let row: SynthesisJobRow = diesel::update(synthesis_jobs::table.find(*job_id.as_uuid()))
            .set((
                synthesis_jobs::status.eq(JobStatus::Ready.as_str()),
                synthesis_jobs::artifact_blob_key.eq(Some(artifact_blob_key)),
                synthesis_jobs::error_message.eq(None::<String>),
                synthesis_jobs::updated_at.eq(now),
            ))
            .get_result(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        decode(row)
    }

    async fn mark_error(
        &self,
        job_id: JobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<SynthesisJob, JobStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let row: SynthesisJobRow = diesel::update(synthesis_jobs::table.find(*job_id.as_uuid()))
            .set((
                synthesis_jobs::status.eq(JobStatus::Error.as_str()),
                synthesis_jobs::error_message.eq(Some(message)),
                synthesis_jobs::updated_at.eq(now),
            ))
            .get_result(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        decode(row)
    }

    async fn count_inflight_for_user(&self, user_id: UserId) -> Result<u32, JobStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let inflight = [JobStatus::Pending.as_str(), JobStatus::Processing.as_str()];
        let count: i64 = synthesis_jobs::table
            .filter(synthesis_jobs::user_id.eq(*user_id.as_uuid()))
            .filter(synthesis_jobs::status.eq_any(inflight))
            .count()
            .get_result(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(count.max(0) as u32)
    }

    async fn exists_processing_for_voice(
        &self,
        voice_id: VoiceId,
    ) -> Result<bool, JobStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let found: Option<Uuid> = synthesis_jobs::table
            .filter(synthesis_jobs::voice_id.eq(*voice_id.as_uuid()))
            .filter(synthesis_jobs::status.eq(JobStatus::Processing.as_str()))
            .select(synthesis_jobs::id)
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;
        Ok(found.is_some())
    }

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::delete(synthesis_jobs::table.find(*job_id.as_uuid()))
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(())
    }

    async fn delete_for_voice(&self, voice_id: VoiceId) -> Result<u64, JobStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let deleted = diesel::delete(
            synthesis_jobs::table.filter(synthesis_jobs::voice_id.eq(*voice_id.as_uuid())),
        )
        .execute(&mut conn)
        .await
        .map_err(map_diesel_error)?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn unique_violation_maps_to_conflict() {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};

        let err = map_diesel_error(DieselError::DatabaseError(
            DatabaseErrorKind::UniqueViolation,
            Box::new("duplicate key".to_string()),
        ));
        assert!(matches!(err, JobStoreError::Conflict { .. }));
    }
}
