//! Port for synthesis job persistence.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::ids::{JobId, StoryId, UserId, VoiceId};
use crate::domain::synthesis::{JobStatus, SynthesisJob};

/// Errors raised by job store adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    /// The referenced job does not exist.
    #[error("job not found: {message}")]
    NotFound { message: String },
    /// The job was not in any of the expected statuses.
    #[error("invalid job state: {current} cannot become {requested}")]
    InvalidState {
        current: JobStatus,
        requested: JobStatus,
    },
    /// A concurrent writer invalidated this operation; safe to retry.
    #[error("job store conflict: {message}")]
    Conflict { message: String },
    /// Store connection could not be established.
    #[error("job store connection failed: {message}")]
    Connection { message: String },
    /// Query or mutation failed during execution.
    #[error("job store query failed: {message}")]
    Query { message: String },
}

impl JobStoreError {
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

/// Inputs for creating a pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub user_id: UserId,
    pub voice_id: VoiceId,
    pub story_id: StoryId,
    pub credits_charged: i64,
}

/// Port for job persistence. One job exists per `(user, voice, story)`
/// triple; `get_or_create` is the only creation path so concurrent starts
/// converge on a single row.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find(&self, job_id: JobId) -> Result<Option<SynthesisJob>, JobStoreError>;

    async fn find_for_story(
        &self,
        user_id: UserId,
        voice_id: VoiceId,
        story_id: StoryId,
    ) -> Result<Option<SynthesisJob>, JobStoreError>;

    /// Create a pending job, or return the existing row for the triple.
    async fn get_or_create(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<SynthesisJob, JobStoreError>;

    /// Move the job to `to` provided its current status is in `allowed_from`.
    async fn transition(
        &self,
        job_id: JobId,
        allowed_from: &[JobStatus],
        to: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<SynthesisJob, JobStoreError>;

    /// Record the charged amount on the job row.
    async fn set_credits_charged(
        &self,
        job_id: JobId,
        credits: i64,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Complete the job with its artifact key.
    async fn mark_ready(
        &self,
        job_id: JobId,
        artifact_blob_key: &str,
        now: DateTime<Utc>,
    ) -> Result<SynthesisJob, JobStoreError>;

    /// Fail the job with a terminal message.
    async fn mark_error(
        &self,
        job_id: JobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<SynthesisJob, JobStoreError>;

    /// Jobs in `pending` or `processing` for one user.
    async fn count_inflight_for_user(&self, user_id: UserId) -> Result<u32, JobStoreError>;

    /// Whether any job for this voice is currently `processing`.
    async fn exists_processing_for_voice(&self, voice_id: VoiceId)
        -> Result<bool, JobStoreError>;

    /// Delete a single job row. Idempotent.
    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Delete all jobs referencing a voice (voice deletion cleanup).
    async fn delete_for_voice(&self, voice_id: VoiceId) -> Result<u64, JobStoreError>;
}

/// In-memory job store fixture.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, SynthesisJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, SynthesisJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn job_mut<'a>(
        jobs: &'a mut HashMap<JobId, SynthesisJob>,
        job_id: JobId,
    ) -> Result<&'a mut SynthesisJob, JobStoreError> {
        jobs.get_mut(&job_id)
            .ok_or_else(|| JobStoreError::not_found(format!("job {job_id}")))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find(&self, job_id: JobId) -> Result<Option<SynthesisJob>, JobStoreError> {
        Ok(self.lock().get(&job_id).cloned())
    }

    async fn find_for_story(
        &self,
        user_id: UserId,
        voice_id: VoiceId,
        story_id: StoryId,
    ) -> Result<Option<SynthesisJob>, JobStoreError> {
        let jobs = self.lock();
        Ok(jobs
            .values()
            .find(|job| {
                job.user_id == user_id && job.voice_id == voice_id && job.story_id == story_id
            })
            .cloned())
    }

    async fn get_or_create(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<SynthesisJob, JobStoreError> {
        let mut jobs = self.lock();
        if let Some(existing) = jobs.values().find(|existing| {
            existing.user_id == job.user_id
                && existing.voice_id == job.voice_id
                && existing.story_id == job.story_id
        }) {
            return Ok(existing.clone());
        }
        let row = SynthesisJob {
            id: job.id,
            user_id: job.user_id,
            voice_id: job.voice_id,
            story_id: job.story_id,
            status: JobStatus::Pending,
            credits_charged: job.credits_charged,
            artifact_blob_key: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn transition(
        &self,
        job_id: JobId,
        allowed_from: &[JobStatus],
        to: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<SynthesisJob, JobStoreError> {
        let mut jobs = self.lock();
        let job = Self::job_mut(&mut jobs, job_id)?;
        if !allowed_from.contains(&job.status) {
            return Err(JobStoreError::InvalidState {
                current: job.status,
                requested: to,
            });
        }
        job.status = to;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn set_credits_charged(
        &self,
        job_id: JobId,
        credits: i64,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.lock();
        let job = Self::job_mut(&mut jobs, job_id)?;
        job.credits_charged = credits;
        job.updated_at = now;
        Ok(())
    }

    async fn mark_ready(
        &self,
        job_id: JobId,
        artifact_blob_key: &str,
        now: DateTime<Utc>,
    ) -> Result<SynthesisJob, JobStoreError> {
        let mut jobs = self.lock();
        let job = Self::job_mut(&mut jobs, job_id)?;
        job.status = JobStatus::Ready;
        job.artifact_blob_key = Some(artifact_blob_key.to_string());
        job.error_message = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn mark_error(
        &self,
        job_id: JobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<SynthesisJob, JobStoreError> {
        let mut jobs = self.lock();
        let job = Self::job_mut(&mut jobs, job_id)?;
        job.status = JobStatus::Error;
        job.error_message = Some(message.to_string());
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn count_inflight_for_user(&self, user_id: UserId) -> Result<u32, JobStoreError> {
        let jobs = self.lock();
        Ok(jobs
            .values()
            .filter(|job| {
                job.user_id == user_id
                    && matches!(job.status, JobStatus::Pending | JobStatus::Processing)
            })
            .count() as u32)
    }

    async fn exists_processing_for_voice(
        &self,
        voice_id: VoiceId,
    ) -> Result<bool, JobStoreError> {
        let jobs = self.lock();
        Ok(jobs
            .values()
            .any(|job| job.voice_id == voice_id && job.status == JobStatus::Processing))
    }

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.lock().remove(&job_id);
        Ok(())
    }

    async fn delete_for_voice(&self, voice_id: VoiceId) -> Result<u64, JobStoreError> {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| job.voice_id != voice_id);
        Ok((before - jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0)
            .single()
            .expect("valid time")
    }

    fn new_job() -> NewJob {
        NewJob {
            id: JobId::random(),
            user_id: UserId::random(),
            voice_id: VoiceId::random(),
            story_id: StoryId::random(),
            credits_charged: 3,
        }
    }

    #[rstest]
    #[tokio::test]
    async fn get_or_create_converges_on_one_row_per_triple() {
        let store = InMemoryJobStore::new();
        let job = new_job();
        let mut duplicate = new_job();
        duplicate.user_id = job.user_id;
        duplicate.voice_id = job.voice_id;
        duplicate.story_id = job.story_id;

        let first = store.get_or_create(job, at(1)).await.expect("create");
        let second = store.get_or_create(duplicate, at(2)).await.expect("create");

        assert_eq!(first.id, second.id);
    }

    #[rstest]
    #[tokio::test]
    async fn transition_rejects_unexpected_current_state() {
        let store = InMemoryJobStore::new();
        let job = store.get_or_create(new_job(), at(1)).await.expect("create");
        store.mark_ready(job.id, "artifacts/a.mp3", at(2)).await.expect("ready");

        let err = store
            .transition(job.id, &[JobStatus::Pending], JobStatus::Processing, at(3))
            .await
            .expect_err("must reject");

        assert!(matches!(err, JobStoreError::InvalidState { .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn inflight_count_ignores_finished_jobs() {
        let store = InMemoryJobStore::new();
        let user = UserId::random();
        let mut pending = new_job();
        pending.user_id = user;
        let mut done = new_job();
        done.user_id = user;
        store.get_or_create(pending, at(1)).await.expect("create");
        let done = store.get_or_create(done, at(1)).await.expect("create");
        store.mark_ready(done.id, "artifacts/b.mp3", at(2)).await.expect("ready");

        assert_eq!(store.count_inflight_for_user(user).await.expect("count"), 1);
    }
}
