//! Synthesis jobs and the orchestrator tying the ledger and slot manager
//! together.
//!
//! The handshake for every request: debit credits, ensure a slot, hand the
//! job to a worker, and propagate queued/allocating/processing/ready state to
//! the polling client. A debit is always refunded when the pipeline
//! terminates without producing an artifact.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::domain::config::AppConfig;
use crate::domain::credits::{CreditLedger, LedgerError};
use crate::domain::error::Error;
use crate::domain::ids::{JobId, StoryId, UserId, VoiceId};
use crate::domain::ports::{
    ArtifactStore, DebitOutcome, JobStore, JobStoreError, NewJob, RemoteVoiceAdapter,
    RemoteVoiceError, StoryStore, StoryStoreError, TaskDispatcher, VoiceStore, VoiceStoreError,
    WorkerTask,
};
use crate::domain::slots::{EnsureOutcome, SlotError, SlotManager};
use crate::domain::voices::AllocationStatus;
use crate::domain::worker::Sleeper;

/// Lifecycle status of a synthesis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Ready,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One story-audio task with its lifecycle and credit charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SynthesisJob {
    pub id: JobId,
    pub user_id: UserId,
    pub voice_id: VoiceId,
    pub story_id: StoryId,
    pub status: JobStatus,
    pub credits_charged: i64,
    pub artifact_blob_key: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// How long a worker waits for slot readiness before checking back later.
    pub allocation_wait_deadline: Duration,
    /// Poll cadence inside the readiness wait loop.
    pub readiness_poll_interval: Duration,
    /// Delay before a deferred worker re-checks a still-waiting job.
    pub requeue_delay: Duration,
    /// Defensive cap on `pending|processing` jobs per user.
    pub max_inflight_jobs_per_user: u32,
}

impl SynthesisConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            allocation_wait_deadline: config.allocation_wait_deadline,
            readiness_poll_interval: Duration::from_secs(5),
            requeue_delay: Duration::from_secs(30),
            max_inflight_jobs_per_user: config.max_inflight_jobs_per_user,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// Outcome of [`SynthesisOrchestrator::start_synthesis`].
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// The artifact already exists; nothing was charged.
    AlreadyReady {
        job: SynthesisJob,
        remote_voice_id: Option<String>,
        artifact_url: Option<String>,
    },
    /// Synthesis was dispatched against a live slot.
    Processing { job_id: JobId },
    /// Another worker already drives this job; nothing was charged.
    AlreadyProcessing { job_id: JobId },
    /// Slot allocation is in flight; the job waits for readiness.
    AllocatingVoice {
        job_id: JobId,
        queue_position: Option<u32>,
    },
    /// The slot pool is saturated; the voice waits in the queue.
    QueuedForSlot {
        job_id: JobId,
        queue_position: u32,
        queue_length: u32,
    },
}

/// Expected failures of synthesis orchestration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynthesisError {
    #[error("{message}")]
    NotFound { message: String },
    #[error("insufficient credits: need {required}, available {available}")]
    PaymentRequired { required: i64, available: i64 },
    #[error("voice unavailable: {reason}")]
    VoiceUnavailable { reason: String },
    #[error("too many synthesis jobs in flight (limit {limit})")]
    TooManyJobs { limit: u32 },
    #[error("{message}")]
    Retryable { message: String },
    #[error("{message}")]
    Terminal { message: String },
}

impl SynthesisError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal {
            message: message.into(),
        }
    }
}

impl From<SlotError> for SynthesisError {
    fn from(error: SlotError) -> Self {
        match error {
            SlotError::NotFound { message } => Self::NotFound { message },
            SlotError::Retryable { message } => Self::Retryable { message },
            SlotError::Terminal { message } => Self::Terminal { message },
        }
    }
}

impl From<LedgerError> for SynthesisError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::InsufficientCredits {
                required,
                available,
            } => Self::PaymentRequired {
                required,
                available,
            },
            LedgerError::NotFound(message) => Self::NotFound { message },
            LedgerError::Conflict(message) | LedgerError::Unavailable(message) => {
                Self::Retryable { message }
            }
            LedgerError::InvalidArgument(message) | LedgerError::Internal(message) => {
                Self::Terminal { message }
            }
        }
    }
}

impl From<JobStoreError> for SynthesisError {
    fn from(error: JobStoreError) -> Self {
        match error {
            JobStoreError::NotFound { message } => Self::NotFound { message },
            JobStoreError::Conflict { message } | JobStoreError::Connection { message } => {
                Self::Retryable { message }
            }
            other => Self::Terminal {
                message: other.to_string(),
            },
        }
    }
}

impl From<StoryStoreError> for SynthesisError {
    fn from(error: StoryStoreError) -> Self {
        match error {
            StoryStoreError::Connection { message } => Self::Retryable { message },
            StoryStoreError::Query { message } => Self::Terminal { message },
        }
    }
}

impl From<VoiceStoreError> for SynthesisError {
    fn from(error: VoiceStoreError) -> Self {
        match error {
            VoiceStoreError::NotFound { message } => Self::NotFound { message },
            VoiceStoreError::Conflict { message } | VoiceStoreError::Connection { message } => {
                Self::Retryable { message }
            }
            other => Self::Terminal {
                message: other.to_string(),
            },
        }
    }
}

impl From<SynthesisError> for Error {
    fn from(error: SynthesisError) -> Self {
        match error {
            SynthesisError::NotFound { message } => Error::not_found(message),
            SynthesisError::PaymentRequired {
                required,
                available,
            } => Error::insufficient_credits("active balance cannot cover this synthesis")
                .with_details(serde_json::json!({
                    "required": required,
                    "available": available,
                })),
            SynthesisError::VoiceUnavailable { reason } => Error::conflict(reason),
            SynthesisError::TooManyJobs { limit } => Error::conflict(format!(
                "too many synthesis jobs in flight (limit {limit})"
            )),
            SynthesisError::Retryable { message } => Error::service_unavailable(message),
            SynthesisError::Terminal { message } => Error::internal(message),
        }
    }
}

/// Dependency bundle for the orchestrator.
pub struct SynthesisPorts {
    pub jobs: Arc<dyn JobStore>,
    pub stories: Arc<dyn StoryStore>,
    pub voices: Arc<dyn VoiceStore>,
    pub blobs: Arc<dyn ArtifactStore>,
    pub adapter: Arc<dyn RemoteVoiceAdapter>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
}

/// The synthesis orchestrator service.
pub struct SynthesisOrchestrator {
    jobs: Arc<dyn JobStore>,
    stories: Arc<dyn StoryStore>,
    voices: Arc<dyn VoiceStore>,
    blobs: Arc<dyn ArtifactStore>,
    adapter: Arc<dyn RemoteVoiceAdapter>,
    dispatcher: Arc<dyn TaskDispatcher>,
    ledger: Arc<CreditLedger>,
    slots: Arc<SlotManager>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    config: SynthesisConfig,
}

impl SynthesisOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ports: SynthesisPorts,
        ledger: Arc<CreditLedger>,
        slots: Arc<SlotManager>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        config: SynthesisConfig,
    ) -> Self {
        Self {
            jobs: ports.jobs,
            stories: ports.stories,
            voices: ports.voices,
            blobs: ports.blobs,
            adapter: ports.adapter,
            dispatcher: ports.dispatcher,
            ledger,
            slots,
            clock,
            sleeper,
            config,
        }
    }

    fn artifact_key(voice_id: VoiceId, story_id: StoryId) -> String {
        format!("artifacts/{voice_id}/{story_id}.mp3")
    }

    /// Handle one synthesis request.
    ///
    /// Idempotent: repeated calls with the same `(user, voice, story)` charge
    /// at most once, enqueue at most one slot request, and keep at most one
    /// worker in flight.
    pub async fn start_synthesis(
        &self,
        user_id: UserId,
        voice_id: VoiceId,
        story_id: StoryId,
    ) -> Result<StartOutcome, SynthesisError> {
        let now = self.clock.utc();
        let voice = self
            .voices
            .find(voice_id)
            .await?
            .filter(|voice| voice.user_id == user_id)
            .ok_or_else(|| SynthesisError::not_found(format!("voice {voice_id} not found")))?;
        let story = self
            .stories
            .find(story_id)
            .await?
            .ok_or_else(|| SynthesisError::not_found(format!("story {story_id} not found")))?;
        let required = self.ledger.required_credits(&story.text);

        let existing = self.jobs.find_for_story(user_id, voice_id, story_id).await?;
        let mut created_here = false;
        let job = match existing {
            Some(job) => match job.status {
                JobStatus::Ready if job.artifact_blob_key.is_some() => {
                    let artifact_url = job
                        .artifact_blob_key
                        .as_deref()
                        .and_then(|key| self.blobs.public_url(key));
                    return Ok(StartOutcome::AlreadyReady {
                        remote_voice_id: voice.remote_voice_id,
                        artifact_url,
                        job,
                    });
                }
                JobStatus::Processing => {
                    return Ok(StartOutcome::AlreadyProcessing { job_id: job.id });
                }
                JobStatus::Pending => job,
                JobStatus::Error | JobStatus::Ready => {
                    // Errored (refunded) or ready-without-artifact: run again.
                    self.jobs
                        .transition(
                            job.id,
                            &[JobStatus::Error, JobStatus::Ready],
                            JobStatus::Pending,
                            now,
                        )
                        .await?
                }
            },
            None => {
                let inflight = self.jobs.count_inflight_for_user(user_id).await?;
                if inflight >= self.config.max_inflight_jobs_per_user {
                    return Err(SynthesisError::TooManyJobs {
                        limit: self.config.max_inflight_jobs_per_user,
                    });
                }
                created_here = true;
                self.jobs
                    .get_or_create(
                        NewJob {
                            id: JobId::random(),
                            user_id,
                            voice_id,
                            story_id,
                            credits_charged: required,
                        },
                        now,
                    )
                    .await?
            }
        };

        let debit = self
            .ledger
            .debit(
                user_id,
                required,
                job.id,
                Some(story_id),
                format!("synthesis:{}", job.id),
            )
            .await;
        let outcome = match debit {
            Ok(outcome) => outcome,
            Err(error) => {
                if created_here {
                    // A request that never charged leaves no job behind.
                    if let Err(cleanup) = self.jobs.delete(job.id).await {
                        warn!(job_id = %job.id, %cleanup, "failed to drop uncharged job");
                    }
                }
                return Err(error.into());
            }
        };
        let newly_charged = matches!(outcome, DebitOutcome::Charged(_));
        self.jobs.set_credits_charged(job.id, required, now).await?;

        match self.slots.ensure_active(user_id, voice_id).await? {
            EnsureOutcome::Ready { .. } => {
                match self
                    .jobs
                    .transition(job.id, &[JobStatus::Pending], JobStatus::Processing, now)
                    .await
                {
                    Ok(_) => {
                        self.dispatcher
                            .dispatch(WorkerTask::Synthesize { job_id: job.id })
                            .map_err(|error| SynthesisError::retryable(error.to_string()))?;
                        info!(job_id = %job.id, %voice_id, %story_id, "synthesis dispatched");
                        Ok(StartOutcome::Processing { job_id: job.id })
                    }
                    Err(JobStoreError::InvalidState { .. }) => {
                        Ok(StartOutcome::AlreadyProcessing { job_id: job.id })
                    }
                    Err(error) => Err(error.into()),
                }
            }
            EnsureOutcome::Allocating { queue_position } => {
                if newly_charged {
                    self.dispatcher
                        .dispatch(WorkerTask::Synthesize { job_id: job.id })
                        .map_err(|error| SynthesisError::retryable(error.to_string()))?;
                }
                Ok(StartOutcome::AllocatingVoice {
                    job_id: job.id,
                    queue_position,
                })
            }
            EnsureOutcome::Queued {
                queue_position,
                queue_length,
            } => {
                if newly_charged {
                    self.dispatcher
                        .dispatch(WorkerTask::Synthesize { job_id: job.id })
                        .map_err(|error| SynthesisError::retryable(error.to_string()))?;
                }
                Ok(StartOutcome::QueuedForSlot {
                    job_id: job.id,
                    queue_position,
                    queue_length,
                })
            }
            EnsureOutcome::Failed { reason } => {
                self.fail_job(job.id, &reason).await?;
                Err(SynthesisError::VoiceUnavailable { reason })
            }
        }
    }

    /// Worker-side synthesis: wait for the slot, synthesize, store the
    /// artifact.
    ///
    /// Retryable failures bubble up for the runtime's backoff; everything
    /// else resolves the task, failing the job (with a refund) on terminal
    /// paths.
    pub async fn run_synthesis(&self, job_id: JobId) -> Result<(), SynthesisError> {
        let Some(job) = self.jobs.find(job_id).await? else {
            return Ok(());
        };
        if !matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
            return Ok(());
        }

        let Some(remote_voice_id) = self.wait_for_slot(&job).await? else {
            return Ok(());
        };

        let now = self.clock.utc();
        match self
            .jobs
            .transition(
                job_id,
                &[JobStatus::Pending, JobStatus::Processing],
                JobStatus::Processing,
                now,
            )
            .await
        {
            Ok(_) => {}
            Err(JobStoreError::InvalidState { .. }) => return Ok(()),
            Err(error) => return Err(error.into()),
        }

        let Some(story) = self.stories.find(job.story_id).await? else {
            self.fail_job(job_id, "story vanished before synthesis").await?;
            return Ok(());
        };

        match self.adapter.synthesize(&remote_voice_id, &story.text).await {
            Ok(audio) => {
                let key = Self::artifact_key(job.voice_id, job.story_id);
                self.blobs
                    .put(&key, &audio)
                    .await
                    .map_err(|error| SynthesisError::retryable(error.to_string()))?;
                let now = self.clock.utc();
                self.jobs.mark_ready(job_id, &key, now).await?;
                self.voices.touch_last_used(job.voice_id, now).await?;
                // The voice finished its work; cooling keeps it warm-held
                // but eligible for reclaim once the window lapses.
                if let Err(error) = self
                    .voices
                    .transition(
                        job.voice_id,
                        &[AllocationStatus::Ready],
                        AllocationStatus::Cooling,
                        now,
                    )
                    .await
                {
                    if !matches!(error, VoiceStoreError::InvalidState { .. }) {
                        return Err(error.into());
                    }
                }
                info!(%job_id, artifact = key, "synthesis complete");
                Ok(())
            }
            Err(RemoteVoiceError::VoiceMissing) => {
                self.slots.repair_drift(job.voice_id).await?;
                if let Err(error) = self
                    .jobs
                    .transition(
                        job_id,
                        &[JobStatus::Processing],
                        JobStatus::Pending,
                        self.clock.utc(),
                    )
                    .await
                {
                    if !matches!(error, JobStoreError::InvalidState { .. }) {
                        return Err(error.into());
                    }
                }
                self.dispatcher
                    .dispatch_delayed(
                        WorkerTask::Synthesize { job_id },
                        self.config.requeue_delay,
                    )
                    .map_err(|error| SynthesisError::retryable(error.to_string()))?;
                Ok(())
            }
            Err(error) if error.is_retryable() => {
                Err(SynthesisError::retryable(error.to_string()))
            }
            Err(error) => {
                self.fail_job(job_id, &error.to_string()).await?;
                Ok(())
            }
        }
    }

    /// Wait for the voice slot within the allocation deadline. Returns
    /// `None` when the task was resolved some other way (deferred, failed).
    async fn wait_for_slot(&self, job: &SynthesisJob) -> Result<Option<String>, SynthesisError> {
        let started = self.clock.utc();
        let deadline =
            TimeDelta::from_std(self.config.allocation_wait_deadline).unwrap_or(TimeDelta::MAX);
        loop {
            match self.slots.ensure_active(job.user_id, job.voice_id).await {
                Ok(EnsureOutcome::Ready { remote_voice_id }) => {
                    return Ok(Some(remote_voice_id));
                }
                Ok(EnsureOutcome::Allocating { .. } | EnsureOutcome::Queued { .. }) => {
                    if self.clock.utc() - started >= deadline {
                        // Do not fail the job; check back once the slot pool
                        // has had time to move.
                        self.dispatcher
                            .dispatch_delayed(
                                WorkerTask::Synthesize { job_id: job.id },
                                self.config.requeue_delay,
                            )
                            .map_err(|error| SynthesisError::retryable(error.to_string()))?;
                        return Ok(None);
                    }
                    self.sleeper.sleep(self.config.readiness_poll_interval).await;
                }
                Ok(EnsureOutcome::Failed { reason }) => {
                    self.fail_job(job.id, &reason).await?;
                    return Ok(None);
                }
                Err(SlotError::Retryable { message }) => {
                    return Err(SynthesisError::Retryable { message });
                }
                Err(SlotError::NotFound { message } | SlotError::Terminal { message }) => {
                    self.fail_job(job.id, &message).await?;
                    return Ok(None);
                }
            }
        }
    }

    /// Fail the job and refund its debit. Safe to call repeatedly; the
    /// ledger enforces refund idempotency.
    pub async fn fail_job(&self, job_id: JobId, reason: &str) -> Result<(), SynthesisError> {
        let now = self.clock.utc();
        match self.jobs.mark_error(job_id, reason, now).await {
            Ok(_) => {}
            Err(JobStoreError::NotFound { .. }) => return Ok(()),
            Err(error) => return Err(error.into()),
        }
        self.ledger
            .refund_by_job(job_id, "synthesis_failed")
            .await?;
        warn!(%job_id, reason, "synthesis job failed; debit refunded");
        Ok(())
    }

    /// Current job row for polling endpoints.
    pub async fn job_for_story(
        &self,
        user_id: UserId,
        voice_id: VoiceId,
        story_id: StoryId,
    ) -> Result<Option<SynthesisJob>, SynthesisError> {
        Ok(self.jobs.find_for_story(user_id, voice_id, story_id).await?)
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
