//! Elastic voice slot manager.
//!
//! Keeps at most `slot_limit` voices holding a remote slot per provider,
//! queues requests under saturation, reclaims idle slots, and repairs drift
//! between local state and the remote provider. Pure data mutations live in
//! the stores; remote calls live in the provider adapter; this service
//! composes them under the per-voice slot lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use mockable::Clock;
use serde_json::json;
use tracing::{info, warn};

use crate::domain::config::AppConfig;
use crate::domain::ids::{UserId, VoiceId};
use crate::domain::ports::{
    ArtifactStore, ArtifactStoreError, DeleteOutcome, JobStore, JobStoreError, LedgerStore,
    LedgerStoreError, QueueEntry, RemoteVoiceAdapter, SlotQueue, SlotQueueError, TaskDispatcher,
    VoiceStore, VoiceStoreError, WorkerTask,
};
use crate::domain::voices::{AllocationStatus, Provider, SlotEvent, SlotEventType, Voice};

mod eviction;

pub use eviction::{order_candidates, EvictionCandidate};

/// Slot manager configuration.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    pub slot_limit: u32,
    pub warm_hold: Duration,
    pub slot_lock_ttl: Duration,
    pub max_dispatch_per_cycle: u32,
}

impl SlotConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            slot_limit: config.slot_limit,
            warm_hold: config.warm_hold,
            slot_lock_ttl: config.slot_lock_ttl,
            max_dispatch_per_cycle: config.max_dispatch_per_cycle,
        }
    }
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// Outcome of [`SlotManager::ensure_active`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The voice holds a live remote slot; `last_used_at` was refreshed.
    Ready { remote_voice_id: String },
    /// Allocation is in flight or was just dispatched.
    Allocating { queue_position: Option<u32> },
    /// No capacity; the voice waits in the queue.
    Queued {
        queue_position: u32,
        queue_length: u32,
    },
    /// The voice cannot be allocated.
    Failed { reason: String },
}

/// Slot manager failures, classified for the worker retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    Retryable { message: String },
    #[error("{message}")]
    Terminal { message: String },
}

impl SlotError {
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

impl From<VoiceStoreError> for SlotError {
    fn from(error: VoiceStoreError) -> Self {
        match error {
            VoiceStoreError::NotFound { message } => Self::NotFound { message },
            VoiceStoreError::Conflict { message } | VoiceStoreError::Connection { message } => {
                Self::Retryable { message }
            }
            VoiceStoreError::InvalidState { .. } => Self::Retryable {
                message: error.to_string(),
            },
            VoiceStoreError::RemoteIdTaken { .. } | VoiceStoreError::Query { .. } => {
                Self::Terminal {
                    message: error.to_string(),
                }
            }
        }
    }
}

impl From<SlotQueueError> for SlotError {
    fn from(error: SlotQueueError) -> Self {
        Self::Retryable {
            message: error.to_string(),
        }
    }
}

impl From<JobStoreError> for SlotError {
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

impl From<LedgerStoreError> for SlotError {
    fn from(error: LedgerStoreError) -> Self {
        match error {
            LedgerStoreError::Conflict { message } | LedgerStoreError::Connection { message } => {
                Self::Retryable { message }
            }
            other => Self::Terminal {
                message: other.to_string(),
            },
        }
    }
}

/// Per-provider figures for the operational status view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSlotStatus {
    pub provider: Provider,
    pub active: u32,
    pub slot_limit: u32,
    pub queue_length: u32,
    pub queued: Vec<QueueEntry>,
}

/// Aggregate operational view for the admin endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotsStatus {
    pub providers: Vec<ProviderSlotStatus>,
    pub recent_events: Vec<SlotEvent>,
}

/// The slot manager service.
pub struct SlotManager {
    voices: Arc<dyn VoiceStore>,
    queue: Arc<dyn SlotQueue>,
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn LedgerStore>,
    adapter: Arc<dyn RemoteVoiceAdapter>,
    blobs: Arc<dyn ArtifactStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    clock: Arc<dyn Clock>,
    config: SlotConfig,
}

/// Dependency bundle for the slot manager.
pub struct SlotManagerPorts {
    pub voices: Arc<dyn VoiceStore>,
    pub queue: Arc<dyn SlotQueue>,
    pub jobs: Arc<dyn JobStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub adapter: Arc<dyn RemoteVoiceAdapter>,
    pub blobs: Arc<dyn ArtifactStore>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
}

impl SlotManager {
    pub fn new(ports: SlotManagerPorts, clock: Arc<dyn Clock>, config: SlotConfig) -> Self {
        Self {
            voices: ports.voices,
            queue: ports.queue,
            jobs: ports.jobs,
            ledger: ports.ledger,
            adapter: ports.adapter,
            blobs: ports.blobs,
            dispatcher: ports.dispatcher,
            clock,
            config,
        }
    }

    fn deadline(&self, now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
        now + TimeDelta::from_std(after).unwrap_or(TimeDelta::MAX)
    }

    async fn record_event(
        &self,
        voice: &Voice,
        event_type: SlotEventType,
        reason: &str,
        metadata: Option<serde_json::Value>,
    ) {
        let event = SlotEvent::new(
            voice.id,
            voice.user_id,
            event_type,
            reason,
            metadata,
            self.clock.utc(),
        );
        // The audit log must never abort slot work.
        if let Err(error) = self.voices.record_event(&event).await {
            warn!(voice_id = %voice.id, %error, "failed to record slot event");
        }
    }

    /// Ensure the voice holds (or is on its way to) a remote slot.
    ///
    /// The only entry point used by the synthesis orchestrator; callers may
    /// invoke it repeatedly and concurrently for the same voice.
    pub async fn ensure_active(
        &self,
        user_id: UserId,
        voice_id: VoiceId,
    ) -> Result<EnsureOutcome, SlotError> {
        let now = self.clock.utc();
        let voice = self
            .voices
            .find(voice_id)
            .await?
            .ok_or_else(|| SlotError::not_found(format!("voice {voice_id} not found")))?;
        if voice.user_id != user_id {
            // Scoped to another user; indistinguishable from absent.
            return Err(SlotError::not_found(format!("voice {voice_id} not found")));
        }

        if voice.allocation_status == AllocationStatus::Error {
            return Ok(EnsureOutcome::Failed {
                reason: voice
                    .error_message
                    .unwrap_or_else(|| "voice is in error state".to_string()),
            });
        }
        if voice.sample_blob_key.is_none() && voice.remote_voice_id.is_none() {
            return Ok(EnsureOutcome::Failed {
                reason: "voice sample is missing; re-upload the recording".to_string(),
            });
        }

        if let Some(remote_voice_id) = voice.remote_voice_id.clone() {
            if matches!(
                voice.allocation_status,
                AllocationStatus::Ready | AllocationStatus::Cooling
            ) {
                if voice.allocation_status == AllocationStatus::Cooling {
                    self.voices
                        .transition(
                            voice_id,
                            &[AllocationStatus::Cooling],
                            AllocationStatus::Ready,
                            now,
                        )
                        .await?;
                }
                self.voices.touch_last_used(voice_id, now).await?;
                return Ok(EnsureOutcome::Ready { remote_voice_id });
            }
        }

        if voice.allocation_status == AllocationStatus::Allocating {
            return Ok(EnsureOutcome::Allocating {
                queue_position: self.queue.position(voice_id).await?,
            });
        }

        if let Some(queue_position) = self.queue.position(voice_id).await? {
            return Ok(EnsureOutcome::Queued {
                queue_position,
                queue_length: self.queue.len(voice.provider).await?,
            });
        }

        // Cold voice: allocate or queue under the per-voice lock.
        let until = self.deadline(now, self.config.slot_lock_ttl);
        if !self.voices.try_acquire_lock(voice_id, until, now).await? {
            // Another request holds the lock and is driving this voice.
            return Ok(EnsureOutcome::Allocating {
                queue_position: None,
            });
        }
        let outcome = self.start_allocation_locked(&voice, now).await;
        if let Err(error) = self.voices.release_lock(voice_id).await {
            warn!(voice_id = %voice_id, %error, "failed to release slot lock");
        }
        outcome
    }

    async fn start_allocation_locked(
        &self,
        voice: &Voice,
        now: DateTime<Utc>,
    ) -> Result<EnsureOutcome, SlotError> {
        let active = self.voices.count_holding_slots(voice.provider).await?;
        if active < self.config.slot_limit {
            self.voices
                .transition(
                    voice.id,
                    &[AllocationStatus::Recorded, AllocationStatus::Evicted],
                    AllocationStatus::Allocating,
                    now,
                )
                .await?;
            self.record_event(
                voice,
                SlotEventType::AllocationStarted,
                "ensure_active",
                Some(json!({ "active": active, "slot_limit": self.config.slot_limit })),
            )
            .await;
            self.dispatcher
                .dispatch(WorkerTask::Allocate { voice_id: voice.id })
                .map_err(|error| SlotError::retryable(error.to_string()))?;
            info!(voice_id = %voice.id, provider = %voice.provider, "allocation dispatched");
            return Ok(EnsureOutcome::Allocating {
                queue_position: None,
            });
        }

        let queue_position = self
            .queue
            .enqueue(QueueEntry {
                voice_id: voice.id,
                user_id: voice.user_id,
                provider: voice.provider,
                enqueued_at: now,
                attempts: 0,
            })
            .await?;
        let queue_length = self.queue.len(voice.provider).await?;
        self.record_event(
            voice,
            SlotEventType::Queued,
            "slot_limit_reached",
            Some(json!({ "queue_position": queue_position, "queue_length": queue_length })),
        )
        .await;
        // Nudge the drain in case capacity freed up since the count; the
        // periodic beat covers the case where this dispatch is lost.
        if let Err(error) = self.dispatcher.dispatch(WorkerTask::ProcessQueue {
            provider: voice.provider,
        }) {
            warn!(voice_id = %voice.id, %error, "could not trigger queue drain");
        }
        info!(
            voice_id = %voice.id,
            provider = %voice.provider,
            queue_position,
            "voice queued for slot"
        );
        Ok(EnsureOutcome::Queued {
            queue_position,
            queue_length,
        })
    }

    /// Worker-side allocation: create the remote voice under the slot lock.
    ///
    /// Retryable failures bubble up so the worker runtime re-dispatches with
    /// backoff; terminal failures mark the voice `error` and return `Ok`.
    pub async fn allocate(&self, voice_id: VoiceId) -> Result<(), SlotError> {
        let now = self.clock.utc();
        let until = self.deadline(now, self.config.slot_lock_ttl);
        if !self.voices.try_acquire_lock(voice_id, until, now).await? {
            return Err(SlotError::retryable(format!(
                "voice {voice_id} is locked by another allocator"
            )));
        }
        let outcome = self.allocate_locked(voice_id).await;
        if let Err(error) = self.voices.release_lock(voice_id).await {
            warn!(voice_id = %voice_id, %error, "failed to release slot lock");
        }
        outcome
    }

    async fn allocate_locked(&self, voice_id: VoiceId) -> Result<(), SlotError> {
        let now = self.clock.utc();
        let Some(voice) = self.voices.find(voice_id).await? else {
            // Deleted while queued; nothing to do.
            return Ok(());
        };

        if voice.allocation_status == AllocationStatus::Ready && voice.remote_voice_id.is_some() {
            return Ok(());
        }
        if !matches!(
            voice.allocation_status,
            AllocationStatus::Allocating | AllocationStatus::Recorded
        ) {
            // Evicted or errored since dispatch; the queue tolerates stale
            // entries, so skip quietly.
            return Ok(());
        }
        if voice.allocation_status == AllocationStatus::Recorded {
            self.voices
                .transition(
                    voice_id,
                    &[AllocationStatus::Recorded],
                    AllocationStatus::Allocating,
                    now,
                )
                .await?;
        }

        if let Some(remote_voice_id) = voice.remote_voice_id.clone() {
            // A previous attempt created the remote voice but crashed before
            // completing; finish the bookkeeping instead of creating again.
            self.voices.mark_ready(voice_id, &remote_voice_id, now).await?;
            self.record_event(
                &voice,
                SlotEventType::AllocationCompleted,
                "resumed_existing_remote",
                None,
            )
            .await;
            return Ok(());
        }

        let Some(sample_blob_key) = voice.sample_blob_key.clone() else {
            let message = "voice sample is missing";
            self.voices.mark_error(voice_id, message, now).await?;
            self.record_event(&voice, SlotEventType::AllocationFailed, message, None)
                .await;
            return Ok(());
        };

        let sample = match self.blobs.read(&sample_blob_key, None).await {
            Ok(chunk) => chunk.bytes,
            Err(ArtifactStoreError::NotFound { .. }) => {
                let message = "voice sample blob is gone";
                self.voices.mark_error(voice_id, message, now).await?;
                self.record_event(&voice, SlotEventType::AllocationFailed, message, None)
                    .await;
                return Ok(());
            }
            Err(error) => return Err(SlotError::retryable(error.to_string())),
        };

        match self.adapter.create_voice(&sample, &voice.name).await {
            Ok(remote_voice_id) => {
                let now = self.clock.utc();
                match self.voices.mark_ready(voice_id, &remote_voice_id, now).await {
                    Ok(_) => {
                        self.record_event(
                            &voice,
                            SlotEventType::AllocationCompleted,
                            "remote_voice_created",
                            Some(json!({ "remote_voice_id": remote_voice_id })),
                        )
                        .await;
                        info!(voice_id = %voice_id, %remote_voice_id, "voice allocated");
                        Ok(())
                    }
                    Err(VoiceStoreError::InvalidState { .. }) => {
                        // Another worker finished first; drop the extra
                        // remote voice so the pool does not leak a slot.
                        if let Err(error) = self.adapter.delete_voice(&remote_voice_id).await {
                            warn!(%remote_voice_id, %error, "failed to delete surplus remote voice");
                        }
                        Ok(())
                    }
                    Err(error) => Err(error.into()),
                }
            }
            Err(error) if error.is_retryable() => Err(SlotError::retryable(error.to_string())),
            Err(error) => {
                let message = error.to_string();
                self.voices.mark_error(voice_id, &message, now).await?;
                self.record_event(&voice, SlotEventType::AllocationFailed, &message, None)
                    .await;
                warn!(voice_id = %voice_id, %message, "allocation failed terminally");
                Ok(())
            }
        }
    }

    /// Dead-letter handler: mark the voice failed after retries ran out.
    pub async fn fail_allocation(&self, voice_id: VoiceId, message: &str) -> Result<(), SlotError> {
        let now = self.clock.utc();
        let Some(voice) = self.voices.find(voice_id).await? else {
            return Ok(());
        };
        self.voices.mark_error(voice_id, message, now).await?;
        self.record_event(&voice, SlotEventType::AllocationFailed, message, None)
            .await;
        Ok(())
    }

    /// Beat-driven queue drain. Returns the number of entries dispatched.
    pub async fn process_queue(&self, provider: Provider) -> Result<u32, SlotError> {
        let mut dispatched = 0_u32;
        for _ in 0..self.config.max_dispatch_per_cycle {
            let active = self.voices.count_holding_slots(provider).await?;
            if active >= self.config.slot_limit {
                break;
            }
            let Some(entry) = self.queue.pop_ready(provider, 1).await?.into_iter().next()
            else {
                break;
            };
            match self.ensure_active(entry.user_id, entry.voice_id).await {
                Ok(EnsureOutcome::Allocating { .. } | EnsureOutcome::Ready { .. }) => {
                    dispatched += 1;
                }
                Ok(EnsureOutcome::Queued { .. }) => {
                    // Capacity evaporated between the count and the lock;
                    // the entry is back in the queue.
                    break;
                }
                Ok(EnsureOutcome::Failed { reason }) => {
                    warn!(voice_id = %entry.voice_id, reason, "dropping unallocatable queue entry");
                }
                Err(SlotError::NotFound { .. }) => {
                    // Voice deleted while waiting; the entry is already gone.
                }
                Err(error) => {
                    // Put the entry back for the next beat before surfacing.
                    let _ = self.queue.enqueue(entry).await;
                    return Err(error);
                }
            }
        }
        Ok(dispatched)
    }

    /// Beat-driven idle reclaim. Returns the number of voices evicted.
    pub async fn reclaim_idle(&self, provider: Provider) -> Result<u32, SlotError> {
        let now = self.clock.utc();
        let queue_length = self.queue.len(provider).await?;
        if queue_length == 0 {
            return Ok(0);
        }

        let active = self.voices.count_holding_slots(provider).await?;
        let free = self.config.slot_limit.saturating_sub(active);
        let needed = queue_length.min(self.config.slot_limit).saturating_sub(free);
        if needed == 0 {
            // Capacity already exists; just drain.
            if let Err(error) = self.dispatcher.dispatch(WorkerTask::ProcessQueue { provider }) {
                warn!(%error, "could not trigger queue drain after reclaim check");
            }
            return Ok(0);
        }

        let idle_before = now - TimeDelta::from_std(self.config.warm_hold).unwrap_or(TimeDelta::MAX);
        let raw = self
            .voices
            .eviction_candidates(provider, idle_before, now, needed.saturating_mul(4).max(16))
            .await?;

        let mut candidates = Vec::with_capacity(raw.len());
        for voice in raw {
            if self.jobs.exists_processing_for_voice(voice.id).await? {
                continue;
            }
            let owner_balance = self
                .ledger
                .snapshot(voice.user_id, now)
                .await
                .map(|snapshot| snapshot.cached_balance)
                .unwrap_or_default();
            candidates.push(EvictionCandidate {
                voice,
                owner_balance,
            });
        }

        let mut evicted = 0_u32;
        for candidate in order_candidates(candidates) {
            if evicted >= needed {
                break;
            }
            if self.evict_one(&candidate.voice).await? {
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(provider = %provider, evicted, queue_length, "idle slots reclaimed");
            if let Err(error) = self.dispatcher.dispatch(WorkerTask::ProcessQueue { provider }) {
                warn!(%error, "could not trigger queue drain after reclaim");
            }
        }
        Ok(evicted)
    }

    async fn evict_one(&self, voice: &Voice) -> Result<bool, SlotError> {
        let now = self.clock.utc();
        let until = self.deadline(now, self.config.slot_lock_ttl);
        if !self.voices.try_acquire_lock(voice.id, until, now).await? {
            return Ok(false);
        }
        let result = self.evict_locked(voice).await;
        if let Err(error) = self.voices.release_lock(voice.id).await {
            warn!(voice_id = %voice.id, %error, "failed to release slot lock");
        }
        result
    }

    async fn evict_locked(&self, voice: &Voice) -> Result<bool, SlotError> {
        let now = self.clock.utc();
        // Re-verify eligibility under the lock.
        let Some(current) = self.voices.find(voice.id).await? else {
            return Ok(false);
        };
        let idle_before = now - TimeDelta::from_std(self.config.warm_hold).unwrap_or(TimeDelta::MAX);
        let still_idle = current.last_used_at.is_some_and(|at| at < idle_before);
        if !matches!(
            current.allocation_status,
            AllocationStatus::Ready | AllocationStatus::Cooling
        ) || !still_idle
        {
            return Ok(false);
        }

        if let Some(remote_voice_id) = current.remote_voice_id.clone() {
            match self.adapter.delete_voice(&remote_voice_id).await {
                Ok(DeleteOutcome::Deleted | DeleteOutcome::NotFound) => {}
                Err(error) if error.is_retryable() => {
                    warn!(voice_id = %voice.id, %error, "remote delete failed; deferring eviction");
                    return Ok(false);
                }
                Err(error) => {
                    warn!(voice_id = %voice.id, %error, "remote delete rejected; evicting locally");
                }
            }
        }

        self.voices
            .clear_remote(voice.id, AllocationStatus::Evicted, now)
            .await?;
        self.record_event(
            voice,
            SlotEventType::Evicted,
            "idle_reclaim",
            Some(json!({ "last_used_at": current.last_used_at })),
        )
        .await;
        Ok(true)
    }

    /// Recover from the remote provider forgetting a voice: clear the
    /// binding, return the voice to `recorded`, and re-enqueue it.
    pub async fn repair_drift(&self, voice_id: VoiceId) -> Result<(), SlotError> {
        let now = self.clock.utc();
        let Some(voice) = self.voices.find(voice_id).await? else {
            return Ok(());
        };
        self.voices
            .clear_remote(voice_id, AllocationStatus::Recorded, now)
            .await?;
        self.queue
            .enqueue(QueueEntry {
                voice_id,
                user_id: voice.user_id,
                provider: voice.provider,
                enqueued_at: now,
                attempts: 0,
            })
            .await?;
        self.record_event(&voice, SlotEventType::DriftRepaired, "remote_voice_missing", None)
            .await;
        warn!(voice_id = %voice_id, "remote voice drifted; re-queued for allocation");
        if let Err(error) = self.dispatcher.dispatch(WorkerTask::ProcessQueue {
            provider: voice.provider,
        }) {
            warn!(%error, "could not trigger queue drain after drift repair");
        }
        Ok(())
    }

    /// Voice-deletion cleanup: drop the queue entry and release the remote
    /// slot. The caller removes rows and artifacts afterwards.
    pub async fn release_voice(&self, voice: &Voice) -> Result<(), SlotError> {
        self.queue.remove(voice.id).await?;
        if let Some(remote_voice_id) = &voice.remote_voice_id {
            match self.adapter.delete_voice(remote_voice_id).await {
                Ok(_) => {}
                Err(error) => {
                    warn!(voice_id = %voice.id, %error, "remote delete failed during voice deletion");
                }
            }
        }
        self.record_event(voice, SlotEventType::LockReleased, "voice_deleted", None)
            .await;
        Ok(())
    }

    /// Operational view for the admin endpoint.
    pub async fn status(&self) -> Result<SlotsStatus, SlotError> {
        let mut providers = Vec::with_capacity(Provider::ALL.len());
        for provider in Provider::ALL {
            providers.push(ProviderSlotStatus {
                provider,
                active: self.voices.count_holding_slots(provider).await?,
                slot_limit: self.config.slot_limit,
                queue_length: self.queue.len(provider).await?,
                queued: self.queue.peek(provider, 10).await?,
            });
        }
        Ok(SlotsStatus {
            providers,
            recent_events: self.voices.recent_events(50).await?,
        })
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
