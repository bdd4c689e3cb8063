//! Port for voice persistence and the slot audit log.
//!
//! State transitions are guarded: `transition` and the convenience mutators
//! verify the current status against the state machine in
//! [`AllocationStatus::may_transition_to`] under a row lock, so concurrent
//! writers can never produce an illegal edge.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::ids::{UserId, VoiceId};
use crate::domain::voices::{AllocationStatus, Provider, SlotEvent, Voice};

/// Errors raised by voice store adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceStoreError {
    /// The referenced voice does not exist.
    #[error("voice not found: {message}")]
    NotFound { message: String },
    /// The requested transition violates the allocation state machine.
    #[error("invalid voice state: {current} cannot become {requested}")]
    InvalidState {
        current: AllocationStatus,
        requested: AllocationStatus,
    },
    /// Another voice already owns this remote id.
    #[error("remote voice id already bound: {remote_voice_id}")]
    RemoteIdTaken { remote_voice_id: String },
    /// A concurrent writer invalidated this operation; safe to retry.
    #[error("voice store conflict: {message}")]
    Conflict { message: String },
    /// Store connection could not be established.
    #[error("voice store connection failed: {message}")]
    Connection { message: String },
    /// Query or mutation failed during execution.
    #[error("voice store query failed: {message}")]
    Query { message: String },
}

impl VoiceStoreError {
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

/// Inputs for creating a voice in `recorded` state.
#[derive(Debug, Clone)]
pub struct NewVoice {
    pub id: VoiceId,
    pub user_id: UserId,
    pub name: String,
    pub provider: Provider,
    pub sample_blob_key: Option<String>,
    pub sample_bytes: i64,
}

/// Port for voice persistence.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceStore: Send + Sync {
    /// Persist a freshly uploaded voice in `recorded` state.
    async fn create(&self, voice: NewVoice, now: DateTime<Utc>) -> Result<Voice, VoiceStoreError>;

    async fn find(&self, voice_id: VoiceId) -> Result<Option<Voice>, VoiceStoreError>;

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Voice>, VoiceStoreError>;

    /// Delete the voice row. Idempotent.
    async fn delete(&self, voice_id: VoiceId) -> Result<(), VoiceStoreError>;

    /// Take the per-voice slot lock until `until`. Returns false when another
    /// holder's unexpired lock is in place; stale locks are overridden.
    async fn try_acquire_lock(
        &self,
        voice_id: VoiceId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, VoiceStoreError>;

    /// Release the slot lock. Idempotent.
    async fn release_lock(&self, voice_id: VoiceId) -> Result<(), VoiceStoreError>;

    /// Move the voice to `to` provided its current status is in
    /// `allowed_from` and the edge is legal.
    async fn transition(
        &self,
        voice_id: VoiceId,
        allowed_from: &[AllocationStatus],
        to: AllocationStatus,
        now: DateTime<Utc>,
    ) -> Result<Voice, VoiceStoreError>;

    /// Complete allocation: bind the unique remote id, set `ready`, stamp
    /// `allocated_at` and `last_used_at`.
    async fn mark_ready(
        &self,
        voice_id: VoiceId,
        remote_voice_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Voice, VoiceStoreError>;

    /// Record a terminal allocation failure.
    async fn mark_error(
        &self,
        voice_id: VoiceId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Voice, VoiceStoreError>;

    /// Drop the remote binding and move to `to` (eviction or drift repair).
    async fn clear_remote(
        &self,
        voice_id: VoiceId,
        to: AllocationStatus,
        now: DateTime<Utc>,
    ) -> Result<Voice, VoiceStoreError>;

    async fn touch_last_used(
        &self,
        voice_id: VoiceId,
        now: DateTime<Utc>,
    ) -> Result<(), VoiceStoreError>;

    /// Live count of voices in `{allocating, ready, cooling}` for a provider.
    async fn count_holding_slots(&self, provider: Provider) -> Result<u32, VoiceStoreError>;

    /// Voices eligible for eviction on voice-level criteria alone: status
    /// `ready` or `cooling`, last used before `idle_before`, slot lock free.
    async fn eviction_candidates(
        &self,
        provider: Provider,
        idle_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Voice>, VoiceStoreError>;

    async fn record_event(&self, event: &SlotEvent) -> Result<(), VoiceStoreError>;

    /// Newest audit events first.
    async fn recent_events(&self, limit: u32) -> Result<Vec<SlotEvent>, VoiceStoreError>;
}

#[derive(Default)]
struct VoiceState {
    voices: HashMap<VoiceId, Voice>,
    events: Vec<SlotEvent>,
}

/// In-memory voice store mirroring the relational adapter's guarantees.
#[derive(Default)]
pub struct InMemoryVoiceStore {
    state: Mutex<VoiceState>,
}

impl InMemoryVoiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VoiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn voice_mut<'a>(
        state: &'a mut VoiceState,
        voice_id: VoiceId,
    ) -> Result<&'a mut Voice, VoiceStoreError> {
        state
            .voices
            .get_mut(&voice_id)
            .ok_or_else(|| VoiceStoreError::not_found(format!("voice {voice_id}")))
    }

    fn guarded_transition(
        voice: &mut Voice,
        allowed_from: &[AllocationStatus],
        to: AllocationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), VoiceStoreError> {
        let current = voice.allocation_status;
        if !allowed_from.contains(&current) || !current.may_transition_to(to) {
            return Err(VoiceStoreError::InvalidState {
                current,
                requested: to,
            });
        }
        voice.allocation_status = to;
        voice.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl VoiceStore for InMemoryVoiceStore {
    async fn create(&self, voice: NewVoice, now: DateTime<Utc>) -> Result<Voice, VoiceStoreError> {
        let mut state = self.lock();
        let row = Voice {
            id: voice.id,
            user_id: voice.user_id,
            name: voice.name,
            provider: voice.provider,
            sample_blob_key: voice.sample_blob_key,
            sample_bytes: voice.sample_bytes,
            remote_voice_id: None,
            allocation_status: AllocationStatus::Recorded,
            last_used_at: None,
            allocated_at: None,
            slot_lock_expires_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        state.voices.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find(&self, voice_id: VoiceId) -> Result<Option<Voice>, VoiceStoreError> {
        Ok(self.lock().voices.get(&voice_id).cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Voice>, VoiceStoreError> {
        let state = self.lock();
        let mut voices: Vec<Voice> = state
            .voices
            .values()
            .filter(|voice| voice.user_id == user_id)
            .cloned()
            .collect();
        voices.sort_by_key(|voice| voice.created_at);
        Ok(voices)
    }

    async fn delete(&self, voice_id: VoiceId) -> Result<(), VoiceStoreError> {
        self.lock().voices.remove(&voice_id);
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        voice_id: VoiceId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, VoiceStoreError> {
        let mut state = self.lock();
        let voice = Self::voice_mut(&mut state, voice_id)?;
        if voice.is_locked(now) {
            return Ok(false);
        }
        voice.slot_lock_expires_at = Some(until);
        voice.updated_at = now;
        Ok(true)
    }

    async fn release_lock(&self, voice_id: VoiceId) -> Result<(), VoiceStoreError> {
        let mut state = self.lock();
        if let Some(voice) = state.voices.get_mut(&voice_id) {
            voice.slot_lock_expires_at = None;
        }
        Ok(())
    }

    async fn transition(
        &self,
        voice_id: VoiceId,
        allowed_from: &[AllocationStatus],
        to: AllocationStatus,
        now: DateTime<Utc>,
    ) -> Result<Voice, VoiceStoreError> {
        let mut state = self.lock();
        let voice = Self::voice_mut(&mut state, voice_id)?;
        Self::guarded_transition(voice, allowed_from, to, now)?;
        Ok(voice.clone())
    }

    async fn mark_ready(
        &self,
        voice_id: VoiceId,
        remote_voice_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Voice, VoiceStoreError> {
        let mut state = self.lock();
        let taken = state.voices.values().any(|voice| {
            voice.id != voice_id && voice.remote_voice_id.as_deref() == Some(remote_voice_id)
        });
        if taken {
            return Err(VoiceStoreError::RemoteIdTaken {
                remote_voice_id: remote_voice_id.to_string(),
            });
        }
        let voice = Self::voice_mut(&mut state, voice_id)?;
        Self::guarded_transition(
            voice,
            &[AllocationStatus::Allocating],
            AllocationStatus::Ready,
            now,
        )?;
        voice.remote_voice_id = Some(remote_voice_id.to_string());
        voice.allocated_at = Some(now);
        voice.last_used_at = Some(now);
        voice.error_message = None;
        Ok(voice.clone())
    }

    async fn mark_error(
        &self,
        voice_id: VoiceId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Voice, VoiceStoreError> {
        let mut state = self.lock();
        let voice = Self::voice_mut(&mut state, voice_id)?;
        voice.allocation_status = AllocationStatus::Error;
        voice.error_message = Some(message.to_string());
        voice.slot_lock_expires_at = None;
        voice.updated_at = now;
        Ok(voice.clone())
    }

    async fn clear_remote(
        &self,
        voice_id: VoiceId,
        to: AllocationStatus,
        now: DateTime<Utc>,
    ) -> Result<Voice, VoiceStoreError> {
        let mut state = self.lock();
        let voice = Self::voice_mut(&mut state, voice_id)?;
        let current = voice.allocation_status;
        if !current.may_transition_to(to) {
            return Err(VoiceStoreError::InvalidState {
                current,
                requested: to,
            });
        }
        voice.remote_voice_id = None;
        voice.allocated_at = None;
        voice.allocation_status = to;
        voice.updated_at = now;
        Ok(voice.clone())
    }

    async fn touch_last_used(
        &self,
        voice_id: VoiceId,
        now: DateTime<Utc>,
    ) -> Result<(), VoiceStoreError> {
        let mut state = self.lock();
        let voice = Self::voice_mut(&mut state, voice_id)?;
        voice.last_used_at = Some(now);
        voice.updated_at = now;
        Ok(())
    }

    async fn count_holding_slots(&self, provider: Provider) -> Result<u32, VoiceStoreError> {
        let state = self.lock();
        let count = state
            .voices
            .values()
            .filter(|voice| voice.provider == provider && voice.allocation_status.holds_slot())
            .count();
        Ok(count as u32)
    }

    async fn eviction_candidates(
        &self,
        provider: Provider,
        idle_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Voice>, VoiceStoreError> {
        let state = self.lock();
        let mut candidates: Vec<Voice> = state
            .voices
            .values()
            .filter(|voice| {
                voice.provider == provider
                    && matches!(
                        voice.allocation_status,
                        AllocationStatus::Ready | AllocationStatus::Cooling
                    )
                    && voice.last_used_at.is_some_and(|at| at < idle_before)
                    && !voice.is_locked(now)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|voice| voice.last_used_at);
        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn record_event(&self, event: &SlotEvent) -> Result<(), VoiceStoreError> {
        self.lock().events.push(event.clone());
        Ok(())
    }

    async fn recent_events(&self, limit: u32) -> Result<Vec<SlotEvent>, VoiceStoreError> {
        let state = self.lock();
        Ok(state
            .events
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
