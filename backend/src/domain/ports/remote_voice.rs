//! Port for the external TTS provider.
//!
//! The adapter is stateless and safe to call concurrently. `create_voice`
//! carries no idempotency key: callers check `voice.remote_voice_id` before
//! invoking it, so a retried allocation never creates a second remote voice.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

/// Provider failures, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteVoiceError {
    /// The remote voice no longer exists (quota reclaim, TTL). Recovered by
    /// drift repair, never retried as-is.
    #[error("remote voice is missing")]
    VoiceMissing,
    /// Provider throttled the call.
    #[error("provider rate limited: {message}")]
    RateLimited { message: String },
    /// The call exceeded its deadline.
    #[error("provider call timed out: {message}")]
    Timeout { message: String },
    /// Transport-level failure or provider 5xx.
    #[error("provider transport failed: {message}")]
    Transport { message: String },
    /// The provider rejected the request terminally (4xx, bad sample).
    #[error("provider rejected the request: {message}")]
    Rejected { message: String },
}

impl RemoteVoiceError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::Transport { .. }
        )
    }
}

/// Result of a remote deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The remote side had already forgotten the voice.
    NotFound,
}

/// Port over the external TTS provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteVoiceAdapter: Send + Sync {
    /// Create a remote voice from a recorded sample; returns the remote id.
    async fn create_voice(
        &self,
        sample: &[u8],
        name: &str,
    ) -> Result<String, RemoteVoiceError>;

    /// Delete a remote voice. Missing voices report `NotFound`, not an error.
    async fn delete_voice(&self, remote_id: &str) -> Result<DeleteOutcome, RemoteVoiceError>;

    /// Synthesize `text` with the remote voice; returns encoded audio.
    async fn synthesize(&self, remote_id: &str, text: &str) -> Result<Vec<u8>, RemoteVoiceError>;
}

/// Deterministic provider fixture for tests and development wiring.
///
/// Remote ids are sequential (`rv-1`, `rv-2`, ...); synthesis returns a small
/// payload derived from the text length. Deleted or never-created remote ids
/// surface `VoiceMissing` on synthesis, which is enough to exercise drift
/// repair end to end.
#[derive(Default)]
pub struct FixtureRemoteVoiceAdapter {
    state: Mutex<FixtureState>,
}

#[derive(Default)]
struct FixtureState {
    next_id: u64,
    live: Vec<String>,
}

impl FixtureRemoteVoiceAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate the provider reclaiming a voice behind our back.
    pub fn forget(&self, remote_id: &str) {
        self.lock().live.retain(|id| id != remote_id);
    }

    /// Remote ids currently alive on the fake provider.
    pub fn live_ids(&self) -> Vec<String> {
        self.lock().live.clone()
    }
}

#[async_trait]
impl RemoteVoiceAdapter for FixtureRemoteVoiceAdapter {
    async fn create_voice(
        &self,
        _sample: &[u8],
        _name: &str,
    ) -> Result<String, RemoteVoiceError> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("rv-{}", state.next_id);
        state.live.push(id.clone());
        Ok(id)
    }

    async fn delete_voice(&self, remote_id: &str) -> Result<DeleteOutcome, RemoteVoiceError> {
        let mut state = self.lock();
        let existed = state.live.iter().any(|id| id == remote_id);
        state.live.retain(|id| id != remote_id);
        Ok(if existed {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        })
    }

    async fn synthesize(&self, remote_id: &str, text: &str) -> Result<Vec<u8>, RemoteVoiceError> {
        let state = self.lock();
        if !state.live.iter().any(|id| id == remote_id) {
            return Err(RemoteVoiceError::VoiceMissing);
        }
        Ok(format!("audio:{remote_id}:{}", text.chars().count()).into_bytes())
    }
}
