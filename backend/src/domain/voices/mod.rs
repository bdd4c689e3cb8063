//! Voice entities: recorded samples, remote slot bindings, and the slot
//! audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::domain::ids::{EventId, UserId, VoiceId};

mod service;

pub use service::VoiceService;

/// Remote TTS provider hosting a voice slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Primary,
    Secondary,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    pub const ALL: [Provider; 2] = [Self::Primary, Self::Secondary];
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Where a voice stands in the slot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// Sample uploaded; no remote slot.
    Recorded,
    /// A worker is creating the remote voice.
    Allocating,
    /// Remote voice exists and can synthesize.
    Ready,
    /// Recently used; still holds its slot inside the warm-hold window.
    Cooling,
    /// Slot reclaimed; remote voice deleted.
    Evicted,
    /// Allocation failed terminally.
    Error,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recorded => "recorded",
            Self::Allocating => "allocating",
            Self::Ready => "ready",
            Self::Cooling => "cooling",
            Self::Evicted => "evicted",
            Self::Error => "error",
        }
    }

    /// Whether the voice occupies a remote slot in this status.
    pub fn holds_slot(&self) -> bool {
        matches!(self, Self::Allocating | Self::Ready | Self::Cooling)
    }

    /// Legal state-machine edges. Anything else is an `InvalidState` error at
    /// the store boundary.
    pub fn may_transition_to(&self, next: AllocationStatus) -> bool {
        use AllocationStatus::{Allocating, Cooling, Error, Evicted, Ready, Recorded};
        matches!(
            (self, next),
            (Recorded, Allocating)
                | (Recorded, Error)
                | (Allocating, Ready)
                | (Allocating, Error)
                | (Allocating, Recorded)
                | (Ready, Cooling)
                | (Ready, Evicted)
                | (Ready, Recorded)
                | (Cooling, Ready)
                | (Cooling, Evicted)
                | (Cooling, Recorded)
                | (Evicted, Allocating)
                | (Evicted, Recorded)
                | (Error, Recorded)
        )
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "recorded" => Ok(Self::Recorded),
            "allocating" => Ok(Self::Allocating),
            "ready" => Ok(Self::Ready),
            "cooling" => Ok(Self::Cooling),
            "evicted" => Ok(Self::Evicted),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown allocation status: {other}")),
        }
    }
}

/// A user's recorded voice sample and its remote-slot binding.
///
/// `remote_voice_id` is unique across voices while populated; eviction clears
/// it, removing the row from the uniqueness constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Voice {
    pub id: VoiceId,
    pub user_id: UserId,
    pub name: String,
    pub provider: Provider,
    pub sample_blob_key: Option<String>,
    pub sample_bytes: i64,
    pub remote_voice_id: Option<String>,
    pub allocation_status: AllocationStatus,
    pub last_used_at: Option<DateTime<Utc>>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub slot_lock_expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Voice {
    /// Whether the per-voice slot lock is currently held.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.slot_lock_expires_at.is_some_and(|at| at > now)
    }
}

/// Audit event types for the slot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SlotEventType {
    Queued,
    AllocationStarted,
    AllocationCompleted,
    AllocationFailed,
    Evicted,
    LockReleased,
    DriftRepaired,
}

impl SlotEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::AllocationStarted => "allocation_started",
            Self::AllocationCompleted => "allocation_completed",
            Self::AllocationFailed => "allocation_failed",
            Self::Evicted => "evicted",
            Self::LockReleased => "lock_released",
            Self::DriftRepaired => "drift_repaired",
        }
    }
}

impl FromStr for SlotEventType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(Self::Queued),
            "allocation_started" => Ok(Self::AllocationStarted),
            "allocation_completed" => Ok(Self::AllocationCompleted),
            "allocation_failed" => Ok(Self::AllocationFailed),
            "evicted" => Ok(Self::Evicted),
            "lock_released" => Ok(Self::LockReleased),
            "drift_repaired" => Ok(Self::DriftRepaired),
            other => Err(format!("unknown slot event type: {other}")),
        }
    }
}

/// One row of the slot audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SlotEvent {
    pub id: EventId,
    pub voice_id: VoiceId,
    pub user_id: UserId,
    pub event_type: SlotEventType,
    pub reason: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl SlotEvent {
    pub fn new(
        voice_id: VoiceId,
        user_id: UserId,
        event_type: SlotEventType,
        reason: impl Into<String>,
        metadata: Option<Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::random(),
            voice_id,
            user_id,
            event_type,
            reason: reason.into(),
            metadata,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::allocate_recorded(AllocationStatus::Recorded, AllocationStatus::Allocating, true)]
    #[case::complete(AllocationStatus::Allocating, AllocationStatus::Ready, true)]
    #[case::cool_down(AllocationStatus::Ready, AllocationStatus::Cooling, true)]
    #[case::rewarm(AllocationStatus::Cooling, AllocationStatus::Ready, true)]
    #[case::evict_ready(AllocationStatus::Ready, AllocationStatus::Evicted, true)]
    #[case::drift(AllocationStatus::Ready, AllocationStatus::Recorded, true)]
    #[case::reuse_evicted(AllocationStatus::Evicted, AllocationStatus::Allocating, true)]
    #[case::ready_cannot_reallocate(AllocationStatus::Ready, AllocationStatus::Allocating, false)]
    #[case::evicted_cannot_complete(AllocationStatus::Evicted, AllocationStatus::Ready, false)]
    #[case::error_is_terminal_for_allocation(AllocationStatus::Error, AllocationStatus::Ready, false)]
    fn transition_table(
        #[case] from: AllocationStatus,
        #[case] to: AllocationStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.may_transition_to(to), allowed);
    }

    #[rstest]
    #[case(AllocationStatus::Allocating, true)]
    #[case(AllocationStatus::Ready, true)]
    #[case(AllocationStatus::Cooling, true)]
    #[case(AllocationStatus::Recorded, false)]
    #[case(AllocationStatus::Evicted, false)]
    #[case(AllocationStatus::Error, false)]
    fn slot_occupancy(#[case] status: AllocationStatus, #[case] holds: bool) {
        assert_eq!(status.holds_slot(), holds);
    }

    #[rstest]
    fn round_trips_status_names() {
        for status in [
            AllocationStatus::Recorded,
            AllocationStatus::Allocating,
            AllocationStatus::Ready,
            AllocationStatus::Cooling,
            AllocationStatus::Evicted,
            AllocationStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<AllocationStatus>(), Ok(status));
        }
    }
}
