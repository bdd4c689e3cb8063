//! Port for the durable slot allocation queue.
//!
//! FIFO per provider, ordered by enqueue time with insertion order breaking
//! ties. The queue survives restarts and delivers at least once; consumers
//! tolerate duplicates through `allocation_status` checks.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::ids::{UserId, VoiceId};
use crate::domain::voices::Provider;

/// Errors raised by slot queue adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotQueueError {
    /// Queue backend connection could not be established.
    #[error("slot queue connection failed: {message}")]
    Connection { message: String },
    /// Queue operation failed during execution.
    #[error("slot queue operation failed: {message}")]
    Query { message: String },
}

impl SlotQueueError {
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

/// A pending allocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub voice_id: VoiceId,
    pub user_id: UserId,
    pub provider: Provider,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: i32,
}

/// Port for the durable waiting queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SlotQueue: Send + Sync {
    /// Append an entry, or return the existing 1-indexed position when the
    /// voice is already queued.
    async fn enqueue(&self, entry: QueueEntry) -> Result<u32, SlotQueueError>;

    /// Inspect up to `n` oldest entries without removing them.
    async fn peek(&self, provider: Provider, n: u32) -> Result<Vec<QueueEntry>, SlotQueueError>;

    /// Remove and return up to `capacity` oldest entries.
    async fn pop_ready(
        &self,
        provider: Provider,
        capacity: u32,
    ) -> Result<Vec<QueueEntry>, SlotQueueError>;

    /// Remove a voice from the queue. Idempotent.
    async fn remove(&self, voice_id: VoiceId) -> Result<(), SlotQueueError>;

    async fn len(&self, provider: Provider) -> Result<u32, SlotQueueError>;

    /// 1-indexed FIFO rank of a queued voice.
    async fn position(&self, voice_id: VoiceId) -> Result<Option<u32>, SlotQueueError>;
}

/// In-memory queue fixture preserving FIFO and de-duplication semantics.
#[derive(Default)]
pub struct InMemorySlotQueue {
    entries: Mutex<Vec<QueueEntry>>,
}

impl InMemorySlotQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<QueueEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn position_in(entries: &[QueueEntry], voice_id: VoiceId) -> Option<u32> {
        let target = entries.iter().find(|entry| entry.voice_id == voice_id)?;
        let rank = entries
            .iter()
            .filter(|entry| entry.provider == target.provider)
            .position(|entry| entry.voice_id == voice_id)?;
        Some(rank as u32 + 1)
    }
}

#[async_trait]
impl SlotQueue for InMemorySlotQueue {
    async fn enqueue(&self, entry: QueueEntry) -> Result<u32, SlotQueueError> {
        let mut entries = self.lock();
        if let Some(position) = Self::position_in(&entries, entry.voice_id) {
            return Ok(position);
        }
        entries.push(entry.clone());
        entries.sort_by_key(|queued| queued.enqueued_at);
        Ok(Self::position_in(&entries, entry.voice_id)
            .unwrap_or_else(|| entries.len() as u32))
    }

    async fn peek(&self, provider: Provider, n: u32) -> Result<Vec<QueueEntry>, SlotQueueError> {
        let entries = self.lock();
        Ok(entries
            .iter()
            .filter(|entry| entry.provider == provider)
            .take(n as usize)
            .cloned()
            .collect())
    }

    async fn pop_ready(
        &self,
        provider: Provider,
        capacity: u32,
    ) -> Result<Vec<QueueEntry>, SlotQueueError> {
        let mut entries = self.lock();
        let mut popped = Vec::new();
        let mut remaining = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if entry.provider == provider && (popped.len() as u32) < capacity {
                popped.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        *entries = remaining;
        Ok(popped)
    }

    async fn remove(&self, voice_id: VoiceId) -> Result<(), SlotQueueError> {
        self.lock().retain(|entry| entry.voice_id != voice_id);
        Ok(())
    }

    async fn len(&self, provider: Provider) -> Result<u32, SlotQueueError> {
        let entries = self.lock();
        Ok(entries
            .iter()
            .filter(|entry| entry.provider == provider)
            .count() as u32)
    }

    async fn position(&self, voice_id: VoiceId) -> Result<Option<u32>, SlotQueueError> {
        Ok(Self::position_in(&self.lock(), voice_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 8, minute, 0)
            .single()
            .expect("valid time")
    }

    fn entry(provider: Provider, minute: u32) -> QueueEntry {
        QueueEntry {
            voice_id: VoiceId::random(),
            user_id: UserId::random(),
            provider,
            enqueued_at: at(minute),
            attempts: 0,
        }
    }

    #[rstest]
    #[tokio::test]
    async fn enqueue_is_fifo_and_deduplicates() {
        let queue = InMemorySlotQueue::new();
        let first = entry(Provider::Primary, 1);
        let second = entry(Provider::Primary, 2);

        assert_eq!(queue.enqueue(first.clone()).await.expect("enqueue"), 1);
        assert_eq!(queue.enqueue(second.clone()).await.expect("enqueue"), 2);
        assert_eq!(
            queue.enqueue(first.clone()).await.expect("enqueue"),
            1,
            "re-enqueue returns the existing position"
        );
        assert_eq!(queue.len(Provider::Primary).await.expect("len"), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn pop_ready_takes_oldest_entries_per_provider() {
        let queue = InMemorySlotQueue::new();
        let old = entry(Provider::Primary, 1);
        let other = entry(Provider::Secondary, 2);
        let newer = entry(Provider::Primary, 3);
        for item in [&old, &other, &newer] {
            queue.enqueue(item.clone()).await.expect("enqueue");
        }

        let popped = queue.pop_ready(Provider::Primary, 1).await.expect("pop");

        assert_eq!(popped, vec![old]);
        assert_eq!(queue.len(Provider::Primary).await.expect("len"), 1);
        assert_eq!(queue.len(Provider::Secondary).await.expect("len"), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn positions_are_one_indexed_per_provider() {
        let queue = InMemorySlotQueue::new();
        let primary = entry(Provider::Primary, 1);
        let secondary = entry(Provider::Secondary, 2);
        queue.enqueue(primary.clone()).await.expect("enqueue");
        queue.enqueue(secondary.clone()).await.expect("enqueue");

        assert_eq!(queue.position(primary.voice_id).await.expect("pos"), Some(1));
        assert_eq!(queue.position(secondary.voice_id).await.expect("pos"), Some(1));
        assert_eq!(queue.position(VoiceId::random()).await.expect("pos"), None);
    }

    #[rstest]
    #[tokio::test]
    async fn remove_is_idempotent() {
        let queue = InMemorySlotQueue::new();
        let queued = entry(Provider::Primary, 1);
        queue.enqueue(queued.clone()).await.expect("enqueue");

        queue.remove(queued.voice_id).await.expect("remove");
        queue.remove(queued.voice_id).await.expect("remove again");

        assert_eq!(queue.len(Provider::Primary).await.expect("len"), 0);
    }
}
