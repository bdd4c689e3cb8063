//! Voice lifecycle service: upload, inspection, and deletion cleanup.

use std::sync::Arc;

use mockable::Clock;
use tracing::{info, warn};

use crate::domain::error::Error;
use crate::domain::ids::{UserId, VoiceId};
use crate::domain::ports::{
    ArtifactStore, JobStore, NewVoice, SlotQueue, VoiceStore, VoiceStoreError,
};
use crate::domain::slots::SlotManager;
use crate::domain::voices::{Provider, Voice};

fn map_store_error(error: VoiceStoreError) -> Error {
    match error {
        VoiceStoreError::NotFound { message } => Error::not_found(message),
        VoiceStoreError::Conflict { message } | VoiceStoreError::Connection { message } => {
            Error::service_unavailable(message)
        }
        other => Error::internal(other.to_string()),
    }
}

/// Upload, read, and delete voices; composes the stores with the slot
/// manager's cleanup path.
pub struct VoiceService {
    voices: Arc<dyn VoiceStore>,
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn SlotQueue>,
    blobs: Arc<dyn ArtifactStore>,
    slots: Arc<SlotManager>,
    clock: Arc<dyn Clock>,
}

impl VoiceService {
    pub fn new(
        voices: Arc<dyn VoiceStore>,
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn SlotQueue>,
        blobs: Arc<dyn ArtifactStore>,
        slots: Arc<SlotManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            voices,
            jobs,
            queue,
            blobs,
            slots,
            clock,
        }
    }

    /// Store the sample and create the voice in `recorded` state.
    pub async fn upload(
        &self,
        user_id: UserId,
        name: String,
        provider: Provider,
        sample: Vec<u8>,
    ) -> Result<Voice, Error> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(Error::invalid_request("voice name must not be empty"));
        }
        if sample.is_empty() {
            return Err(Error::invalid_request("voice sample must not be empty"));
        }

        let voice_id = VoiceId::random();
        let sample_blob_key = format!("samples/{user_id}/{voice_id}.mp3");
        self.blobs
            .put(&sample_blob_key, &sample)
            .await
            .map_err(|error| Error::service_unavailable(error.to_string()))?;

        let voice = self
            .voices
            .create(
                NewVoice {
                    id: voice_id,
                    user_id,
                    name,
                    provider,
                    sample_blob_key: Some(sample_blob_key),
                    sample_bytes: sample.len() as i64,
                },
                self.clock.utc(),
            )
            .await
            .map_err(map_store_error)?;
        info!(%voice_id, %user_id, bytes = voice.sample_bytes, "voice sample recorded");
        Ok(voice)
    }

    /// The voice plus its current queue position, scoped to the caller.
    pub async fn get(
        &self,
        user_id: UserId,
        voice_id: VoiceId,
    ) -> Result<(Voice, Option<u32>), Error> {
        let voice = self
            .voices
            .find(voice_id)
            .await
            .map_err(map_store_error)?
            .filter(|voice| voice.user_id == user_id)
            .ok_or_else(|| Error::not_found(format!("voice {voice_id} not found")))?;
        let queue_position = self
            .queue
            .position(voice_id)
            .await
            .map_err(|error| Error::service_unavailable(error.to_string()))?;
        Ok((voice, queue_position))
    }

    /// Delete the voice, its queue entry, its remote slot, its jobs, and its
    /// stored blobs.
    pub async fn delete(&self, user_id: UserId, voice_id: VoiceId) -> Result<(), Error> {
        let voice = self
            .voices
            .find(voice_id)
            .await
            .map_err(map_store_error)?
            .filter(|voice| voice.user_id == user_id)
            .ok_or_else(|| Error::not_found(format!("voice {voice_id} not found")))?;

        self.slots
            .release_voice(&voice)
            .await
            .map_err(|error| Error::service_unavailable(error.to_string()))?;
        let removed_jobs = self
            .jobs
            .delete_for_voice(voice_id)
            .await
            .map_err(|error| Error::internal(error.to_string()))?;

        if let Err(error) = self.blobs.delete_prefix(&format!("artifacts/{voice_id}/")).await {
            warn!(%voice_id, %error, "failed to delete voice artifacts");
        }
        if let Some(sample_blob_key) = &voice.sample_blob_key {
            if let Err(error) = self.blobs.delete(sample_blob_key).await {
                warn!(%voice_id, %error, "failed to delete voice sample");
            }
        }

        self.voices.delete(voice_id).await.map_err(map_store_error)?;
        info!(%voice_id, %user_id, removed_jobs, "voice deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{
        FixtureRemoteVoiceAdapter, InMemoryArtifactStore, InMemoryJobStore, InMemoryLedgerStore,
        InMemorySlotQueue, InMemoryVoiceStore, RecordingDispatcher,
    };
    use crate::domain::slots::{SlotConfig, SlotManagerPorts};
    use crate::test_support::MutableClock;
    use chrono::TimeZone;
    use rstest::rstest;

    fn service() -> (VoiceService, Arc<InMemoryVoiceStore>, Arc<InMemoryArtifactStore>) {
        let voices = Arc::new(InMemoryVoiceStore::new());
        let queue = Arc::new(InMemorySlotQueue::new());
        let jobs = Arc::new(InMemoryJobStore::new());
        let blobs = Arc::new(InMemoryArtifactStore::new());
        let clock = Arc::new(MutableClock::new(
            chrono::Utc
                .with_ymd_and_hms(2026, 3, 14, 8, 0, 0)
                .single()
                .expect("valid time"),
        ));
        let slots = Arc::new(SlotManager::new(
            SlotManagerPorts {
                voices: voices.clone(),
                queue: queue.clone(),
                jobs: jobs.clone(),
                ledger: Arc::new(InMemoryLedgerStore::new()),
                adapter: Arc::new(FixtureRemoteVoiceAdapter::new()),
                blobs: blobs.clone(),
                dispatcher: Arc::new(RecordingDispatcher::new()),
            },
            clock.clone(),
            SlotConfig::default(),
        ));
        (
            VoiceService::new(
                voices.clone(),
                jobs,
                queue,
                blobs.clone(),
                slots,
                clock,
            ),
            voices,
            blobs,
        )
    }

    #[rstest]
    #[tokio::test]
    async fn upload_stores_the_sample_and_creates_a_recorded_voice() {
        let (service, _, blobs) = service();
        let user = UserId::random();

        let voice = service
            .upload(user, "Mum".to_string(), Provider::Primary, b"sample".to_vec())
            .await
            .expect("upload");

        assert_eq!(voice.allocation_status.as_str(), "recorded");
        let key = voice.sample_blob_key.expect("sample stored");
        assert!(blobs.read(&key, None).await.is_ok());
    }

    #[rstest]
    #[tokio::test]
    async fn upload_rejects_empty_samples_and_names() {
        let (service, _, _) = service();
        let user = UserId::random();

        assert!(service
            .upload(user, "  ".to_string(), Provider::Primary, b"x".to_vec())
            .await
            .is_err());
        assert!(service
            .upload(user, "Mum".to_string(), Provider::Primary, Vec::new())
            .await
            .is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn delete_removes_the_row_and_blobs() {
        let (service, voices, blobs) = service();
        let user = UserId::random();
        let voice = service
            .upload(user, "Mum".to_string(), Provider::Primary, b"sample".to_vec())
            .await
            .expect("upload");
        let sample_key = voice.sample_blob_key.clone().expect("sample stored");

        service.delete(user, voice.id).await.expect("delete");

        assert!(voices.find(voice.id).await.expect("find").is_none());
        assert!(blobs.read(&sample_key, None).await.is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn foreign_voices_are_invisible() {
        let (service, _, _) = service();
        let owner = UserId::random();
        let voice = service
            .upload(owner, "Mum".to_string(), Provider::Primary, b"sample".to_vec())
            .await
            .expect("upload");

        let err = service.get(UserId::random(), voice.id).await.expect_err("hidden");
        assert_eq!(err.code(), crate::domain::ErrorCode::NotFound);
    }
}
