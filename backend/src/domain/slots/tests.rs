//! Behaviour coverage for the slot manager over in-memory fixtures.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rstest::rstest;

use super::*;
use crate::domain::ids::UserId;
use crate::domain::ports::{
    ArtifactStore, FixtureRemoteVoiceAdapter, GrantRequest, InMemoryArtifactStore,
    InMemoryJobStore, InMemoryLedgerStore, InMemorySlotQueue, InMemoryVoiceStore, JobStore,
    LedgerStore, NewJob, NewVoice, RecordingDispatcher, SlotQueue, VoiceStore,
};
use crate::domain::ports::remote_voice::{MockRemoteVoiceAdapter, RemoteVoiceError};
use crate::domain::credits::CreditSource;
use crate::domain::ids::{JobId, StoryId, VoiceId};
use crate::domain::voices::SlotEventType;
use crate::test_support::MutableClock;

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0)
        .single()
        .expect("valid time")
}

struct Harness {
    manager: SlotManager,
    voices: Arc<InMemoryVoiceStore>,
    queue: Arc<InMemorySlotQueue>,
    jobs: Arc<InMemoryJobStore>,
    ledger: Arc<InMemoryLedgerStore>,
    adapter: Arc<FixtureRemoteVoiceAdapter>,
    blobs: Arc<InMemoryArtifactStore>,
    dispatcher: Arc<RecordingDispatcher>,
    clock: Arc<MutableClock>,
}

fn harness_with(config: SlotConfig) -> Harness {
    let voices = Arc::new(InMemoryVoiceStore::new());
    let queue = Arc::new(InMemorySlotQueue::new());
    let jobs = Arc::new(InMemoryJobStore::new());
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let adapter = Arc::new(FixtureRemoteVoiceAdapter::new());
    let blobs = Arc::new(InMemoryArtifactStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let clock = Arc::new(MutableClock::new(at(8)));
    let manager = SlotManager::new(
        SlotManagerPorts {
            voices: voices.clone(),
            queue: queue.clone(),
            jobs: jobs.clone(),
            ledger: ledger.clone(),
            adapter: adapter.clone(),
            blobs: blobs.clone(),
            dispatcher: dispatcher.clone(),
        },
        clock.clone(),
        config,
    );
    Harness {
        manager,
        voices,
        queue,
        jobs,
        ledger,
        adapter,
        blobs,
        dispatcher,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(SlotConfig {
        slot_limit: 2,
        warm_hold: Duration::from_secs(900),
        slot_lock_ttl: Duration::from_secs(60),
        max_dispatch_per_cycle: 10,
    })
}

impl Harness {
    async fn recorded_voice(&self, user_id: UserId) -> Voice {
        let id = VoiceId::random();
        let key = format!("samples/{id}.mp3");
        self.blobs.put(&key, b"sample-bytes").await.expect("put sample");
        self.voices
            .create(
                NewVoice {
                    id,
                    user_id,
                    name: "bedtime voice".to_string(),
                    provider: Provider::Primary,
                    sample_blob_key: Some(key),
                    sample_bytes: 12,
                },
                self.clock.utc(),
            )
            .await
            .expect("create voice")
    }

    /// Drive a voice all the way to `ready`.
    async fn ready_voice(&self, user_id: UserId) -> Voice {
        let voice = self.recorded_voice(user_id).await;
        let outcome = self
            .manager
            .ensure_active(user_id, voice.id)
            .await
            .expect("ensure");
        assert!(matches!(outcome, EnsureOutcome::Allocating { .. }));
        self.manager.allocate(voice.id).await.expect("allocate");
        self.voices
            .find(voice.id)
            .await
            .expect("find")
            .expect("voice exists")
    }

    async fn event_kinds(&self) -> Vec<SlotEventType> {
        self.voices
            .recent_events(100)
            .await
            .expect("events")
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }
}

#[rstest]
#[tokio::test]
async fn cold_voice_allocates_when_capacity_is_free() {
    let h = harness();
    let user = UserId::random();
    let voice = h.recorded_voice(user).await;

    let outcome = h.manager.ensure_active(user, voice.id).await.expect("ensure");

    assert_eq!(outcome, EnsureOutcome::Allocating { queue_position: None });
    let stored = h.voices.find(voice.id).await.expect("find").expect("exists");
    assert_eq!(stored.allocation_status, AllocationStatus::Allocating);
    assert_eq!(
        h.dispatcher.recorded(),
        vec![WorkerTask::Allocate { voice_id: voice.id }]
    );
}

#[rstest]
#[tokio::test]
async fn allocation_completes_and_ready_voice_is_served_warm() {
    let h = harness();
    let user = UserId::random();
    let voice = h.ready_voice(user).await;
    assert_eq!(voice.allocation_status, AllocationStatus::Ready);
    let remote = voice.remote_voice_id.clone().expect("remote bound");

    h.clock.advance(Duration::from_secs(30));
    let outcome = h.manager.ensure_active(user, voice.id).await.expect("ensure");

    assert_eq!(outcome, EnsureOutcome::Ready { remote_voice_id: remote });
    let refreshed = h.voices.find(voice.id).await.expect("find").expect("exists");
    assert_eq!(refreshed.last_used_at, Some(h.clock.utc()), "warm hit refreshes last_used_at");
    assert!(h
        .event_kinds()
        .await
        .contains(&SlotEventType::AllocationCompleted));
}

#[rstest]
#[tokio::test]
async fn saturation_queues_instead_of_over_allocating() {
    let h = harness();
    let user = UserId::random();
    h.ready_voice(UserId::random()).await;
    h.ready_voice(UserId::random()).await;
    let voice = h.recorded_voice(user).await;

    let outcome = h.manager.ensure_active(user, voice.id).await.expect("ensure");

    assert_eq!(
        outcome,
        EnsureOutcome::Queued { queue_position: 1, queue_length: 1 }
    );
    assert!(
        h.voices
            .count_holding_slots(Provider::Primary)
            .await
            .expect("count")
            <= 2,
        "slot cap must hold"
    );

    // Polling again neither duplicates the entry nor changes the position.
    let again = h.manager.ensure_active(user, voice.id).await.expect("ensure");
    assert_eq!(
        again,
        EnsureOutcome::Queued { queue_position: 1, queue_length: 1 }
    );
    assert_eq!(h.queue.len(Provider::Primary).await.expect("len"), 1);
}

#[rstest]
#[tokio::test]
async fn locked_voice_reports_allocating_without_double_dispatch() {
    let h = harness();
    let user = UserId::random();
    let voice = h.recorded_voice(user).await;
    assert!(h
        .voices
        .try_acquire_lock(voice.id, at(9), h.clock.utc())
        .await
        .expect("lock"));

    let outcome = h.manager.ensure_active(user, voice.id).await.expect("ensure");

    assert_eq!(outcome, EnsureOutcome::Allocating { queue_position: None });
    assert!(h.dispatcher.recorded().is_empty(), "no allocation dispatched");
}

#[rstest]
#[tokio::test]
async fn other_users_voices_read_as_absent() {
    let h = harness();
    let owner = UserId::random();
    let voice = h.recorded_voice(owner).await;

    let err = h
        .manager
        .ensure_active(UserId::random(), voice.id)
        .await
        .expect_err("must be hidden");

    assert!(matches!(err, SlotError::NotFound { .. }));
}

#[rstest]
#[tokio::test]
async fn terminal_provider_rejection_marks_the_voice_errored() {
    let user = UserId::random();
    let voices = Arc::new(InMemoryVoiceStore::new());
    let queue = Arc::new(InMemorySlotQueue::new());
    let jobs = Arc::new(InMemoryJobStore::new());
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let blobs = Arc::new(InMemoryArtifactStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let clock = Arc::new(MutableClock::new(at(8)));
    let mut adapter = MockRemoteVoiceAdapter::new();
    adapter
        .expect_create_voice()
        .returning(|_, _| Err(RemoteVoiceError::rejected("sample too short")));
    let manager = SlotManager::new(
        SlotManagerPorts {
            voices: voices.clone(),
            queue,
            jobs,
            ledger,
            adapter: Arc::new(adapter),
            blobs: blobs.clone(),
            dispatcher,
        },
        clock.clone(),
        SlotConfig::default(),
    );

    let id = VoiceId::random();
    blobs.put("samples/v.mp3", b"tiny").await.expect("put");
    voices
        .create(
            NewVoice {
                id,
                user_id: user,
                name: "v".to_string(),
                provider: Provider::Primary,
                sample_blob_key: Some("samples/v.mp3".to_string()),
                sample_bytes: 4,
            },
            clock.utc(),
        )
        .await
        .expect("create");
    manager.ensure_active(user, id).await.expect("ensure");

    manager.allocate(id).await.expect("terminal failures resolve the task");

    let voice = voices.find(id).await.expect("find").expect("exists");
    assert_eq!(voice.allocation_status, AllocationStatus::Error);
    assert_eq!(voice.error_message.as_deref(), Some("provider rejected the request: sample too short"));

    let outcome = manager.ensure_active(user, id).await.expect("ensure");
    assert!(matches!(outcome, EnsureOutcome::Failed { .. }));
}

#[rstest]
#[tokio::test]
async fn process_queue_drains_into_free_capacity() {
    let h = harness();
    let user = UserId::random();
    let occupant = h.ready_voice(UserId::random()).await;
    h.ready_voice(UserId::random()).await;
    let waiting = h.recorded_voice(user).await;
    h.manager.ensure_active(user, waiting.id).await.expect("ensure");
    assert_eq!(h.queue.len(Provider::Primary).await.expect("len"), 1);

    // Free one slot by hand, then drain.
    h.voices
        .clear_remote(occupant.id, AllocationStatus::Evicted, h.clock.utc())
        .await
        .expect("evict");

    let dispatched = h.manager.process_queue(Provider::Primary).await.expect("drain");

    assert_eq!(dispatched, 1);
    assert_eq!(h.queue.len(Provider::Primary).await.expect("len"), 0);
    let stored = h.voices.find(waiting.id).await.expect("find").expect("exists");
    assert_eq!(stored.allocation_status, AllocationStatus::Allocating);
}

#[rstest]
#[tokio::test]
async fn reclaim_skips_when_queue_is_empty() {
    let h = harness();
    h.ready_voice(UserId::random()).await;
    h.clock.advance(Duration::from_secs(3600));

    let evicted = h.manager.reclaim_idle(Provider::Primary).await.expect("reclaim");

    assert_eq!(evicted, 0, "warm voices stay allocated without demand");
}

#[rstest]
#[tokio::test]
async fn reclaim_evicts_idle_voices_and_triggers_the_drain() {
    let h = harness();
    let waiting_user = UserId::random();
    let idle = h.ready_voice(UserId::random()).await;
    // The second occupant is fresher, so the first is the eviction target.
    h.clock.advance(Duration::from_secs(60));
    h.ready_voice(UserId::random()).await;

    // Saturate, queue a third voice, and let the warm hold lapse.
    let waiting = h.recorded_voice(waiting_user).await;
    h.manager
        .ensure_active(waiting_user, waiting.id)
        .await
        .expect("ensure");
    h.clock.advance(Duration::from_secs(1000));
    h.dispatcher.drain();

    let evicted = h.manager.reclaim_idle(Provider::Primary).await.expect("reclaim");

    assert_eq!(evicted, 1);
    assert!(h
        .dispatcher
        .recorded()
        .contains(&WorkerTask::ProcessQueue { provider: Provider::Primary }));
    assert!(h.event_kinds().await.contains(&SlotEventType::Evicted));
    let evicted_voice = h.voices.find(idle.id).await.expect("find").expect("exists");
    // Oldest-used voice went first; it lost its remote binding.
    assert_eq!(evicted_voice.allocation_status, AllocationStatus::Evicted);
    assert!(evicted_voice.remote_voice_id.is_none());
}

#[rstest]
#[tokio::test]
async fn reclaim_never_evicts_a_voice_with_synthesis_in_flight() {
    let h = harness();
    let busy_user = UserId::random();
    let busy = h.ready_voice(busy_user).await;
    h.ready_voice(UserId::random()).await;
    let job = h
        .jobs
        .get_or_create(
            NewJob {
                id: JobId::random(),
                user_id: busy_user,
                voice_id: busy.id,
                story_id: StoryId::random(),
                credits_charged: 1,
            },
            h.clock.utc(),
        )
        .await
        .expect("job");
    h.jobs
        .transition(
            job.id,
            &[crate::domain::synthesis::JobStatus::Pending],
            crate::domain::synthesis::JobStatus::Processing,
            h.clock.utc(),
        )
        .await
        .expect("processing");

    let waiting_user = UserId::random();
    let waiting = h.recorded_voice(waiting_user).await;
    h.manager
        .ensure_active(waiting_user, waiting.id)
        .await
        .expect("ensure");
    h.clock.advance(Duration::from_secs(2000));

    let evicted = h.manager.reclaim_idle(Provider::Primary).await.expect("reclaim");

    assert_eq!(evicted, 1, "only the idle voice goes");
    let kept = h.voices.find(busy.id).await.expect("find").expect("exists");
    assert!(kept.remote_voice_id.is_some(), "in-flight voice keeps its slot");
}

#[rstest]
#[tokio::test]
async fn reclaim_prefers_owners_with_zero_balance() {
    let h = harness();
    let broke_user = UserId::random();
    let funded_user = UserId::random();
    h.ledger
        .grant(
            GrantRequest {
                user_id: funded_user,
                amount: 10,
                source: CreditSource::Free,
                expires_at: None,
                reason: "seed".to_string(),
                metadata: None,
            },
            h.clock.utc(),
        )
        .await
        .expect("grant");

    // Funded user's voice is *older*, but the broke owner's goes first.
    let funded_voice = h.ready_voice(funded_user).await;
    h.clock.advance(Duration::from_secs(60));
    let broke_voice = h.ready_voice(broke_user).await;

    let waiting_user = UserId::random();
    let waiting = h.recorded_voice(waiting_user).await;
    h.manager
        .ensure_active(waiting_user, waiting.id)
        .await
        .expect("ensure");
    h.clock.advance(Duration::from_secs(2000));

    let evicted = h.manager.reclaim_idle(Provider::Primary).await.expect("reclaim");

    assert_eq!(evicted, 1);
    let broke = h.voices.find(broke_voice.id).await.expect("find").expect("exists");
    let funded = h.voices.find(funded_voice.id).await.expect("find").expect("exists");
    assert_eq!(broke.allocation_status, AllocationStatus::Evicted);
    assert_eq!(funded.allocation_status, AllocationStatus::Ready);
}

#[rstest]
#[tokio::test]
async fn repair_drift_requeues_and_logs_one_event() {
    let h = harness();
    let user = UserId::random();
    let voice = h.ready_voice(user).await;
    let remote = voice.remote_voice_id.clone().expect("remote");
    h.adapter.forget(&remote);

    h.manager.repair_drift(voice.id).await.expect("repair");

    let repaired = h.voices.find(voice.id).await.expect("find").expect("exists");
    assert_eq!(repaired.allocation_status, AllocationStatus::Recorded);
    assert!(repaired.remote_voice_id.is_none());
    assert_eq!(h.queue.position(voice.id).await.expect("pos"), Some(1));
    let drift_events = h
        .event_kinds()
        .await
        .into_iter()
        .filter(|kind| *kind == SlotEventType::DriftRepaired)
        .count();
    assert_eq!(drift_events, 1);
}

#[rstest]
#[tokio::test]
async fn release_voice_removes_queue_entry_and_remote_slot() {
    let h = harness();
    let user = UserId::random();
    let voice = h.ready_voice(user).await;
    let remote = voice.remote_voice_id.clone().expect("remote");

    h.manager.release_voice(&voice).await.expect("release");

    assert!(h.adapter.live_ids().is_empty(), "remote slot released: {remote}");
    assert_eq!(h.queue.position(voice.id).await.expect("pos"), None);
}

#[rstest]
#[tokio::test]
async fn status_reports_per_provider_counts() {
    let h = harness();
    h.ready_voice(UserId::random()).await;

    let status = h.manager.status().await.expect("status");

    let primary = status
        .providers
        .iter()
        .find(|provider| provider.provider == Provider::Primary)
        .expect("primary present");
    assert_eq!(primary.active, 1);
    assert_eq!(primary.slot_limit, 2);
    assert_eq!(primary.queue_length, 0);
}
