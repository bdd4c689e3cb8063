//! End-to-end orchestration scenarios over in-memory fixtures.
//!
//! Workers run synchronously: tests drain the recording dispatcher and
//! execute each task by hand, so every interleaving is deterministic.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rstest::rstest;

use super::*;
use crate::domain::credits::{CreditSource, CreditsConfig, TransactionKind};
use crate::domain::ports::{
    ArtifactStore, FixtureRemoteVoiceAdapter, InMemoryArtifactStore, InMemoryJobStore,
    InMemoryLedgerStore, InMemorySlotQueue, InMemoryStoryStore, InMemoryVoiceStore, LedgerStore,
    NewVoice, RecordingDispatcher, Story, VoiceStore as VoiceStorePort,
};
use crate::domain::slots::{SlotConfig, SlotManagerPorts};
use crate::domain::voices::{Provider, SlotEventType, Voice};
use crate::test_support::MutableClock;

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0)
        .single()
        .expect("valid time")
}

struct World {
    orchestrator: SynthesisOrchestrator,
    slots: Arc<SlotManager>,
    ledger: Arc<CreditLedger>,
    ledger_store: Arc<InMemoryLedgerStore>,
    voices: Arc<InMemoryVoiceStore>,
    jobs: Arc<InMemoryJobStore>,
    stories: Arc<InMemoryStoryStore>,
    blobs: Arc<InMemoryArtifactStore>,
    adapter: Arc<FixtureRemoteVoiceAdapter>,
    dispatcher: Arc<RecordingDispatcher>,
    clock: Arc<MutableClock>,
}

fn world_with(synthesis_config: SynthesisConfig) -> World {
    let voices = Arc::new(InMemoryVoiceStore::new());
    let queue = Arc::new(InMemorySlotQueue::new());
    let jobs = Arc::new(InMemoryJobStore::new());
    let ledger_store = Arc::new(InMemoryLedgerStore::new());
    let stories = Arc::new(InMemoryStoryStore::new());
    let blobs = Arc::new(InMemoryArtifactStore::new());
    let adapter = Arc::new(FixtureRemoteVoiceAdapter::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let clock = Arc::new(MutableClock::new(at(8)));
    let ledger = Arc::new(CreditLedger::new(
        ledger_store.clone(),
        clock.clone(),
        CreditsConfig::default(),
    ));
    let slots = Arc::new(SlotManager::new(
        SlotManagerPorts {
            voices: voices.clone(),
            queue: queue.clone(),
            jobs: jobs.clone(),
            ledger: ledger_store.clone(),
            adapter: adapter.clone(),
            blobs: blobs.clone(),
            dispatcher: dispatcher.clone(),
        },
        clock.clone(),
        SlotConfig {
            slot_limit: 2,
            warm_hold: Duration::from_secs(900),
            slot_lock_ttl: Duration::from_secs(60),
            max_dispatch_per_cycle: 10,
        },
    ));
    let orchestrator = SynthesisOrchestrator::new(
        SynthesisPorts {
            jobs: jobs.clone(),
            stories: stories.clone(),
            voices: voices.clone(),
            blobs: blobs.clone(),
            adapter: adapter.clone(),
            dispatcher: dispatcher.clone(),
        },
        ledger.clone(),
        slots.clone(),
        clock.clone(),
        Arc::new(crate::domain::worker::TokioSleeper),
        synthesis_config,
    );
    World {
        orchestrator,
        slots,
        ledger,
        ledger_store,
        voices,
        jobs,
        stories,
        blobs,
        adapter,
        dispatcher,
        clock,
    }
}

fn world() -> World {
    world_with(SynthesisConfig {
        // Zero deadline: a worker that finds the slot not yet ready defers
        // itself immediately instead of sleeping, keeping tests synchronous.
        allocation_wait_deadline: Duration::ZERO,
        readiness_poll_interval: Duration::from_millis(1),
        requeue_delay: Duration::from_millis(1),
        max_inflight_jobs_per_user: 3,
    })
}

impl World {
    async fn user_with_credits(&self, amount: i64) -> UserId {
        let user = UserId::random();
        if amount > 0 {
            self.ledger
                .grant(user, amount, CreditSource::Free, None, "seed", None)
                .await
                .expect("grant");
        } else {
            self.ledger.bootstrap_user(user).await.expect("bootstrap");
        }
        user
    }

    fn story_of_len(&self, chars: usize) -> StoryId {
        self.stories.insert(Story {
            id: StoryId::random(),
            title: "The Sleepy Fox".to_string(),
            text: "z".repeat(chars),
        })
    }

    async fn recorded_voice(&self, user_id: UserId) -> Voice {
        let id = VoiceId::random();
        let key = format!("samples/{id}.mp3");
        self.blobs.put(&key, b"sample-bytes").await.expect("put");
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

    async fn ready_voice(&self, user_id: UserId) -> Voice {
        let voice = self.recorded_voice(user_id).await;
        self.slots
            .ensure_active(user_id, voice.id)
            .await
            .expect("ensure");
        self.slots.allocate(voice.id).await.expect("allocate");
        self.dispatcher.drain();
        self.voices
            .find(voice.id)
            .await
            .expect("find")
            .expect("voice exists")
    }

    /// Execute dispatched tasks until the queue drains or the iteration cap
    /// hits (a still-waiting synthesize defers itself each round).
    async fn drive(&self, rounds: usize) {
        for _ in 0..rounds {
            let tasks = self.dispatcher.drain();
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                match task {
                    crate::domain::ports::WorkerTask::Allocate { voice_id } => {
                        self.slots.allocate(voice_id).await.expect("allocate task");
                    }
                    crate::domain::ports::WorkerTask::Synthesize { job_id } => {
                        self.orchestrator
                            .run_synthesis(job_id)
                            .await
                            .expect("synthesize task");
                    }
                    crate::domain::ports::WorkerTask::ProcessQueue { provider } => {
                        self.slots.process_queue(provider).await.expect("drain task");
                    }
                    crate::domain::ports::WorkerTask::ReclaimIdle { provider } => {
                        self.slots.reclaim_idle(provider).await.expect("reclaim task");
                    }
                    crate::domain::ports::WorkerTask::ExpireLots => {
                        self.ledger.expire_now(None, None).await.expect("expire task");
                    }
                    crate::domain::ports::WorkerTask::GrantMonthlyCredits => {
                        self.ledger.grant_monthly().await.expect("monthly task");
                    }
                }
            }
        }
    }

    async fn debit_history(&self, user: UserId) -> Vec<crate::domain::credits::CreditTransaction> {
        self.ledger
            .history(
                user,
                crate::domain::credits::HistoryQuery {
                    limit: Some(100),
                    offset: 0,
                    kinds: Some(vec![TransactionKind::Debit]),
                },
            )
            .await
            .expect("history")
    }
}

#[rstest]
#[tokio::test]
async fn s1_successful_synthesis_charges_and_produces_an_artifact() {
    let w = world();
    let user = w.user_with_credits(10).await;
    let story = w.story_of_len(2500);
    let voice = w.ready_voice(user).await;

    let outcome = w
        .orchestrator
        .start_synthesis(user, voice.id, story)
        .await
        .expect("start");
    let StartOutcome::Processing { job_id } = outcome else {
        panic!("expected Processing, got {outcome:?}");
    };
    w.drive(5).await;

    let job = w.jobs.find(job_id).await.expect("find").expect("job exists");
    assert_eq!(job.status, JobStatus::Ready);
    let artifact_key = job.artifact_blob_key.expect("artifact recorded");
    assert!(w.blobs.read(&artifact_key, None).await.is_ok(), "artifact stored");

    let summary = w.ledger.summary(user).await.expect("summary");
    assert_eq!(summary.active_balance, 7);
    let debits = w.debit_history(user).await;
    assert_eq!(debits.len(), 1);
    assert_eq!(debits[0].amount, -3);
    assert_eq!(debits[0].job_id, Some(job_id));
}

#[rstest]
#[tokio::test]
async fn s2_insufficient_credits_rejects_without_side_effects() {
    let w = world();
    let user = w.user_with_credits(1).await;
    let story = w.story_of_len(2500);
    let voice = w.ready_voice(user).await;

    let err = w
        .orchestrator
        .start_synthesis(user, voice.id, story)
        .await
        .expect_err("must fail");

    assert_eq!(err, SynthesisError::PaymentRequired { required: 3, available: 1 });
    assert!(w.debit_history(user).await.is_empty(), "no transaction written");
    assert!(
        w.jobs
            .find_for_story(user, voice.id, story)
            .await
            .expect("lookup")
            .is_none(),
        "no job left behind"
    );
}

#[rstest]
#[tokio::test]
async fn s3_saturated_pool_queues_then_completes_after_reclaim() {
    let w = world();
    let user = w.user_with_credits(10).await;
    let story = w.story_of_len(2500);
    // Both slots held by other users' voices, freshly used.
    w.ready_voice(UserId::random()).await;
    w.ready_voice(UserId::random()).await;
    let voice = w.recorded_voice(user).await;

    let outcome = w
        .orchestrator
        .start_synthesis(user, voice.id, story)
        .await
        .expect("start");
    let StartOutcome::QueuedForSlot { job_id, queue_position, queue_length } = outcome else {
        panic!("expected QueuedForSlot, got {outcome:?}");
    };
    assert_eq!((queue_position, queue_length), (1, 1));
    let summary = w.ledger.summary(user).await.expect("summary");
    assert_eq!(summary.active_balance, 7, "debit landed before queueing");

    // One drive round: the deferred worker re-queues itself, nothing moves.
    w.drive(1).await;
    let job = w.jobs.find(job_id).await.expect("find").expect("exists");
    assert_eq!(job.status, JobStatus::Pending);

    // The warm hold lapses; the reclaim beat frees a slot and the queue
    // drains into it.
    w.clock.advance(Duration::from_secs(1000));
    w.slots.reclaim_idle(Provider::Primary).await.expect("reclaim");
    w.drive(10).await;

    let job = w.jobs.find(job_id).await.expect("find").expect("exists");
    assert_eq!(job.status, JobStatus::Ready);

    // Polling the same triple now reports the artifact with no extra charge.
    let outcome = w
        .orchestrator
        .start_synthesis(user, voice.id, story)
        .await
        .expect("poll");
    assert!(matches!(outcome, StartOutcome::AlreadyReady { .. }));
    assert_eq!(w.debit_history(user).await.len(), 1);
}

#[rstest]
#[tokio::test]
async fn s4_rapid_duplicate_requests_charge_once_and_share_a_job() {
    let w = world();
    let user = w.user_with_credits(10).await;
    let story = w.story_of_len(1500);
    let voice = w.ready_voice(user).await;

    let first = w
        .orchestrator
        .start_synthesis(user, voice.id, story)
        .await
        .expect("first");
    let StartOutcome::Processing { job_id } = first else {
        panic!("expected Processing, got {first:?}");
    };

    let second = w
        .orchestrator
        .start_synthesis(user, voice.id, story)
        .await
        .expect("second");
    assert_eq!(second, StartOutcome::AlreadyProcessing { job_id });

    assert_eq!(w.debit_history(user).await.len(), 1, "exactly one debit");
    let summary = w.ledger.summary(user).await.expect("summary");
    assert_eq!(summary.active_balance, 8);
}

#[rstest]
#[tokio::test]
async fn s5_terminal_failure_refunds_the_exact_lots_once() {
    let w = world();
    let user = UserId::random();
    w.ledger
        .grant(user, 2, CreditSource::Event, Some(at(23)), "event", None)
        .await
        .expect("grant");
    w.ledger
        .grant(user, 5, CreditSource::Monthly, None, "monthly", None)
        .await
        .expect("grant");
    let story = w.story_of_len(2500);
    let voice = w.ready_voice(user).await;

    let outcome = w
        .orchestrator
        .start_synthesis(user, voice.id, story)
        .await
        .expect("start");
    let StartOutcome::Processing { job_id } = outcome else {
        panic!("expected Processing, got {outcome:?}");
    };
    let debit_tx = w.debit_history(user).await.remove(0);

    // The runtime exhausted its retries and dead-lettered the job.
    w.orchestrator
        .fail_job(job_id, "provider transport failed: 502")
        .await
        .expect("fail");

    let job = w.jobs.find(job_id).await.expect("find").expect("exists");
    assert_eq!(job.status, JobStatus::Error);
    let summary = w.ledger.summary(user).await.expect("summary");
    assert_eq!(summary.active_balance, 7, "balance restored");
    let refunds = w
        .ledger
        .history(
            user,
            crate::domain::credits::HistoryQuery {
                limit: Some(10),
                offset: 0,
                kinds: Some(vec![TransactionKind::Refund]),
            },
        )
        .await
        .expect("history");
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, 3);
    let debit_allocations = w
        .ledger_store
        .allocations_for(debit_tx.id)
        .await
        .expect("allocations");
    let refund_allocations = w
        .ledger_store
        .allocations_for(refunds[0].id)
        .await
        .expect("allocations");
    let debited_lots: Vec<_> = debit_allocations.iter().map(|a| a.lot_id).collect();
    let refunded_lots: Vec<_> = refund_allocations.iter().map(|a| a.lot_id).collect();
    assert_eq!(debited_lots, refunded_lots, "refund restores the exact lots");

    // A duplicate failure signal produces no additional refund.
    w.orchestrator
        .fail_job(job_id, "late duplicate failure")
        .await
        .expect("fail again");
    let summary = w.ledger.summary(user).await.expect("summary");
    assert_eq!(summary.active_balance, 7);
}

#[rstest]
#[tokio::test]
async fn s6_drift_recovery_reallocates_and_completes_with_one_debit() {
    let w = world();
    let user = w.user_with_credits(10).await;
    let story = w.story_of_len(500);
    let voice = w.ready_voice(user).await;
    let old_remote = voice.remote_voice_id.clone().expect("remote");

    // The provider silently reclaims the voice.
    w.adapter.forget(&old_remote);

    let outcome = w
        .orchestrator
        .start_synthesis(user, voice.id, story)
        .await
        .expect("start");
    let StartOutcome::Processing { job_id } = outcome else {
        panic!("expected Processing, got {outcome:?}");
    };
    w.drive(10).await;

    let job = w.jobs.find(job_id).await.expect("find").expect("exists");
    assert_eq!(job.status, JobStatus::Ready, "job completes after repair");
    let repaired = w.voices.find(voice.id).await.expect("find").expect("exists");
    let new_remote = repaired.remote_voice_id.expect("re-allocated");
    assert_ne!(new_remote, old_remote, "a fresh remote voice was created");

    assert_eq!(w.debit_history(user).await.len(), 1, "exactly one debit persists");
    let drift_events = w
        .voices
        .recent_events(100)
        .await
        .expect("events")
        .into_iter()
        .filter(|event| event.event_type == SlotEventType::DriftRepaired)
        .count();
    assert_eq!(drift_events, 1, "one drift_repaired event logged");
}

#[rstest]
#[tokio::test]
async fn inflight_cap_rejects_before_charging() {
    let w = world_with(SynthesisConfig {
        allocation_wait_deadline: Duration::ZERO,
        readiness_poll_interval: Duration::from_millis(1),
        requeue_delay: Duration::from_millis(1),
        max_inflight_jobs_per_user: 1,
    });
    let user = w.user_with_credits(10).await;
    // Saturate the pool so the first job parks in `pending`.
    w.ready_voice(UserId::random()).await;
    w.ready_voice(UserId::random()).await;
    let first_voice = w.recorded_voice(user).await;
    let second_voice = w.recorded_voice(user).await;
    let first_story = w.story_of_len(100);
    let second_story = w.story_of_len(100);
    w.orchestrator
        .start_synthesis(user, first_voice.id, first_story)
        .await
        .expect("first start");

    let err = w
        .orchestrator
        .start_synthesis(user, second_voice.id, second_story)
        .await
        .expect_err("must refuse");

    assert_eq!(err, SynthesisError::TooManyJobs { limit: 1 });
    let summary = w.ledger.summary(user).await.expect("summary");
    assert_eq!(summary.active_balance, 9, "only the first job charged");
}

#[rstest]
#[tokio::test]
async fn errored_jobs_can_be_restarted_with_a_fresh_charge() {
    let w = world();
    let user = w.user_with_credits(10).await;
    let story = w.story_of_len(500);
    let voice = w.ready_voice(user).await;
    let StartOutcome::Processing { job_id } = w
        .orchestrator
        .start_synthesis(user, voice.id, story)
        .await
        .expect("start")
    else {
        panic!("expected Processing");
    };
    w.orchestrator.fail_job(job_id, "boom").await.expect("fail");
    assert_eq!(w.ledger.summary(user).await.expect("summary").active_balance, 10);
    w.dispatcher.drain();

    let outcome = w
        .orchestrator
        .start_synthesis(user, voice.id, story)
        .await
        .expect("restart");

    assert!(matches!(outcome, StartOutcome::Processing { job_id: restarted } if restarted == job_id));
    w.drive(5).await;
    let job = w.jobs.find(job_id).await.expect("find").expect("exists");
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(w.ledger.summary(user).await.expect("summary").active_balance, 9);
}
