//! HTTP surface tests: status codes, headers, and payload shapes.
//!
//! The full service stack runs over in-memory fixtures; background tasks are
//! recorded and executed by hand between requests so each scenario is
//! deterministic.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{test, web, App};
use base64::Engine;
use chrono::TimeZone;
use rstest::rstest;

use backend::domain::config::AppConfig;
use backend::domain::credits::{CreditLedger, CreditSource, CreditsConfig};
use backend::domain::ids::{StoryId, UserId};
use backend::domain::ports::{
    FixtureRemoteVoiceAdapter, InMemoryArtifactStore, InMemoryJobStore, InMemoryLedgerStore,
    InMemorySlotQueue, InMemoryStoryStore, InMemoryVoiceStore, RecordingDispatcher, Story,
    WorkerTask,
};
use backend::domain::slots::{SlotConfig, SlotManager, SlotManagerPorts};
use backend::domain::synthesis::{SynthesisConfig, SynthesisOrchestrator, SynthesisPorts};
use backend::domain::voices::VoiceService;
use backend::domain::worker::TokioSleeper;
use backend::inbound::http;
use backend::inbound::http::state::HttpState;
use backend::test_support::MutableClock;

const ADMIN_TOKEN: &str = "test-admin-token";

struct TestStack {
    state: HttpState,
    stories: Arc<InMemoryStoryStore>,
    dispatcher: Arc<RecordingDispatcher>,
    slots: Arc<SlotManager>,
    orchestrator: Arc<SynthesisOrchestrator>,
    ledger: Arc<CreditLedger>,
}

fn stack() -> TestStack {
    let voices = Arc::new(InMemoryVoiceStore::new());
    let queue = Arc::new(InMemorySlotQueue::new());
    let jobs = Arc::new(InMemoryJobStore::new());
    let ledger_store = Arc::new(InMemoryLedgerStore::new());
    let stories = Arc::new(InMemoryStoryStore::new());
    let blobs = Arc::new(InMemoryArtifactStore::new());
    let adapter = Arc::new(FixtureRemoteVoiceAdapter::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let clock = Arc::new(MutableClock::new(
        chrono::Utc
            .with_ymd_and_hms(2026, 3, 14, 20, 0, 0)
            .single()
            .expect("valid time"),
    ));

    let mut config = AppConfig::default();
    config.admin_token = Some(ADMIN_TOKEN.to_string());
    config.slot_limit = 2;
    let config = Arc::new(config);

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
    let orchestrator = Arc::new(SynthesisOrchestrator::new(
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
        Arc::new(TokioSleeper),
        SynthesisConfig {
            allocation_wait_deadline: Duration::ZERO,
            readiness_poll_interval: Duration::from_millis(1),
            requeue_delay: Duration::from_millis(1),
            max_inflight_jobs_per_user: 3,
        },
    ));
    let voice_service = Arc::new(VoiceService::new(
        voices.clone(),
        jobs.clone(),
        queue.clone(),
        blobs.clone(),
        slots.clone(),
        clock.clone(),
    ));

    TestStack {
        state: HttpState {
            ledger: ledger.clone(),
            slots: slots.clone(),
            orchestrator: orchestrator.clone(),
            voice_service,
            voices,
            jobs,
            blobs,
            dispatcher: dispatcher.clone(),
            config,
        },
        stories,
        dispatcher,
        slots,
        orchestrator,
        ledger,
    }
}

impl TestStack {
    /// Execute recorded background tasks until quiescent.
    async fn drive(&self) {
        for _ in 0..10 {
            let tasks = self.dispatcher.drain();
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                match task {
                    WorkerTask::Allocate { voice_id } => {
                        self.slots.allocate(voice_id).await.expect("allocate");
                    }
                    WorkerTask::Synthesize { job_id } => {
                        self.orchestrator.run_synthesis(job_id).await.expect("synthesize");
                    }
                    WorkerTask::ProcessQueue { provider } => {
                        self.slots.process_queue(provider).await.expect("drain");
                    }
                    WorkerTask::ReclaimIdle { provider } => {
                        self.slots.reclaim_idle(provider).await.expect("reclaim");
                    }
                    WorkerTask::ExpireLots => {
                        self.ledger.expire_now(None, None).await.expect("expire");
                    }
                    WorkerTask::GrantMonthlyCredits => {
                        self.ledger.grant_monthly().await.expect("monthly");
                    }
                }
            }
        }
    }

    fn seed_story(&self, chars: usize) -> StoryId {
        self.stories.insert(Story {
            id: StoryId::random(),
            title: "The Sleepy Fox".to_string(),
            text: "z".repeat(chars),
        })
    }

    async fn seed_credits(&self, user: UserId, amount: i64) {
        self.ledger
            .grant(user, amount, CreditSource::Free, None, "seed", None)
            .await
            .expect("grant");
    }
}

macro_rules! app {
    ($stack:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($stack.state.clone()))
                .configure(http::configure),
        )
        .await
    };
}

fn sample_b64() -> String {
    base64::engine::general_purpose::STANDARD.encode(b"pretend-this-is-audio")
}

#[rstest]
#[actix_web::test]
async fn voice_upload_returns_201_with_recorded_status() {
    let stack = stack();
    let app = app!(stack);
    let user = UserId::random();

    let req = test::TestRequest::post()
        .uri("/voices")
        .insert_header(("X-User-Id", user.to_string()))
        .set_json(serde_json::json!({
            "name": "Mum",
            "sample_base64": sample_b64(),
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status().as_u16(), 201);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "recorded");
    assert!(body["voice_id"].is_string());
}

#[rstest]
#[actix_web::test]
async fn malformed_upload_returns_400() {
    let stack = stack();
    let app = app!(stack);

    let req = test::TestRequest::post()
        .uri("/voices")
        .insert_header(("X-User-Id", UserId::random().to_string()))
        .set_json(serde_json::json!({
            "name": "Mum",
            "sample_base64": "***not base64***",
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status().as_u16(), 400);
}

#[rstest]
#[actix_web::test]
async fn missing_identity_returns_401() {
    let stack = stack();
    let app = app!(stack);

    let req = test::TestRequest::get().uri("/me/credits").to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status().as_u16(), 401);
}

#[rstest]
#[actix_web::test]
async fn synthesis_flow_over_http_reaches_ready() {
    let stack = stack();
    let app = app!(stack);
    let user = UserId::random();
    stack.seed_credits(user, 10).await;
    let story = stack.seed_story(2500);

    // Upload a voice.
    let req = test::TestRequest::post()
        .uri("/voices")
        .insert_header(("X-User-Id", user.to_string()))
        .set_json(serde_json::json!({ "name": "Mum", "sample_base64": sample_b64() }))
        .to_request();
    let body: serde_json::Value = test::read_body_json(test::call_service(&app, req).await).await;
    let voice_id = body["voice_id"].as_str().expect("voice id").to_string();

    // First POST: allocation starts, 202.
    let req = test::TestRequest::post()
        .uri(&format!("/voices/{voice_id}/stories/{story}/audio"))
        .insert_header(("X-User-Id", user.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 202);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "allocating_voice");

    stack.drive().await;

    // Second POST: artifact exists, 200 with the remote id header.
    let req = test::TestRequest::post()
        .uri(&format!("/voices/{voice_id}/stories/{story}/audio"))
        .insert_header(("X-User-Id", user.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    assert!(resp.headers().contains_key("X-Voice-Remote-ID"));
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ready");

    // Fetch the audio bytes, with a range.
    let req = test::TestRequest::get()
        .uri(&format!("/voices/{voice_id}/stories/{story}/audio"))
        .insert_header(("X-User-Id", user.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("Accept-Ranges").map(|v| v.to_str().unwrap()),
        Some("bytes")
    );

    let req = test::TestRequest::get()
        .uri(&format!("/voices/{voice_id}/stories/{story}/audio"))
        .insert_header(("X-User-Id", user.to_string()))
        .insert_header(("Range", "bytes=0-3"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 206);
    assert!(resp.headers().contains_key("Content-Range"));

    // Balance reflects the single charge.
    let req = test::TestRequest::get()
        .uri("/me/credits")
        .insert_header(("X-User-Id", user.to_string()))
        .to_request();
    let body: serde_json::Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(body["balance"], 7);
}

#[rstest]
#[actix_web::test]
async fn insufficient_credits_returns_402_with_required_and_available() {
    let stack = stack();
    let app = app!(stack);
    let user = UserId::random();
    stack.seed_credits(user, 1).await;
    let story = stack.seed_story(2500);

    let req = test::TestRequest::post()
        .uri("/voices")
        .insert_header(("X-User-Id", user.to_string()))
        .set_json(serde_json::json!({ "name": "Mum", "sample_base64": sample_b64() }))
        .to_request();
    let body: serde_json::Value = test::read_body_json(test::call_service(&app, req).await).await;
    let voice_id = body["voice_id"].as_str().expect("voice id").to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/voices/{voice_id}/stories/{story}/audio"))
        .insert_header(("X-User-Id", user.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status().as_u16(), 402);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["kind"], "insufficient_credits");
    assert_eq!(body["details"]["required"], 3);
    assert_eq!(body["details"]["available"], 1);
}

#[rstest]
#[actix_web::test]
async fn saturated_pool_returns_202_with_queue_headers() {
    let stack = stack();
    let app = app!(stack);
    let user = UserId::random();
    stack.seed_credits(user, 10).await;
    let story = stack.seed_story(100);

    // Fill both slots with other users' warm voices.
    for _ in 0..2 {
        let other = UserId::random();
        stack.seed_credits(other, 5).await;
        let other_story = stack.seed_story(100);
        let req = test::TestRequest::post()
            .uri("/voices")
            .insert_header(("X-User-Id", other.to_string()))
            .set_json(serde_json::json!({ "name": "Other", "sample_base64": sample_b64() }))
            .to_request();
        let body: serde_json::Value =
            test::read_body_json(test::call_service(&app, req).await).await;
        let other_voice = body["voice_id"].as_str().expect("voice id").to_string();
        let req = test::TestRequest::post()
            .uri(&format!("/voices/{other_voice}/stories/{other_story}/audio"))
            .insert_header(("X-User-Id", other.to_string()))
            .to_request();
        test::call_service(&app, req).await;
        stack.drive().await;
    }

    let req = test::TestRequest::post()
        .uri("/voices")
        .insert_header(("X-User-Id", user.to_string()))
        .set_json(serde_json::json!({ "name": "Mum", "sample_base64": sample_b64() }))
        .to_request();
    let body: serde_json::Value = test::read_body_json(test::call_service(&app, req).await).await;
    let voice_id = body["voice_id"].as_str().expect("voice id").to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/voices/{voice_id}/stories/{story}/audio"))
        .insert_header(("X-User-Id", user.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status().as_u16(), 202);
    assert_eq!(
        resp.headers()
            .get("X-Voice-Queue-Position")
            .map(|v| v.to_str().unwrap()),
        Some("1")
    );
    assert_eq!(
        resp.headers()
            .get("X-Voice-Queue-Length")
            .map(|v| v.to_str().unwrap()),
        Some("1")
    );
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "queued_for_slot");
}

#[rstest]
#[actix_web::test]
async fn audio_fetch_before_ready_returns_404() {
    let stack = stack();
    let app = app!(stack);
    let user = UserId::random();
    let story = stack.seed_story(100);

    let req = test::TestRequest::get()
        .uri(&format!(
            "/voices/{}/stories/{story}/audio",
            uuid::Uuid::new_v4()
        ))
        .insert_header(("X-User-Id", user.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status().as_u16(), 404);
}

#[rstest]
#[actix_web::test]
async fn admin_routes_refuse_without_the_token() {
    let stack = stack();
    let app = app!(stack);

    let req = test::TestRequest::get()
        .uri("/admin/voice-slots/status")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 403);

    let req = test::TestRequest::get()
        .uri("/admin/voice-slots/status")
        .insert_header(("X-Admin-Token", "wrong"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 403);
}

#[rstest]
#[actix_web::test]
async fn admin_grant_and_status_round_trip() {
    let stack = stack();
    let app = app!(stack);
    let user = UserId::random();

    let req = test::TestRequest::post()
        .uri(&format!("/admin/users/{user}/credits/grant"))
        .insert_header(("X-Admin-Token", ADMIN_TOKEN))
        .set_json(serde_json::json!({ "amount": 25, "source": "event" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["amount_remaining"], 25);

    let req = test::TestRequest::post()
        .uri(&format!("/admin/users/{user}/credits/grant"))
        .insert_header(("X-Admin-Token", ADMIN_TOKEN))
        .set_json(serde_json::json!({ "amount": -5, "source": "event" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);

    let req = test::TestRequest::get()
        .uri("/admin/voice-slots/status")
        .insert_header(("X-Admin-Token", ADMIN_TOKEN))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["providers"][0]["slot_limit"], 2);

    let req = test::TestRequest::post()
        .uri("/admin/voice-slots/process-queue")
        .insert_header(("X-Admin-Token", ADMIN_TOKEN))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 202);
}

#[rstest]
#[actix_web::test]
async fn history_filters_by_kind() {
    let stack = stack();
    let app = app!(stack);
    let user = UserId::random();
    stack.seed_credits(user, 10).await;
    let story = stack.seed_story(100);

    let req = test::TestRequest::post()
        .uri("/voices")
        .insert_header(("X-User-Id", user.to_string()))
        .set_json(serde_json::json!({ "name": "Mum", "sample_base64": sample_b64() }))
        .to_request();
    let body: serde_json::Value = test::read_body_json(test::call_service(&app, req).await).await;
    let voice_id = body["voice_id"].as_str().expect("voice id").to_string();
    let req = test::TestRequest::post()
        .uri(&format!("/voices/{voice_id}/stories/{story}/audio"))
        .insert_header(("X-User-Id", user.to_string()))
        .to_request();
    test::call_service(&app, req).await;
    stack.drive().await;

    let req = test::TestRequest::get()
        .uri("/me/credits/history?type=debit")
        .insert_header(("X-User-Id", user.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    let rows = body.as_array().expect("array");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["kind"], "debit");
    assert_eq!(rows[0]["amount"], -1);
}
