//! Service assembly: adapters, domain services, worker runtime, HTTP state.

use std::sync::Arc;

use mockable::DefaultClock;

use crate::domain::config::AppConfig;
use crate::domain::credits::{CreditLedger, CreditsConfig};
use crate::domain::slots::{SlotConfig, SlotManager, SlotManagerPorts};
use crate::domain::synthesis::{SynthesisConfig, SynthesisOrchestrator, SynthesisPorts};
use crate::domain::voices::VoiceService;
use crate::domain::worker::{
    ChannelDispatcher, TokioSleeper, WorkerRuntime, WorkerRuntimeConfig, WorkerServices,
};
use crate::inbound::http::state::HttpState;
use crate::outbound::blob::FsArtifactStore;
use crate::outbound::persistence::{
    DbPool, DieselJobStore, DieselLedgerStore, DieselSlotQueue, DieselStoryStore,
    DieselVoiceStore, PoolConfig,
};
use crate::outbound::provider::HttpRemoteVoiceAdapter;

/// Raised when the service cannot be assembled at startup.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("database pool: {0}")]
    Pool(#[from] crate::outbound::persistence::PoolError),
    #[error("provider client: {0}")]
    Provider(#[from] reqwest::Error),
}

/// Everything `main` needs to run the service.
pub struct AppServices {
    pub http_state: HttpState,
    pub runtime: Arc<WorkerRuntime>,
}

/// Wire adapters and services from configuration.
pub async fn build_services(config: Arc<AppConfig>) -> Result<AppServices, BuildError> {
    let pool = DbPool::new(PoolConfig::new(&config.database_url)).await?;

    let ledger_store = Arc::new(DieselLedgerStore::new(pool.clone()));
    let voice_store = Arc::new(DieselVoiceStore::new(pool.clone()));
    let job_store = Arc::new(DieselJobStore::new(pool.clone()));
    let story_store = Arc::new(DieselStoryStore::new(pool.clone()));
    let slot_queue = Arc::new(DieselSlotQueue::new(pool.clone()));
    let blobs = Arc::new(FsArtifactStore::new(
        config.artifact_root.clone(),
        config.artifact_public_base_url.clone(),
    ));
    let adapter = Arc::new(HttpRemoteVoiceAdapter::new(
        config.provider_base_url.clone(),
        config.provider_api_key.clone(),
        config.provider_call_timeout,
    )?);

    let clock = Arc::new(DefaultClock);
    let (dispatcher, task_rx) = ChannelDispatcher::new();

    let ledger = Arc::new(CreditLedger::new(
        ledger_store.clone(),
        clock.clone(),
        CreditsConfig {
            unit_size: config.credits_unit_size,
            unit_label: config.credits_unit_label.clone(),
            priority: config.credit_sources_priority.clone(),
            initial_credits: config.initial_credits,
            monthly_credits: config.monthly_credits,
        },
    ));
    let slots = Arc::new(SlotManager::new(
        SlotManagerPorts {
            voices: voice_store.clone(),
            queue: slot_queue.clone(),
            jobs: job_store.clone(),
            ledger: ledger_store.clone(),
            adapter: adapter.clone(),
            blobs: blobs.clone(),
            dispatcher: dispatcher.clone(),
        },
        clock.clone(),
        SlotConfig::from_app(&config),
    ));
    let orchestrator = Arc::new(SynthesisOrchestrator::new(
        SynthesisPorts {
            jobs: job_store.clone(),
            stories: story_store.clone(),
            voices: voice_store.clone(),
            blobs: blobs.clone(),
            adapter: adapter.clone(),
            dispatcher: dispatcher.clone(),
        },
        ledger.clone(),
        slots.clone(),
        clock.clone(),
        Arc::new(TokioSleeper),
        SynthesisConfig::from_app(&config),
    ));
    let voice_service = Arc::new(VoiceService::new(
        voice_store.clone(),
        job_store.clone(),
        slot_queue.clone(),
        blobs.clone(),
        slots.clone(),
        clock,
    ));

    let runtime = WorkerRuntime::new(
        WorkerServices {
            slots: slots.clone(),
            orchestrator: orchestrator.clone(),
            ledger: ledger.clone(),
        },
        dispatcher.clone(),
        task_rx,
        WorkerRuntimeConfig::from_app(&config),
    );

    Ok(AppServices {
        http_state: HttpState {
            ledger,
            slots,
            orchestrator,
            voice_service,
            voices: voice_store,
            jobs: job_store,
            blobs,
            dispatcher,
            config,
        },
        runtime,
    })
}
