//! Shared HTTP adapter state.
//!
//! Handlers accept this state via `actix_web::web::Data` so they only depend
//! on domain services and ports, never on adapters.

use std::sync::Arc;

use crate::domain::config::AppConfig;
use crate::domain::credits::CreditLedger;
use crate::domain::ports::{ArtifactStore, JobStore, TaskDispatcher, VoiceStore};
use crate::domain::slots::SlotManager;
use crate::domain::synthesis::SynthesisOrchestrator;
use crate::domain::voices::VoiceService;

/// Dependency bundle for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub ledger: Arc<CreditLedger>,
    pub slots: Arc<SlotManager>,
    pub orchestrator: Arc<SynthesisOrchestrator>,
    pub voice_service: Arc<VoiceService>,
    pub voices: Arc<dyn VoiceStore>,
    pub jobs: Arc<dyn JobStore>,
    pub blobs: Arc<dyn ArtifactStore>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    pub config: Arc<AppConfig>,
}
