//! OpenAPI surface for Swagger UI and tooling.

use utoipa::OpenApi;

use crate::inbound::http;

/// Public OpenAPI document.
#[derive(OpenApi)]
#[openapi(
    paths(
        http::voices::upload_voice,
        http::voices::get_voice,
        http::voices::delete_voice,
        http::audio::start_synthesis,
        http::audio::fetch_audio,
        http::credits::credit_summary,
        http::credits::credit_history,
        http::admin::grant_credits,
        http::admin::voice_slots_status,
        http::admin::force_process_queue,
    ),
    components(schemas(
        http::schemas::ErrorSchema,
        http::voices::UploadVoiceBody,
        http::voices::UploadVoiceResponse,
        http::voices::VoiceView,
        http::audio::SynthesisResponse,
        http::credits::CreditSummaryResponse,
        http::credits::LotView,
        http::credits::TransactionView,
        http::admin::GrantBody,
        http::admin::SlotsStatusResponse,
        http::admin::ProviderStatusView,
        http::admin::QueuedEntryView,
        http::admin::SlotEventView,
    )),
    tags(
        (name = "voices", description = "Voice upload and lifecycle"),
        (name = "audio", description = "Story synthesis and artifact delivery"),
        (name = "credits", description = "Credit balances and history"),
        (name = "admin", description = "Operational endpoints"),
    )
)]
pub struct ApiDoc;
