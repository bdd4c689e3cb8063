//! Admin HTTP handlers.
//!
//! ```text
//! POST /admin/users/{user_id}/credits/grant  Grant a credit lot
//! GET  /admin/voice-slots/status             Operational slot view
//! POST /admin/voice-slots/process-queue      Force a queue drain beat
//! ```
//!
//! All routes are gated on the shared admin token.

use actix_web::{get, post, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::credits::CreditSource;
use crate::domain::ids::UserId;
use crate::domain::ports::WorkerTask;
use crate::domain::voices::Provider;
use crate::domain::Error;
use crate::inbound::http::auth::AdminGuard;
use crate::inbound::http::credits::LotView;
use crate::inbound::http::schemas::ErrorSchema;
use crate::inbound::http::state::HttpState;
use crate::inbound::http::ApiResult;

/// Admin grant payload.
#[derive(Debug, Deserialize, ToSchema)]
pub struct GrantBody {
    pub amount: i64,
    /// One of `event`, `monthly`, `referral`, `add_on`, `free`.
    pub source: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Grant credits to a user, provisioning the user row when absent.
#[utoipa::path(
    post,
    path = "/admin/users/{user_id}/credits/grant",
    request_body = GrantBody,
    responses(
        (status = 200, description = "Lot created", body = LotView),
        (status = 400, description = "Invalid grant", body = ErrorSchema),
        (status = 403, description = "Admin access denied", body = ErrorSchema)
    ),
    params(("user_id" = uuid::Uuid, Path, description = "User identifier")),
    tags = ["admin"],
    operation_id = "grantCredits"
)]
#[post("/admin/users/{user_id}/credits/grant")]
pub async fn grant_credits(
    state: web::Data<HttpState>,
    _admin: AdminGuard,
    path: web::Path<uuid::Uuid>,
    body: web::Json<GrantBody>,
) -> ApiResult<web::Json<LotView>> {
    let user_id = UserId::from_uuid(path.into_inner());
    let body = body.into_inner();
    let source = body
        .source
        .parse::<CreditSource>()
        .map_err(|error| Error::invalid_request(error.to_string()))?;

    state.ledger.bootstrap_user(user_id).await.map_err(Error::from)?;
    let lot = state
        .ledger
        .grant(
            user_id,
            body.amount,
            source,
            body.expires_at,
            body.reason.unwrap_or_else(|| "admin_grant".to_string()),
            None,
        )
        .await
        .map_err(Error::from)?;
    Ok(web::Json(LotView::from(lot)))
}

/// One queued entry in the operational view.
#[derive(Debug, Serialize, ToSchema)]
pub struct QueuedEntryView {
    pub voice_id: crate::domain::ids::VoiceId,
    pub user_id: UserId,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: i32,
}

/// Per-provider slot occupancy.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProviderStatusView {
    pub provider: String,
    pub active: u32,
    pub slot_limit: u32,
    pub queue_length: u32,
    pub queued: Vec<QueuedEntryView>,
}

/// One audit event in the operational view.
#[derive(Debug, Serialize, ToSchema)]
pub struct SlotEventView {
    pub voice_id: crate::domain::ids::VoiceId,
    pub event_type: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Operational slot view.
#[derive(Debug, Serialize, ToSchema)]
pub struct SlotsStatusResponse {
    pub providers: Vec<ProviderStatusView>,
    pub recent_events: Vec<SlotEventView>,
}

/// Inspect slot occupancy, queue depth, and recent slot events.
#[utoipa::path(
    get,
    path = "/admin/voice-slots/status",
    responses(
        (status = 200, description = "Slot status", body = SlotsStatusResponse),
        (status = 403, description = "Admin access denied", body = ErrorSchema)
    ),
    tags = ["admin"],
    operation_id = "voiceSlotsStatus"
)]
#[get("/admin/voice-slots/status")]
pub async fn voice_slots_status(
    state: web::Data<HttpState>,
    _admin: AdminGuard,
) -> ApiResult<web::Json<SlotsStatusResponse>> {
    let status = state
        .slots
        .status()
        .await
        .map_err(|error| Error::internal(error.to_string()))?;

    Ok(web::Json(SlotsStatusResponse {
        providers: status
            .providers
            .into_iter()
            .map(|provider| ProviderStatusView {
                provider: provider.provider.as_str().to_string(),
                active: provider.active,
                slot_limit: provider.slot_limit,
                queue_length: provider.queue_length,
                queued: provider
                    .queued
                    .into_iter()
                    .map(|entry| QueuedEntryView {
                        voice_id: entry.voice_id,
                        user_id: entry.user_id,
                        enqueued_at: entry.enqueued_at,
                        attempts: entry.attempts,
                    })
                    .collect(),
            })
            .collect(),
        recent_events: status
            .recent_events
            .into_iter()
            .map(|event| SlotEventView {
                voice_id: event.voice_id,
                event_type: event.event_type.as_str().to_string(),
                reason: event.reason,
                created_at: event.created_at,
            })
            .collect(),
    }))
}

/// Force an immediate queue drain beat for every provider.
#[utoipa::path(
    post,
    path = "/admin/voice-slots/process-queue",
    responses(
        (status = 202, description = "Drain scheduled"),
        (status = 403, description = "Admin access denied", body = ErrorSchema)
    ),
    tags = ["admin"],
    operation_id = "forceProcessQueue"
)]
#[post("/admin/voice-slots/process-queue")]
pub async fn force_process_queue(
    state: web::Data<HttpState>,
    _admin: AdminGuard,
) -> ApiResult<HttpResponse> {
    for provider in Provider::ALL {
        state
            .dispatcher
            .dispatch(WorkerTask::ProcessQueue { provider })
            .map_err(|error| Error::service_unavailable(error.to_string()))?;
    }
    Ok(HttpResponse::Accepted().json(serde_json::json!({ "status": "scheduled" })))
}
