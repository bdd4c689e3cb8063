//! Voice HTTP handlers.
//!
//! ```text
//! POST   /voices       Upload a sample; voice starts in `recorded`
//! GET    /voices/{id}  Inspect a voice
//! DELETE /voices/{id}  Delete voice, artifacts, and remote slot
//! ```

use actix_web::{delete, get, post, web, HttpResponse};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::ids::VoiceId;
use crate::domain::voices::{Provider, Voice};
use crate::domain::Error;
use crate::inbound::http::auth::AuthedUser;
use crate::inbound::http::schemas::ErrorSchema;
use crate::inbound::http::state::HttpState;
use crate::inbound::http::ApiResult;

/// Voice upload payload. The sample travels base64-encoded; the gateway
/// enforces upload size limits before the request reaches this service.
#[derive(Debug, Deserialize, ToSchema)]
pub struct UploadVoiceBody {
    pub name: String,
    /// `primary` (default) or `secondary`.
    #[serde(default)]
    pub provider: Option<String>,
    /// Base64-encoded audio sample.
    pub sample_base64: String,
}

/// Response for a freshly uploaded voice.
#[derive(Debug, Serialize, ToSchema)]
pub struct UploadVoiceResponse {
    pub voice_id: VoiceId,
    #[schema(example = "recorded")]
    pub status: String,
}

/// Full voice view.
#[derive(Debug, Serialize, ToSchema)]
pub struct VoiceView {
    pub voice_id: VoiceId,
    pub name: String,
    pub provider: String,
    pub status: String,
    pub remote_voice_id: Option<String>,
    pub queue_position: Option<u32>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl VoiceView {
    fn from_voice(voice: Voice, queue_position: Option<u32>) -> Self {
        Self {
            voice_id: voice.id,
            name: voice.name,
            provider: voice.provider.as_str().to_string(),
            status: voice.allocation_status.as_str().to_string(),
            remote_voice_id: voice.remote_voice_id,
            queue_position,
            last_used_at: voice.last_used_at,
            allocated_at: voice.allocated_at,
            error_message: voice.error_message,
            created_at: voice.created_at,
        }
    }
}

fn parse_provider(raw: Option<&str>) -> Result<Provider, Error> {
    match raw {
        None => Ok(Provider::Primary),
        Some(value) => value
            .parse::<Provider>()
            .map_err(|message| Error::invalid_request(message)),
    }
}

/// Upload a voice sample.
#[utoipa::path(
    post,
    path = "/voices",
    request_body = UploadVoiceBody,
    responses(
        (status = 201, description = "Voice recorded", body = UploadVoiceResponse),
        (status = 400, description = "Malformed upload", body = ErrorSchema),
        (status = 401, description = "Unauthorized", body = ErrorSchema)
    ),
    tags = ["voices"],
    operation_id = "uploadVoice"
)]
#[post("/voices")]
pub async fn upload_voice(
    state: web::Data<HttpState>,
    user: AuthedUser,
    body: web::Json<UploadVoiceBody>,
) -> ApiResult<HttpResponse> {
    let body = body.into_inner();
    let provider = parse_provider(body.provider.as_deref())?;
    let sample = base64::engine::general_purpose::STANDARD
        .decode(body.sample_base64.as_bytes())
        .map_err(|_| Error::invalid_request("sample_base64 is not valid base64"))?;

    let voice = state
        .voice_service
        .upload(user.0, body.name, provider, sample)
        .await?;
    Ok(HttpResponse::Created().json(UploadVoiceResponse {
        voice_id: voice.id,
        status: voice.allocation_status.as_str().to_string(),
    }))
}

/// Inspect one of the caller's voices.
#[utoipa::path(
    get,
    path = "/voices/{voice_id}",
    responses(
        (status = 200, description = "Voice details", body = VoiceView),
        (status = 404, description = "Unknown voice", body = ErrorSchema)
    ),
    params(("voice_id" = uuid::Uuid, Path, description = "Voice identifier")),
    tags = ["voices"],
    operation_id = "getVoice"
)]
#[get("/voices/{voice_id}")]
pub async fn get_voice(
    state: web::Data<HttpState>,
    user: AuthedUser,
    path: web::Path<uuid::Uuid>,
) -> ApiResult<web::Json<VoiceView>> {
    let voice_id = VoiceId::from_uuid(path.into_inner());
    let (voice, queue_position) = state.voice_service.get(user.0, voice_id).await?;
    Ok(web::Json(VoiceView::from_voice(voice, queue_position)))
}

/// Delete a voice together with its artifacts and remote slot.
#[utoipa::path(
    delete,
    path = "/voices/{voice_id}",
    responses(
        (status = 200, description = "Voice deleted"),
        (status = 404, description = "Unknown voice", body = ErrorSchema)
    ),
    params(("voice_id" = uuid::Uuid, Path, description = "Voice identifier")),
    tags = ["voices"],
    operation_id = "deleteVoice"
)]
#[delete("/voices/{voice_id}")]
pub async fn delete_voice(
    state: web::Data<HttpState>,
    user: AuthedUser,
    path: web::Path<uuid::Uuid>,
) -> ApiResult<HttpResponse> {
    let voice_id = VoiceId::from_uuid(path.into_inner());
    state.voice_service.delete(user.0, voice_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "deleted": true })))
}
