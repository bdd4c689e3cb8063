//! Synthesis HTTP handlers.
//!
//! ```text
//! POST /voices/{voice}/stories/{story}/audio  Start (or poll) synthesis
//! GET  /voices/{voice}/stories/{story}/audio  Fetch the artifact
//! ```
//!
//! Clients poll the POST endpoint; it is idempotent per `(voice, story)`.

use actix_web::http::header;
use actix_web::{get, post, web, HttpRequest, HttpResponse};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::ids::{JobId, StoryId, VoiceId};
use crate::domain::ports::ArtifactStoreError;
use crate::domain::synthesis::{StartOutcome, SynthesisJob};
use crate::domain::Error;
use crate::inbound::http::auth::AuthedUser;
use crate::inbound::http::schemas::ErrorSchema;
use crate::inbound::http::state::HttpState;
use crate::inbound::http::ApiResult;

pub const QUEUE_POSITION_HEADER: &str = "X-Voice-Queue-Position";
pub const QUEUE_LENGTH_HEADER: &str = "X-Voice-Queue-Length";
pub const REMOTE_ID_HEADER: &str = "X-Voice-Remote-ID";

/// Synthesis status payload.
#[derive(Debug, Serialize, ToSchema)]
pub struct SynthesisResponse {
    /// `ready`, `processing`, `allocating_voice`, or `queued_for_slot`.
    pub status: String,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_length: Option<u32>,
}

/// Start or poll synthesis of a story with a voice.
#[utoipa::path(
    post,
    path = "/voices/{voice_id}/stories/{story_id}/audio",
    responses(
        (status = 200, description = "Artifact already exists", body = SynthesisResponse),
        (status = 202, description = "Synthesis accepted", body = SynthesisResponse),
        (status = 402, description = "Insufficient credits", body = ErrorSchema),
        (status = 404, description = "Unknown voice or story", body = ErrorSchema),
        (status = 409, description = "Voice unavailable", body = ErrorSchema)
    ),
    params(
        ("voice_id" = uuid::Uuid, Path, description = "Voice identifier"),
        ("story_id" = uuid::Uuid, Path, description = "Story identifier")
    ),
    tags = ["audio"],
    operation_id = "startSynthesis"
)]
#[post("/voices/{voice_id}/stories/{story_id}/audio")]
pub async fn start_synthesis(
    state: web::Data<HttpState>,
    user: AuthedUser,
    path: web::Path<(uuid::Uuid, uuid::Uuid)>,
) -> ApiResult<HttpResponse> {
    let (voice_id, story_id) = path.into_inner();
    let voice_id = VoiceId::from_uuid(voice_id);
    let story_id = StoryId::from_uuid(story_id);

    let outcome = state
        .orchestrator
        .start_synthesis(user.0, voice_id, story_id)
        .await?;

    Ok(match outcome {
        StartOutcome::AlreadyReady {
            job,
            remote_voice_id,
            artifact_url,
        } => {
            let mut response = HttpResponse::Ok();
            if let Some(remote_voice_id) = remote_voice_id {
                response.insert_header((REMOTE_ID_HEADER, remote_voice_id));
            }
            response.json(SynthesisResponse {
                status: "ready".to_string(),
                job_id: job.id,
                url: artifact_url,
                queue_position: None,
                queue_length: None,
            })
        }
        StartOutcome::Processing { job_id } | StartOutcome::AlreadyProcessing { job_id } => {
            HttpResponse::Accepted().json(SynthesisResponse {
                status: "processing".to_string(),
                job_id,
                url: None,
                queue_position: None,
                queue_length: None,
            })
        }
        StartOutcome::AllocatingVoice {
            job_id,
            queue_position,
        } => HttpResponse::Accepted().json(SynthesisResponse {
            status: "allocating_voice".to_string(),
            job_id,
            url: None,
            queue_position,
            queue_length: None,
        }),
        StartOutcome::QueuedForSlot {
            job_id,
            queue_position,
            queue_length,
        } => {
            let mut response = HttpResponse::Accepted();
            response.insert_header((QUEUE_POSITION_HEADER, queue_position.to_string()));
            response.insert_header((QUEUE_LENGTH_HEADER, queue_length.to_string()));
            response.json(SynthesisResponse {
                status: "queued_for_slot".to_string(),
                job_id,
                url: None,
                queue_position: Some(queue_position),
                queue_length: Some(queue_length),
            })
        }
    })
}

/// Inclusive byte range parsed from a `Range` header.
fn parse_range(header: &str) -> Option<(u64, Option<u64>)> {
    let spec = header.strip_prefix("bytes=")?;
    // Only single ranges are honoured; multipart ranges fall back to 200.
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        value => Some(value.parse::<u64>().ok()?),
    };
    if let Some(end) = end {
        if end < start {
            return None;
        }
    }
    Some((start, end))
}

fn ready_artifact_key(job: &SynthesisJob) -> Option<&str> {
    if job.status == crate::domain::synthesis::JobStatus::Ready {
        job.artifact_blob_key.as_deref()
    } else {
        None
    }
}

/// Fetch synthesized audio, honouring `Range` requests or redirecting to a
/// public URL when the blob backend provides one.
#[utoipa::path(
    get,
    path = "/voices/{voice_id}/stories/{story_id}/audio",
    responses(
        (status = 200, description = "Full audio body"),
        (status = 206, description = "Partial audio body"),
        (status = 302, description = "Redirect to the artifact URL"),
        (status = 404, description = "Audio not ready", body = ErrorSchema)
    ),
    params(
        ("voice_id" = uuid::Uuid, Path, description = "Voice identifier"),
        ("story_id" = uuid::Uuid, Path, description = "Story identifier")
    ),
    tags = ["audio"],
    operation_id = "fetchAudio"
)]
#[get("/voices/{voice_id}/stories/{story_id}/audio")]
pub async fn fetch_audio(
    state: web::Data<HttpState>,
    user: AuthedUser,
    path: web::Path<(uuid::Uuid, uuid::Uuid)>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let (voice_id, story_id) = path.into_inner();
    let job = state
        .orchestrator
        .job_for_story(
            user.0,
            VoiceId::from_uuid(voice_id),
            StoryId::from_uuid(story_id),
        )
        .await?;
    let Some(key) = job.as_ref().and_then(ready_artifact_key) else {
        return Err(Error::not_found("audio is not ready"));
    };

    if let Some(url) = state.blobs.public_url(key) {
        return Ok(HttpResponse::Found()
            .insert_header((header::LOCATION, url))
            .finish());
    }

    let range = req
        .headers()
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_range);

    let chunk = state.blobs.read(key, range).await.map_err(|error| match error {
        ArtifactStoreError::NotFound { .. } => Error::not_found("audio is not ready"),
        ArtifactStoreError::RangeNotSatisfiable { .. } => {
            Error::invalid_request("requested range not satisfiable")
        }
        ArtifactStoreError::Io { message } => Error::service_unavailable(message),
    })?;

    let mut response = if range.is_some() {
        let mut partial = HttpResponse::PartialContent();
        let end = chunk.offset + chunk.bytes.len() as u64 - 1;
        partial.insert_header((
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", chunk.offset, end, chunk.total_len),
        ));
        partial
    } else {
        HttpResponse::Ok()
    };
    Ok(response
        .insert_header((header::ACCEPT_RANGES, "bytes"))
        .insert_header((header::CONTENT_TYPE, "audio/mpeg"))
        .body(chunk.bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::full("bytes=0-", Some((0, None)))]
    #[case::window("bytes=100-199", Some((100, Some(199))))]
    #[case::tail_open("bytes=42-", Some((42, None)))]
    #[case::inverted("bytes=200-100", None)]
    #[case::missing_unit("0-100", None)]
    #[case::garbage("bytes=abc-def", None)]
    fn range_header_parsing(#[case] raw: &str, #[case] expected: Option<(u64, Option<u64>)>) {
        assert_eq!(parse_range(raw), expected);
    }
}
