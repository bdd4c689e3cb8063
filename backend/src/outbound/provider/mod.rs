//! Reqwest-backed TTS provider adapter.
//!
//! Owns transport details only: request serialisation, timeout handling, and
//! HTTP status mapping into [`RemoteVoiceError`]. The slot manager never sees
//! HTTP concerns.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::domain::ports::{DeleteOutcome, RemoteVoiceAdapter, RemoteVoiceError};

const API_KEY_HEADER: &str = "X-Api-Key";

/// Remote voice adapter speaking the provider's HTTP API.
pub struct HttpRemoteVoiceAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateVoiceResponse {
    voice_id: String,
}

impl HttpRemoteVoiceAdapter {
    /// Build an adapter with an explicit per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns an error when the reqwest client cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }
}

fn map_transport_error(error: reqwest::Error) -> RemoteVoiceError {
    if error.is_timeout() {
        RemoteVoiceError::timeout(error.to_string())
    } else {
        RemoteVoiceError::transport(error.to_string())
    }
}

fn map_status_error(status: StatusCode, body: &[u8]) -> RemoteVoiceError {
    let message = format!("status {}: {}", status.as_u16(), body_preview(body));
    match status {
        StatusCode::TOO_MANY_REQUESTS => RemoteVoiceError::rate_limited(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            RemoteVoiceError::timeout(message)
        }
        _ if status.is_client_error() => RemoteVoiceError::rejected(message),
        _ => RemoteVoiceError::transport(message),
    }
}

fn body_preview(body: &[u8]) -> String {
    const PREVIEW_CHAR_LIMIT: usize = 160;

    let compact = String::from_utf8_lossy(body)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let preview = compact.chars().take(PREVIEW_CHAR_LIMIT).collect::<String>();
    if compact.chars().count() > PREVIEW_CHAR_LIMIT {
        format!("{preview}...")
    } else {
        preview
    }
}

#[async_trait]
impl RemoteVoiceAdapter for HttpRemoteVoiceAdapter {
    async fn create_voice(
        &self,
        sample: &[u8],
        name: &str,
    ) -> Result<String, RemoteVoiceError> {
        let response = self
            .request(self.client.post(format!("{}/v1/voices", self.base_url)))
            .json(&serde_json::json!({
                "name": name,
                "sample_base64": base64::engine::general_purpose::STANDARD.encode(sample),
            }))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, body.as_ref()));
        }
        let decoded: CreateVoiceResponse = serde_json::from_slice(body.as_ref())
            .map_err(|error| RemoteVoiceError::rejected(format!("invalid provider payload: {error}")))?;
        Ok(decoded.voice_id)
    }

    async fn delete_voice(&self, remote_id: &str) -> Result<DeleteOutcome, RemoteVoiceError> {
        let response = self
            .request(
                self.client
                    .delete(format!("{}/v1/voices/{remote_id}", self.base_url)),
            )
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::NotFound);
        }
        let body = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, body.as_ref()));
        }
        Ok(DeleteOutcome::Deleted)
    }

    async fn synthesize(&self, remote_id: &str, text: &str) -> Result<Vec<u8>, RemoteVoiceError> {
        let response = self
            .request(
                self.client
                    .post(format!("{}/v1/voices/{remote_id}/synthesize", self.base_url)),
            )
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        // The remote reclaims voices without notice; a 404 here is drift,
        // not a caller mistake.
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteVoiceError::VoiceMissing);
        }
        let body = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, body.as_ref()));
        }
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::rate_limited(StatusCode::TOO_MANY_REQUESTS, "RateLimited")]
    #[case::request_timeout(StatusCode::REQUEST_TIMEOUT, "Timeout")]
    #[case::gateway_timeout(StatusCode::GATEWAY_TIMEOUT, "Timeout")]
    #[case::bad_request(StatusCode::BAD_REQUEST, "Rejected")]
    #[case::server_error(StatusCode::INTERNAL_SERVER_ERROR, "Transport")]
    fn maps_http_statuses_to_expected_errors(#[case] status: StatusCode, #[case] expected: &str) {
        let error = map_status_error(status, b"{\"detail\":\"nope\"}");
        let matches = match expected {
            "RateLimited" => matches!(error, RemoteVoiceError::RateLimited { .. }),
            "Timeout" => matches!(error, RemoteVoiceError::Timeout { .. }),
            "Rejected" => matches!(error, RemoteVoiceError::Rejected { .. }),
            "Transport" => matches!(error, RemoteVoiceError::Transport { .. }),
            other => panic!("unsupported expectation: {other}"),
        };
        assert!(matches, "{status} should map to {expected}");
    }

    #[rstest]
    fn long_bodies_are_previewed() {
        let body = "x".repeat(500);
        let error = map_status_error(StatusCode::BAD_GATEWAY, body.as_bytes());
        let message = error.to_string();
        assert!(message.contains("..."), "long bodies are truncated: {message}");
        assert!(message.len() < 300);
    }
}
