use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::WorkerError;
use crate::TranscriptBody;

/// Body fields checked, in order, for a human readable error message.
const ERROR_FIELDS: [&str; 3] = ["error", "detail", "message"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Healthy,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerHealth {
    pub status: Liveness,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl WorkerHealth {
    fn unreachable(error: String) -> Self {
        WorkerHealth {
            status: Liveness::Unreachable,
            error: Some(error),
            model: None,
        }
    }
}

/// Whatever turns a media id into a transcript.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, media_id: &str, language: Option<&str>) -> Result<TranscriptBody, WorkerError>;

    /// Liveness probe; failures are reported in the result, never raised.
    async fn health(&self) -> WorkerHealth;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TranscribeRequest<'a> {
    media_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
}

#[derive(Deserialize)]
struct HealthResponse {
    model: Option<String>,
}

/// HTTP client for the external transcription worker.
pub struct WorkerClient {
    client: reqwest::Client,
    base_url: String,
    secret: String,
    transcribe_timeout: Duration,
    health_timeout: Duration,
    cancel_token: CancellationToken,
}

impl WorkerClient {
    pub fn new(
        base_url: &str,
        secret: &str,
        transcribe_timeout: Duration,
        health_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| WorkerError::Transport(e.to_string()))?;

        Ok(WorkerClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
            transcribe_timeout,
            health_timeout,
            cancel_token,
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> WorkerError {
        if err.is_timeout() {
            WorkerError::Timeout(self.transcribe_timeout.as_secs())
        } else {
            WorkerError::Transport(err.to_string())
        }
    }

    async fn send_transcribe(&self, media_id: &str, language: Option<&str>) -> Result<TranscriptBody, WorkerError> {
        let response = self
            .client
            .post(format!("{}/transcribe", self.base_url))
            .bearer_auth(&self.secret)
            .timeout(self.transcribe_timeout)
            .json(&TranscribeRequest { media_id, language })
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(WorkerError::Http {
                status,
                message: error_message(status, &body),
            });
        }

        serde_json::from_str(&body).map_err(|e| WorkerError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Transcriber for WorkerClient {
    #[instrument(skip(self), fields(worker = %self.base_url))]
    async fn transcribe(&self, media_id: &str, language: Option<&str>) -> Result<TranscriptBody, WorkerError> {
        debug!("Dispatching to worker");
        tokio::select! {
            _ = self.cancel_token.cancelled() => Err(WorkerError::Cancelled),
            result = self.send_transcribe(media_id, language) => result,
        }
    }

    #[instrument(skip(self), fields(worker = %self.base_url))]
    async fn health(&self) -> WorkerHealth {
        let response = match self
            .client
            .get(format!("{}/", self.base_url))
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "Worker health check failed");
                return WorkerHealth::unreachable(err.to_string());
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return WorkerHealth::unreachable(error_message(status, &body));
        }

        WorkerHealth {
            status: Liveness::Healthy,
            error: None,
            model: serde_json::from_str::<HealthResponse>(&body)
                .ok()
                .and_then(|h| h.model),
        }
    }
}

/// Picks the first usable message out of an error body, falling back to the
/// status line when the body is not JSON or carries none.
pub fn error_message(status: StatusCode, body: &str) -> String {
    let status_line = || {
        format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or_default())
            .trim_end()
            .to_string()
    };

    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return status_line();
    };

    ERROR_FIELDS
        .iter()
        .filter_map(|field| value.get(field))
        .find_map(|found| match found {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.trim().is_empty() => None,
            serde_json::Value::String(s) => Some(s.trim().to_string()),
            serde_json::Value::Object(obj) => match obj.get("message") {
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                _ => Some(found.to_string()),
            },
            other => Some(other.to_string()),
        })
        .unwrap_or_else(status_line)
}
