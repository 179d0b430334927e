use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

pub mod api;
pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod memory;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

/// Opaque identifier of the user owning a queue item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct OwnerId(pub String);

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub owner_id: OwnerId,
    pub media_id: String,
    pub language: Option<String>,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: Uuid,
    pub owner_id: OwnerId,
    pub media_id: String,
    pub language: Option<String>,
    pub status: Status,
    pub priority: i32,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub transcript_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "queue_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    /// Pending and processing items are "in flight": at most one per owner and media id.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Status::Pending | Status::Processing)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-aligned piece of transcript text.
///
/// The worker reports either explicit `start`/`end` offsets or a
/// `timestamp: [start, end]` pair; both land here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSegment")]
pub struct Segment {
    pub text: String,
    pub start: Option<f64>,
    pub end: Option<f64>,
}

#[derive(Deserialize)]
struct RawSegment {
    #[serde(default)]
    text: String,
    start: Option<f64>,
    end: Option<f64>,
    timestamp: Option<(Option<f64>, Option<f64>)>,
}

impl From<RawSegment> for Segment {
    fn from(raw: RawSegment) -> Self {
        let (ts_start, ts_end) = raw.timestamp.unwrap_or((None, None));
        Segment {
            text: raw.text.trim().to_string(),
            start: raw.start.or(ts_start),
            end: raw.end.or(ts_end),
        }
    }
}

/// Successful worker output, before it is stored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptBody {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<Segment>,
    pub language: Option<String>,
    pub confidence: Option<f64>,
    pub duration: Option<f64>,
    pub word_count: Option<i32>,
    pub processing_duration: Option<f64>,
}

impl TranscriptBody {
    pub fn word_count(&self) -> i32 {
        self.word_count
            .unwrap_or_else(|| self.text.split_whitespace().count() as i32)
    }
}

/// The stored transcription of one media item, shared by every queue item
/// referencing the same media id.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub id: Uuid,
    pub media_id: String,
    pub content: String,
    pub segments: Json<Vec<Segment>>,
    pub language: Option<String>,
    pub confidence: Option<f64>,
    pub duration: Option<f64>,
    pub word_count: i32,
    pub processing_duration: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Transcript {
    pub fn from_body(media_id: &str, body: &TranscriptBody) -> Self {
        Transcript {
            id: Uuid::new_v4(),
            media_id: media_id.to_string(),
            content: body.text.trim().to_string(),
            segments: Json(body.segments.clone()),
            language: body.language.clone(),
            confidence: body.confidence,
            duration: body.duration,
            word_count: body.word_count(),
            processing_duration: body.processing_duration,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: Status, count: i64) {
        match status {
            Status::Pending => self.pending += count,
            Status::Processing => self.processing += count,
            Status::Completed => self.completed += count,
            Status::Failed => self.failed += count,
        }
        self.total += count;
    }
}
