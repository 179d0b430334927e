use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::client::{Liveness, Transcriber, WorkerHealth};
use crate::db::QueueStore;
use crate::error::WorkerError;
use crate::memory::MemoryStore;
use crate::{JobRequest, OwnerId, QueueItem, TranscriptBody};

/// Replays scripted worker answers in order; succeeds once the script runs out.
pub struct FakeTranscriber {
    script: Mutex<VecDeque<Result<TranscriptBody, WorkerError>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeTranscriber {
    pub fn new(script: Vec<Result<TranscriptBody, WorkerError>>) -> Self {
        FakeTranscriber {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, media_id: &str, _language: Option<&str>) -> Result<TranscriptBody, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(transcript_body(&format!("transcript of {media_id}"))))
    }

    async fn health(&self) -> WorkerHealth {
        WorkerHealth {
            status: Liveness::Healthy,
            error: None,
            model: Some("fake".into()),
        }
    }
}

pub fn transcript_body(text: &str) -> TranscriptBody {
    TranscriptBody {
        text: text.to_string(),
        segments: vec![],
        language: Some("en".into()),
        confidence: None,
        duration: Some(12.5),
        word_count: None,
        processing_duration: Some(1.0),
    }
}

pub fn http_error(status: u16, message: &str) -> WorkerError {
    WorkerError::Http {
        status: StatusCode::from_u16(status).unwrap(),
        message: message.to_string(),
    }
}

pub async fn enqueue(store: &MemoryStore, owner: &str, media_id: &str, priority: i32) -> QueueItem {
    store
        .insert_pending(&JobRequest {
            owner_id: OwnerId(owner.into()),
            media_id: media_id.into(),
            language: None,
            priority,
        })
        .await
        .unwrap()
        .expect("no in-flight duplicate")
}
