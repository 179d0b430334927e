use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::CacheChecker;
use crate::client::Transcriber;
use crate::db::{QueueStore, TranscriptStore};
use crate::error::QueueError;
use crate::retry::{ErrorClass, JobFailure, RetryAction, RetryPolicy};
use crate::state::Transition;
use crate::{QueueItem, Status, Transcript};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// Transcribed by the worker during this run.
    Completed,
    /// Completed from an existing transcript without calling the worker.
    Cached,
    /// Failed, back in the queue for another attempt.
    Retrying,
    Failed,
    /// Not processed: not pending, or claimed by another processor.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub item_id: Uuid,
    pub media_id: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the item will be attempted again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ItemOutcome {
    fn completed(item: &QueueItem, status: OutcomeStatus, transcript_id: Uuid) -> Self {
        ItemOutcome {
            item_id: item.id,
            media_id: item.media_id.clone(),
            status,
            transcript_id: Some(transcript_id),
            error: None,
            retryable: None,
        }
    }

    pub fn skipped(item: &QueueItem, reason: String) -> Self {
        ItemOutcome {
            item_id: item.id,
            media_id: item.media_id.clone(),
            status: OutcomeStatus::Skipped,
            transcript_id: None,
            error: Some(reason),
            retryable: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub results: Vec<ItemOutcome>,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: ItemOutcome) {
        match outcome.status {
            OutcomeStatus::Completed | OutcomeStatus::Cached => {
                self.processed += 1;
                self.completed += 1;
            }
            OutcomeStatus::Retrying | OutcomeStatus::Failed => {
                self.processed += 1;
                self.failed += 1;
            }
            OutcomeStatus::Skipped => {}
        }
        self.results.push(outcome);
    }
}

/// Drives a single queue item from claim to a settled status.
pub struct JobProcessor {
    queue: Arc<dyn QueueStore>,
    transcripts: Arc<dyn TranscriptStore>,
    cache: CacheChecker,
    transcriber: Arc<dyn Transcriber>,
    policy: RetryPolicy,
}

impl JobProcessor {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        transcripts: Arc<dyn TranscriptStore>,
        transcriber: Arc<dyn Transcriber>,
        policy: RetryPolicy,
    ) -> Self {
        JobProcessor {
            queue,
            cache: CacheChecker::new(transcripts.clone()),
            transcripts,
            transcriber,
            policy,
        }
    }

    /// Claims `item` and settles it. Losing the claim to another processor, or
    /// an item that is not pending, yields a skipped outcome with no side effects.
    /// `item` may be stale; everything after the claim works from the claimed row.
    #[instrument(skip(self, item), fields(item_id = %item.id, media_id = %item.media_id))]
    pub async fn process(&self, item: &QueueItem) -> Result<ItemOutcome, QueueError> {
        let Some(claimed) = self.queue.claim(item.id).await? else {
            let reason = if item.status == Status::Pending {
                "already claimed by another processor".to_string()
            } else {
                format!("item is {}, not pending", item.status)
            };
            debug!(reason = %reason, "Skipping item");
            return Ok(ItemOutcome::skipped(item, reason));
        };

        // Checked on every claim, including re-claims after a partial run.
        if let Some(transcript) = self.cache.has_result(&claimed.media_id).await? {
            self.settle(claimed.id, Transition::Complete { transcript_id: transcript.id })
                .await?;
            info!(transcript_id = %transcript.id, "Completed from cache");
            return Ok(ItemOutcome::completed(&claimed, OutcomeStatus::Cached, transcript.id));
        }

        let media_id = claimed.media_id.trim();
        let attempt = if media_id.is_empty() {
            Err(JobFailure::Validation("missing media id".into()))
        } else {
            self.transcriber
                .transcribe(media_id, claimed.language.as_deref())
                .await
                .map_err(JobFailure::from)
        };

        match attempt {
            Ok(body) => {
                let stored = self
                    .transcripts
                    .save(&Transcript::from_body(&claimed.media_id, &body))
                    .await?;
                self.settle(claimed.id, Transition::Complete { transcript_id: stored.id })
                    .await?;
                info!(transcript_id = %stored.id, words = stored.word_count, "Completed job");
                Ok(ItemOutcome::completed(&claimed, OutcomeStatus::Completed, stored.id))
            }
            Err(failure) => self.record_failure(&claimed, failure).await,
        }
    }

    async fn record_failure(&self, item: &QueueItem, failure: JobFailure) -> Result<ItemOutcome, QueueError> {
        let class = failure.class();
        let decision = self.policy.decide(class, item.retry_count);
        let error = failure.to_string();

        let (transition, status) = match decision.action {
            RetryAction::Retry => (
                Transition::Retry {
                    retry_count: decision.next_retry_count,
                    error: error.clone(),
                },
                OutcomeStatus::Retrying,
            ),
            RetryAction::Fail => (
                Transition::Fail {
                    retry_count: decision.next_retry_count,
                    error: error.clone(),
                },
                OutcomeStatus::Failed,
            ),
        };
        self.settle(item.id, transition).await?;

        warn!(
            error = %error,
            attempt = decision.next_retry_count,
            max_attempts = self.policy.max_attempts(),
            retryable = class == ErrorClass::Retryable,
            "Job attempt failed"
        );

        Ok(ItemOutcome {
            item_id: item.id,
            media_id: item.media_id.clone(),
            status,
            transcript_id: None,
            error: Some(error),
            retryable: Some(decision.action == RetryAction::Retry),
        })
    }

    /// Applies a post-claim transition, which must succeed: the item is ours.
    async fn settle(&self, id: Uuid, transition: Transition) -> Result<(), QueueError> {
        if self.queue.apply(id, &transition).await? {
            return Ok(());
        }
        match self.queue.get(id).await? {
            Some(current) => Err(QueueError::InvalidTransition {
                id,
                from: current.status,
                to: transition.target(),
            }),
            None => Err(QueueError::NotFound(id)),
        }
    }
}
