use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::QueueStore;
use crate::error::{QueueError, StoreError};
use crate::processor::{BatchSummary, ItemOutcome, JobProcessor};
use crate::{OwnerId, QueueItem};

/// What a batch trigger asked for. `owner` is set for user-scoped triggers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimFilter {
    pub specific_id: Option<Uuid>,
    pub max_items: Option<i64>,
    pub owner: Option<OwnerId>,
}

/// Clamps a requested batch size to `[1, ceiling]`; absent means the ceiling.
pub fn clamp_batch_size(requested: Option<i64>, ceiling: i64) -> i64 {
    let ceiling = ceiling.max(1);
    requested.unwrap_or(ceiling).clamp(1, ceiling)
}

pub struct Scheduler {
    store: Arc<dyn QueueStore>,
    processor: JobProcessor,
    ceiling: i64,
}

impl Scheduler {
    pub fn new(store: Arc<dyn QueueStore>, processor: JobProcessor, ceiling: i64) -> Self {
        Scheduler {
            store,
            processor,
            ceiling: ceiling.max(1),
        }
    }

    /// Read-only selection. Exclusivity comes from the processor's
    /// `QueueStore::claim`, not from this read.
    pub async fn claim_batch(&self, filter: &ClaimFilter) -> Result<Vec<QueueItem>, StoreError> {
        if let Some(id) = filter.specific_id {
            let item = self.store.get(id).await?;
            return Ok(item
                .into_iter()
                .filter(|item| filter.owner.as_ref().map_or(true, |owner| item.owner_id == *owner))
                .collect());
        }

        let limit = clamp_batch_size(filter.max_items, self.ceiling);
        self.store.list_pending(filter.owner.as_ref(), limit).await
    }

    /// Claims a batch and processes it sequentially.
    #[instrument(skip(self))]
    pub async fn run_batch(&self, filter: ClaimFilter) -> Result<BatchSummary, QueueError> {
        let items = self.claim_batch(&filter).await?;
        let mut summary = BatchSummary::default();

        for item in &items {
            match self.processor.process(item).await {
                Ok(outcome) => summary.record(outcome),
                Err(err @ (QueueError::InvalidTransition { .. } | QueueError::NotFound(_))) => {
                    warn!(item_id = %item.id, error = %err, "Item changed underneath processor");
                    summary.record(ItemOutcome::skipped(item, err.to_string()));
                }
                Err(err) => {
                    error!(item_id = %item.id, error = %err, "Aborting batch");
                    return Err(err);
                }
            }
        }

        info!(
            claimed = items.len(),
            processed = summary.processed,
            completed = summary.completed,
            failed = summary.failed,
            "Batch finished"
        );
        Ok(summary)
    }

    /// Returns items stuck in `processing` for longer than `older_than` to the queue.
    pub async fn release_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| QueueError::validation(format!("stale threshold out of range: {e}")))?;
        let released = self
            .store
            .release_stale(Utc::now() - age, "processing abandoned; requeued")
            .await?;
        if released > 0 {
            warn!(released, "Released stale processing items");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::processor::OutcomeStatus;
    use crate::retry::RetryPolicy;
    use crate::state::Transition;
    use crate::testing::{enqueue, http_error, FakeTranscriber};
    use crate::Status;

    fn scheduler(store: &Arc<MemoryStore>, fake: &Arc<FakeTranscriber>) -> Scheduler {
        let processor = JobProcessor::new(store.clone(), store.clone(), fake.clone(), RetryPolicy::new(3));
        Scheduler::new(store.clone(), processor, 5)
    }

    #[test]
    fn batch_size_is_clamped() {
        assert_eq!(clamp_batch_size(Some(10), 5), 5);
        assert_eq!(clamp_batch_size(Some(0), 5), 1);
        assert_eq!(clamp_batch_size(Some(-4), 5), 1);
        assert_eq!(clamp_batch_size(Some(3), 5), 3);
        assert_eq!(clamp_batch_size(None, 5), 5);
    }

    #[tokio::test]
    async fn claims_by_priority_then_fifo() {
        let store = Arc::new(MemoryStore::new());
        let fake = Arc::new(FakeTranscriber::new(vec![]));
        let t1 = enqueue(&store, "alice", "t1", 5).await;
        let t2 = enqueue(&store, "alice", "t2", 1).await;
        let t3 = enqueue(&store, "alice", "t3", 5).await;

        let claimed = scheduler(&store, &fake).claim_batch(&ClaimFilter::default()).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|item| item.id).collect();

        assert_eq!(ids, vec![t1.id, t3.id, t2.id]);
    }

    #[tokio::test]
    async fn batch_is_bounded_by_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let fake = Arc::new(FakeTranscriber::new(vec![]));
        for i in 0..8 {
            enqueue(&store, "alice", &format!("m{i}"), 0).await;
        }
        let scheduler = scheduler(&store, &fake);

        let filter = ClaimFilter { max_items: Some(10), ..Default::default() };
        assert_eq!(scheduler.claim_batch(&filter).await.unwrap().len(), 5);
        let filter = ClaimFilter { max_items: Some(0), ..Default::default() };
        assert_eq!(scheduler.claim_batch(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_only_reads() {
        let store = Arc::new(MemoryStore::new());
        let fake = Arc::new(FakeTranscriber::new(vec![]));
        let item = enqueue(&store, "alice", "abc", 0).await;

        scheduler(&store, &fake).claim_batch(&ClaimFilter::default()).await.unwrap();

        assert_eq!(store.get(item.id).await.unwrap().unwrap().status, Status::Pending);
    }

    #[tokio::test]
    async fn specific_id_ignores_status_but_respects_owner() {
        let store = Arc::new(MemoryStore::new());
        let fake = Arc::new(FakeTranscriber::new(vec![]));
        let item = enqueue(&store, "alice", "abc", 0).await;
        store.apply(item.id, &Transition::Claim).await.unwrap();
        let scheduler = scheduler(&store, &fake);

        let filter = ClaimFilter { specific_id: Some(item.id), ..Default::default() };
        assert_eq!(scheduler.claim_batch(&filter).await.unwrap().len(), 1);

        let filter = ClaimFilter {
            specific_id: Some(item.id),
            owner: Some(OwnerId("mallory".into())),
            ..Default::default()
        };
        assert!(scheduler.claim_batch(&filter).await.unwrap().is_empty());

        let filter = ClaimFilter { specific_id: Some(Uuid::new_v4()), ..Default::default() };
        assert!(scheduler.claim_batch(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn owner_scoped_batch_leaves_other_users_alone() {
        let store = Arc::new(MemoryStore::new());
        let fake = Arc::new(FakeTranscriber::new(vec![]));
        let mine = enqueue(&store, "alice", "a", 0).await;
        let theirs = enqueue(&store, "bob", "b", 9).await;

        let filter = ClaimFilter { owner: Some(OwnerId("alice".into())), ..Default::default() };
        let summary = scheduler(&store, &fake).run_batch(filter).await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.results[0].item_id, mine.id);
        assert_eq!(store.get(theirs.id).await.unwrap().unwrap().status, Status::Pending);
    }

    #[tokio::test]
    async fn batch_summary_aggregates_outcomes() {
        let store = Arc::new(MemoryStore::new());
        let fake = Arc::new(FakeTranscriber::new(vec![
            Ok(crate::testing::transcript_body("one")),
            Err(http_error(404, "missing")),
            Err(http_error(502, "bad gateway")),
        ]));
        enqueue(&store, "alice", "a", 3).await;
        enqueue(&store, "alice", "b", 2).await;
        enqueue(&store, "alice", "c", 1).await;

        let summary = scheduler(&store, &fake).run_batch(ClaimFilter::default()).await.unwrap();

        assert_eq!((summary.processed, summary.completed, summary.failed), (3, 1, 2));
        let statuses: Vec<_> = summary.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![OutcomeStatus::Completed, OutcomeStatus::Failed, OutcomeStatus::Retrying]
        );
    }

    #[tokio::test]
    async fn overlapping_batches_process_each_item_once() {
        let store = Arc::new(MemoryStore::new());
        let fake = Arc::new(FakeTranscriber::new(vec![]).with_delay(Duration::from_millis(10)));
        for i in 0..4 {
            enqueue(&store, "alice", &format!("m{i}"), 0).await;
        }
        let first = scheduler(&store, &fake);
        let second = scheduler(&store, &fake);

        let (a, b) = tokio::join!(
            first.run_batch(ClaimFilter::default()),
            second.run_batch(ClaimFilter::default())
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.completed + b.completed, 4);
        assert_eq!(fake.calls(), 4);
        assert_eq!(store.counts().await.unwrap().completed, 4);
    }

    #[tokio::test]
    async fn stale_items_are_released() {
        let store = Arc::new(MemoryStore::new());
        let fake = Arc::new(FakeTranscriber::new(vec![]));
        let item = enqueue(&store, "alice", "abc", 0).await;
        store.apply(item.id, &Transition::Claim).await.unwrap();
        let scheduler = scheduler(&store, &fake);

        assert_eq!(scheduler.release_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(scheduler.release_stale(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(store.get(item.id).await.unwrap().unwrap().status, Status::Pending);
    }
}
