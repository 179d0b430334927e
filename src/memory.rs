//! In-process store used by tests and by the binary when no database URL is configured.

use crate::db::{DeleteScope, QueueStore, TranscriptStore};
use crate::error::StoreError;
use crate::state::Transition;
use crate::{JobRequest, OwnerId, QueueItem, Status, StatusCounts, Transcript};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    // Insertion sequence breaks created_at ties so FIFO order is stable.
    items: Vec<(u64, QueueItem)>,
    next_seq: u64,
    transcripts: HashMap<String, Transcript>,
}

impl Inner {
    fn find_mut(&mut self, id: Uuid) -> Option<&mut QueueItem> {
        self.items
            .iter_mut()
            .map(|(_, item)| item)
            .find(|item| item.id == id)
    }

    fn has_in_flight(&self, owner: &OwnerId, media_id: &str, except: Option<Uuid>) -> bool {
        self.items.iter().any(|(_, item)| {
            Some(item.id) != except
                && item.owner_id == *owner
                && item.media_id == media_id
                && item.status.is_in_flight()
        })
    }

    fn sorted(&self, keep: impl Fn(&QueueItem) -> bool) -> Vec<QueueItem> {
        let mut items: Vec<&(u64, QueueItem)> =
            self.items.iter().filter(|(_, item)| keep(item)).collect();
        items.sort_by_key(|(seq, item)| (Reverse(item.priority), item.created_at, *seq));
        items.into_iter().map(|(_, item)| item.clone()).collect()
    }
}

fn write_transition(item: &mut QueueItem, transition: &Transition, now: DateTime<Utc>) {
    debug_assert!(item.status.can_transition_to(transition.target()));
    match transition {
        Transition::Claim => {
            item.processing_started_at = Some(now);
        }
        Transition::Complete { transcript_id } => {
            item.completed_at = Some(now);
            item.error_message = None;
            item.transcript_id = Some(*transcript_id);
        }
        Transition::Retry { retry_count, error } => {
            item.retry_count = *retry_count;
            item.error_message = Some(error.clone());
            item.processing_started_at = None;
        }
        Transition::Fail { retry_count, error } => {
            item.retry_count = *retry_count;
            item.error_message = Some(error.clone());
            item.completed_at = Some(now);
        }
        Transition::Requeue => {
            item.processing_started_at = None;
            item.completed_at = None;
        }
        Transition::Release { error } => {
            item.error_message = Some(error.clone());
            item.processing_started_at = None;
        }
    }
    item.status = transition.target();
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_pending(&self, job: &JobRequest) -> Result<Option<QueueItem>, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.has_in_flight(&job.owner_id, &job.media_id, None) {
            return Ok(None);
        }

        let item = QueueItem {
            id: Uuid::new_v4(),
            owner_id: job.owner_id.clone(),
            media_id: job.media_id.clone(),
            language: job.language.clone(),
            status: Status::Pending,
            priority: job.priority,
            retry_count: 0,
            error_message: None,
            transcript_id: None,
            created_at: Utc::now(),
            processing_started_at: None,
            completed_at: None,
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.items.push((seq, item.clone()));
        Ok(Some(item))
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .items
            .iter()
            .map(|(_, item)| item)
            .find(|item| item.id == id)
            .cloned())
    }

    async fn list(&self, owner: &OwnerId, status: Option<Status>) -> Result<Vec<QueueItem>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.sorted(|item| item.owner_id == *owner && status.map_or(true, |s| item.status == s)))
    }

    async fn list_pending(&self, owner: Option<&OwnerId>, limit: i64) -> Result<Vec<QueueItem>, StoreError> {
        let inner = self.inner.read().await;
        let mut items = inner.sorted(|item| {
            item.status == Status::Pending && owner.map_or(true, |o| item.owner_id == *o)
        });
        items.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(items)
    }

    async fn claim(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.find_mut(id) {
            Some(item) if item.status == Status::Pending => {
                write_transition(item, &Transition::Claim, Utc::now());
                Ok(Some(item.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn apply(&self, id: Uuid, transition: &Transition) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;

        let (owner, media_id) = match inner.find_mut(id) {
            Some(item) if item.status == transition.source() => (item.owner_id.clone(), item.media_id.clone()),
            _ => return Ok(false),
        };
        if transition.target().is_in_flight()
            && !transition.source().is_in_flight()
            && inner.has_in_flight(&owner, &media_id, Some(id))
        {
            return Err(StoreError::Conflict("media already queued for this owner".into()));
        }

        let Some(item) = inner.find_mut(id) else {
            return Ok(false);
        };
        write_transition(item, transition, Utc::now());
        Ok(true)
    }

    async fn delete(&self, owner: &OwnerId, scope: &DeleteScope) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.items.len();
        inner.items.retain(|(_, item)| {
            let selected = item.owner_id == *owner
                && match scope {
                    DeleteScope::Ids(ids) => ids.contains(&item.id),
                    DeleteScope::Status(status) => item.status == *status,
                    DeleteScope::All => true,
                };
            !selected
        });
        Ok((before - inner.items.len()) as u64)
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let inner = self.inner.read().await;
        let mut counts = StatusCounts::default();
        for (_, item) in &inner.items {
            counts.add(item.status, 1);
        }
        Ok(counts)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>, error: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let release = Transition::Release { error: error.to_string() };
        let now = Utc::now();
        let mut released = 0;
        for (_, item) in inner.items.iter_mut() {
            let stale = item.status == Status::Processing
                && item.processing_started_at.map_or(false, |at| at < cutoff);
            if stale {
                write_transition(item, &release, now);
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl TranscriptStore for MemoryStore {
    async fn find_by_media(&self, media_id: &str) -> Result<Option<Transcript>, StoreError> {
        Ok(self.inner.read().await.transcripts.get(media_id).cloned())
    }

    async fn save(&self, transcript: &Transcript) -> Result<Transcript, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .transcripts
            .entry(transcript.media_id.clone())
            .or_insert_with(|| transcript.clone())
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(owner: &str, media: &str, priority: i32) -> JobRequest {
        JobRequest {
            owner_id: OwnerId(owner.into()),
            media_id: media.into(),
            language: None,
            priority,
        }
    }

    #[tokio::test]
    async fn in_flight_duplicates_are_skipped_per_owner() {
        let store = MemoryStore::new();

        assert!(store.insert_pending(&job("alice", "abc", 0)).await.unwrap().is_some());
        assert!(store.insert_pending(&job("alice", "abc", 3)).await.unwrap().is_none());
        assert!(store.insert_pending(&job("bob", "abc", 0)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn terminal_items_do_not_block_enqueue() {
        let store = MemoryStore::new();
        let item = store.insert_pending(&job("alice", "abc", 0)).await.unwrap().unwrap();
        assert!(store.apply(item.id, &Transition::Claim).await.unwrap());
        let fail = Transition::Fail { retry_count: 1, error: "nope".into() };
        assert!(store.apply(item.id, &fail).await.unwrap());

        assert!(store.insert_pending(&job("alice", "abc", 0)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn transition_from_wrong_status_is_not_applied() {
        let store = MemoryStore::new();
        let item = store.insert_pending(&job("alice", "abc", 0)).await.unwrap().unwrap();

        let complete = Transition::Complete { transcript_id: Uuid::new_v4() };
        assert!(!store.apply(item.id, &complete).await.unwrap());
        assert!(!store.apply(item.id, &Transition::Requeue).await.unwrap());
        assert!(store.apply(item.id, &Transition::Claim).await.unwrap());
        assert!(!store.apply(item.id, &Transition::Claim).await.unwrap());
        assert!(store.apply(item.id, &complete).await.unwrap());

        // completed is terminal
        for t in [Transition::Claim, Transition::Requeue, complete] {
            assert!(!store.apply(item.id, &t).await.unwrap());
        }
        let stored = store.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Completed);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn claim_returns_current_row_once() {
        let store = MemoryStore::new();
        let item = store.insert_pending(&job("alice", "abc", 0)).await.unwrap().unwrap();
        store.apply(item.id, &Transition::Claim).await.unwrap();
        let retry = Transition::Retry { retry_count: 1, error: "boom".into() };
        store.apply(item.id, &retry).await.unwrap();

        let claimed = store.claim(item.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, Status::Processing);
        assert_eq!(claimed.retry_count, 1);
        assert!(claimed.processing_started_at.is_some());
        assert_eq!(store.claim(item.id).await.unwrap(), None);
        assert_eq!(store.claim(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn requeue_conflicts_with_newer_in_flight_item() {
        let store = MemoryStore::new();
        let first = store.insert_pending(&job("alice", "abc", 0)).await.unwrap().unwrap();
        store.apply(first.id, &Transition::Claim).await.unwrap();
        store
            .apply(first.id, &Transition::Fail { retry_count: 1, error: "x".into() })
            .await
            .unwrap();
        store.insert_pending(&job("alice", "abc", 0)).await.unwrap().unwrap();

        let err = store.apply(first.id, &Transition::Requeue).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_is_scoped_to_owner() {
        let store = MemoryStore::new();
        let a = store.insert_pending(&job("alice", "a", 0)).await.unwrap().unwrap();
        let b = store.insert_pending(&job("bob", "b", 0)).await.unwrap().unwrap();

        let alice = OwnerId("alice".into());
        let deleted = store.delete(&alice, &DeleteScope::Ids(vec![a.id, b.id])).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(b.id).await.unwrap().is_some());
        assert_eq!(store.delete(&alice, &DeleteScope::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_stale_only_touches_old_processing_items() {
        let store = MemoryStore::new();
        let old = store.insert_pending(&job("alice", "a", 0)).await.unwrap().unwrap();
        let waiting = store.insert_pending(&job("alice", "b", 0)).await.unwrap().unwrap();
        store.apply(old.id, &Transition::Claim).await.unwrap();

        let released = store
            .release_stale(Utc::now() + chrono::Duration::seconds(1), "stale")
            .await
            .unwrap();
        assert_eq!(released, 1);

        let old = store.get(old.id).await.unwrap().unwrap();
        assert_eq!(old.status, Status::Pending);
        assert_eq!(old.processing_started_at, None);
        assert_eq!(old.retry_count, 0);
        assert_eq!(store.get(waiting.id).await.unwrap().unwrap().error_message, None);
    }

    #[tokio::test]
    async fn transcripts_are_stored_once_per_media() {
        let store = MemoryStore::new();
        let body = serde_json::from_str(r#"{"text":"first"}"#).unwrap();
        let first = store.save(&Transcript::from_body("abc", &body)).await.unwrap();
        let body = serde_json::from_str(r#"{"text":"second"}"#).unwrap();
        let second = store.save(&Transcript::from_body("abc", &body)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "first");
    }
}
