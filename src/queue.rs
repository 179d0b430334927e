//! Owner-scoped queue operations behind the end-user session.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{DeleteScope, QueueStore, TranscriptStore};
use crate::error::QueueError;
use crate::state::Transition;
use crate::{JobRequest, OwnerId, QueueItem, Status, Transcript};

pub const MAX_ENQUEUE: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnqueueSummary {
    pub added: usize,
    pub skipped: usize,
    pub items: Vec<QueueItem>,
}

/// Queues each media id unless the owner already has it in flight.
pub async fn enqueue(
    store: &dyn QueueStore,
    owner: &OwnerId,
    media_ids: &[String],
    priority: i32,
    language: Option<&str>,
) -> Result<EnqueueSummary, QueueError> {
    if media_ids.is_empty() {
        return Err(QueueError::validation("mediaIds must not be empty"));
    }
    if media_ids.len() > MAX_ENQUEUE {
        return Err(QueueError::validation(format!(
            "at most {MAX_ENQUEUE} media ids per request"
        )));
    }
    if priority < 0 {
        return Err(QueueError::validation("priority must be non-negative"));
    }
    if media_ids.iter().any(|id| id.trim().is_empty()) {
        return Err(QueueError::validation("media ids must not be blank"));
    }
    let language = language.map(str::trim).filter(|l| !l.is_empty());

    let mut summary = EnqueueSummary::default();
    let mut seen = HashSet::new();
    for media_id in media_ids {
        let media_id = media_id.trim();
        if !seen.insert(media_id) {
            summary.skipped += 1;
            continue;
        }

        let request = JobRequest {
            owner_id: owner.clone(),
            media_id: media_id.to_string(),
            language: language.map(str::to_string),
            priority,
        };
        match store.insert_pending(&request).await? {
            Some(item) => {
                summary.added += 1;
                summary.items.push(item);
            }
            None => {
                debug!(media_id, "Already in flight, skipping");
                summary.skipped += 1;
            }
        }
    }

    info!(owner = %owner, added = summary.added, skipped = summary.skipped, "Enqueued");
    Ok(summary)
}

pub async fn list(
    store: &dyn QueueStore,
    owner: &OwnerId,
    status: Option<Status>,
) -> Result<Vec<QueueItem>, QueueError> {
    Ok(store.list(owner, status).await?)
}

pub async fn delete(store: &dyn QueueStore, owner: &OwnerId, scope: DeleteScope) -> Result<u64, QueueError> {
    if matches!(&scope, DeleteScope::Ids(ids) if ids.is_empty()) {
        return Err(QueueError::validation("ids must not be empty"));
    }
    let deleted = store.delete(owner, &scope).await?;
    info!(owner = %owner, deleted, scope = ?scope, "Deleted queue items");
    Ok(deleted)
}

/// Puts one of the owner's failed items back in the queue. The retry count is kept.
pub async fn requeue(store: &dyn QueueStore, owner: &OwnerId, id: Uuid) -> Result<QueueItem, QueueError> {
    let item = store
        .get(id)
        .await?
        .filter(|item| item.owner_id == *owner)
        .ok_or(QueueError::NotFound(id))?;

    if !store.apply(id, &Transition::Requeue).await? {
        return Err(QueueError::InvalidTransition {
            id,
            from: item.status,
            to: Status::Pending,
        });
    }
    store.get(id).await?.ok_or(QueueError::NotFound(id))
}

pub async fn transcript(store: &dyn TranscriptStore, media_id: &str) -> Result<Option<Transcript>, QueueError> {
    Ok(store.find_by_media(media_id.trim()).await?)
}
