use crate::error::StoreError;
use crate::state::Transition;
use crate::{JobRequest, OwnerId, QueueItem, Status, StatusCounts, Transcript};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const ITEM_COLUMNS: &str = "id, owner_id, media_id, language, status, priority, retry_count, \
    error_message, transcript_id, created_at, processing_started_at, completed_at";

const TRANSCRIPT_COLUMNS: &str = "id, media_id, content, segments, language, confidence, \
    duration, word_count, processing_duration, created_at";

/// Which of a user's items a delete applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteScope {
    Ids(Vec<Uuid>),
    Status(Status),
    All,
}

/// Durable table of queue items.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Inserts a pending item unless the owner already has one in flight for
    /// the same media id, in which case `None` is returned.
    async fn insert_pending(&self, job: &JobRequest) -> Result<Option<QueueItem>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError>;

    /// Items of one owner, `priority desc, created_at asc`.
    async fn list(&self, owner: &OwnerId, status: Option<Status>) -> Result<Vec<QueueItem>, StoreError>;

    /// Pending items, `priority desc, created_at asc`, optionally scoped to one owner.
    async fn list_pending(&self, owner: Option<&OwnerId>, limit: i64) -> Result<Vec<QueueItem>, StoreError>;

    /// Moves a pending item to `processing` and returns the row as claimed, or
    /// `None` when the item was not pending. Later decisions for this attempt
    /// must use the returned row, not an earlier read.
    async fn claim(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError>;

    /// Applies `transition` only if the item is currently in its source status.
    /// Returns whether a row was changed.
    async fn apply(&self, id: Uuid, transition: &Transition) -> Result<bool, StoreError>;

    async fn delete(&self, owner: &OwnerId, scope: &DeleteScope) -> Result<u64, StoreError>;

    async fn counts(&self) -> Result<StatusCounts, StoreError>;

    /// Moves items that entered `processing` before `cutoff` back to `pending`.
    async fn release_stale(&self, cutoff: DateTime<Utc>, error: &str) -> Result<u64, StoreError>;
}

/// Finished transcriptions, one per media id.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn find_by_media(&self, media_id: &str) -> Result<Option<Transcript>, StoreError>;

    /// Stores `transcript` unless one already exists for its media id; either
    /// way the stored transcript is returned.
    async fn save(&self, transcript: &Transcript) -> Result<Transcript, StoreError>;
}

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }
}

fn map_unique_violation(err: sqlx::Error, what: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(what.to_string()),
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl QueueStore for DbHandle {
    async fn insert_pending(&self, job: &JobRequest) -> Result<Option<QueueItem>, StoreError> {
        debug!("Submitting job {:?}", job);
        let sql = format!(
            "INSERT INTO queue_items \
                (id, owner_id, media_id, language, priority, status) \
            VALUES ($1, $2, $3, $4, $5, 'pending') \
            ON CONFLICT (owner_id, media_id) WHERE status IN ('pending', 'processing') DO NOTHING \
            RETURNING {ITEM_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, QueueItem>(&sql)
            .bind(Uuid::new_v4())
            .bind(&job.owner_id)
            .bind(&job.media_id)
            .bind(&job.language)
            .bind(job.priority)
            .fetch_optional(&*self.pool)
            .await?)
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = $1");
        Ok(sqlx::query_as::<_, QueueItem>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?)
    }

    async fn list(&self, owner: &OwnerId, status: Option<Status>) -> Result<Vec<QueueItem>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items \
            WHERE owner_id = $1 AND ($2::queue_status IS NULL OR status = $2) \
            ORDER BY priority DESC, created_at ASC, id ASC"
        );
        Ok(sqlx::query_as::<_, QueueItem>(&sql)
            .bind(owner)
            .bind(status)
            .fetch_all(&*self.pool)
            .await?)
    }

    async fn list_pending(&self, owner: Option<&OwnerId>, limit: i64) -> Result<Vec<QueueItem>, StoreError> {
        debug!("Getting {} queued jobs", limit);
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items \
            WHERE status = 'pending' AND ($1::text IS NULL OR owner_id = $1) \
            ORDER BY priority DESC, created_at ASC, id ASC \
            LIMIT $2"
        );
        Ok(sqlx::query_as::<_, QueueItem>(&sql)
            .bind(owner)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?)
    }

    async fn claim(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError> {
        let sql = format!(
            "UPDATE queue_items \
                SET status = 'processing', \
                processing_started_at = now() \
            WHERE id = $1 AND status = 'pending' \
            RETURNING {ITEM_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, QueueItem>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?)
    }

    async fn apply(&self, id: Uuid, transition: &Transition) -> Result<bool, StoreError> {
        let query = match transition {
            Transition::Claim => sqlx::query(
                "UPDATE queue_items \
                    SET status = 'processing', \
                    processing_started_at = now() \
                WHERE id = $1 AND status = 'pending'",
            )
            .bind(id),
            Transition::Complete { transcript_id } => sqlx::query(
                "UPDATE queue_items \
                    SET status = 'completed', \
                    completed_at = now(), \
                    error_message = NULL, \
                    transcript_id = $2 \
                WHERE id = $1 AND status = 'processing'",
            )
            .bind(id)
            .bind(transcript_id),
            Transition::Retry { retry_count, error } => sqlx::query(
                "UPDATE queue_items \
                    SET status = 'pending', \
                    retry_count = $2, \
                    error_message = $3, \
                    processing_started_at = NULL \
                WHERE id = $1 AND status = 'processing'",
            )
            .bind(id)
            .bind(retry_count)
            .bind(error),
            Transition::Fail { retry_count, error } => sqlx::query(
                "UPDATE queue_items \
                    SET status = 'failed', \
                    retry_count = $2, \
                    error_message = $3, \
                    completed_at = now() \
                WHERE id = $1 AND status = 'processing'",
            )
            .bind(id)
            .bind(retry_count)
            .bind(error),
            Transition::Requeue => sqlx::query(
                "UPDATE queue_items \
                    SET status = 'pending', \
                    processing_started_at = NULL, \
                    completed_at = NULL \
                WHERE id = $1 AND status = 'failed'",
            )
            .bind(id),
            Transition::Release { error } => sqlx::query(
                "UPDATE queue_items \
                    SET status = 'pending', \
                    error_message = $2, \
                    processing_started_at = NULL \
                WHERE id = $1 AND status = 'processing'",
            )
            .bind(id)
            .bind(error),
        };

        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|err| map_unique_violation(err, "media already queued for this owner"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, owner: &OwnerId, scope: &DeleteScope) -> Result<u64, StoreError> {
        let query = match scope {
            DeleteScope::Ids(ids) => {
                sqlx::query("DELETE FROM queue_items WHERE owner_id = $1 AND id = ANY($2)")
                    .bind(owner)
                    .bind(ids)
            }
            DeleteScope::Status(status) => {
                sqlx::query("DELETE FROM queue_items WHERE owner_id = $1 AND status = $2")
                    .bind(owner)
                    .bind(status)
            }
            DeleteScope::All => sqlx::query("DELETE FROM queue_items WHERE owner_id = $1").bind(owner),
        };

        Ok(query.execute(&*self.pool).await?.rows_affected())
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(Status, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM queue_items GROUP BY status")
                .fetch_all(&*self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.add(status, count);
        }
        Ok(counts)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>, error: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE queue_items \
                SET status = 'pending', \
                error_message = $2, \
                processing_started_at = NULL \
            WHERE status = 'processing' AND processing_started_at < $1",
        )
        .bind(cutoff)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TranscriptStore for DbHandle {
    async fn find_by_media(&self, media_id: &str) -> Result<Option<Transcript>, StoreError> {
        let sql = format!("SELECT {TRANSCRIPT_COLUMNS} FROM transcripts WHERE media_id = $1");
        Ok(sqlx::query_as::<_, Transcript>(&sql)
            .bind(media_id)
            .fetch_optional(&*self.pool)
            .await?)
    }

    async fn save(&self, transcript: &Transcript) -> Result<Transcript, StoreError> {
        let sql = format!(
            "INSERT INTO transcripts ({TRANSCRIPT_COLUMNS}) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
            ON CONFLICT (media_id) DO NOTHING \
            RETURNING {TRANSCRIPT_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, Transcript>(&sql)
            .bind(transcript.id)
            .bind(&transcript.media_id)
            .bind(&transcript.content)
            .bind(&transcript.segments)
            .bind(&transcript.language)
            .bind(transcript.confidence)
            .bind(transcript.duration)
            .bind(transcript.word_count)
            .bind(transcript.processing_duration)
            .bind(transcript.created_at)
            .fetch_optional(&*self.pool)
            .await?;

        match inserted {
            Some(stored) => Ok(stored),
            None => {
                debug!(media_id = %transcript.media_id, "Transcript already stored, keeping existing");
                self.find_by_media(&transcript.media_id)
                    .await?
                    .ok_or_else(|| StoreError::Conflict(format!("transcript for {} vanished", transcript.media_id)))
            }
        }
    }
}
