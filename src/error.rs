use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::Status;

/// Persistence failures. Never classified for retry: fatal to the current operation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Failures talking to the external transcription worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker unreachable: {0}")]
    Transport(String),
    #[error("worker request timed out after {0}s")]
    Timeout(u64),
    #[error("worker request cancelled")]
    Cancelled,
    #[error("worker returned {status}: {message}")]
    Http { status: StatusCode, message: String },
    #[error("malformed worker response: {0}")]
    Decode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid credential")]
    InvalidCredential,
    #[error("invalid session: {0}")]
    InvalidSession(String),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("queue item {0} not found")]
    NotFound(Uuid),
    #[error("no transcript for media {0}")]
    NoTranscript(String),
    #[error("queue item {id} cannot move from {from} to {to}")]
    InvalidTransition { id: Uuid, from: Status, to: Status },
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        QueueError::Validation(msg.into())
    }
}
