use reqwest::StatusCode;
use std::fmt;

use crate::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

/// Why a single processing attempt did not produce a transcript.
#[derive(Debug)]
pub enum JobFailure {
    /// The item itself is unusable (e.g. a blank media id); never retried.
    Validation(String),
    Worker(WorkerError),
}

impl JobFailure {
    pub fn class(&self) -> ErrorClass {
        match self {
            JobFailure::Validation(_) => ErrorClass::Permanent,
            JobFailure::Worker(err) => classify(err),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Validation(msg) => write!(f, "invalid queue item: {msg}"),
            JobFailure::Worker(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl From<WorkerError> for JobFailure {
    fn from(err: WorkerError) -> Self {
        JobFailure::Worker(err)
    }
}

pub fn classify(err: &WorkerError) -> ErrorClass {
    match err {
        WorkerError::Transport(_) | WorkerError::Timeout(_) | WorkerError::Cancelled => ErrorClass::Retryable,
        WorkerError::Http { status, .. } => classify_status(*status),
        WorkerError::Decode(_) => ErrorClass::Permanent,
    }
}

pub fn classify_status(status: StatusCode) -> ErrorClass {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ErrorClass::Retryable
    } else {
        ErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: RetryAction,
    pub next_retry_count: i32,
}

/// Caps the number of attempts made for one queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: i32::try_from(max_attempts.max(1)).unwrap_or(i32::MAX),
        }
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// Every failure counts as an attempt; only retryable failures below the
    /// ceiling go back to the queue.
    pub fn decide(&self, class: ErrorClass, current_retry_count: i32) -> Decision {
        let next_retry_count = current_retry_count.max(0).saturating_add(1);
        let action = if class == ErrorClass::Retryable && next_retry_count < self.max_attempts {
            RetryAction::Retry
        } else {
            RetryAction::Fail
        };
        Decision { action, next_retry_count }
    }
}
