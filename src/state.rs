//! Queue item lifecycle.
//!
//! ```text
//! pending ──claim──▶ processing ──▶ completed
//!    ▲                  │  │
//!    └──────retry───────┘  └──────▶ failed
//!    └──────────────requeue──────────┘
//! ```
//!
//! Every transition is applied by the store as a conditional write guarded on
//! the source status, so a write against an item that has moved on affects
//! nothing and is reported as not applied.

use uuid::Uuid;

use crate::Status;

impl Status {
    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Failed, Pending)
        )
    }
}

/// A single permitted status change together with the fields it writes.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `pending → processing`; stamps `processing_started_at`.
    Claim,
    /// `processing → completed`; stamps `completed_at`, clears the error.
    Complete { transcript_id: Uuid },
    /// `processing → pending`; clears `processing_started_at` so the item is claimable again.
    Retry { retry_count: i32, error: String },
    /// `processing → failed`; terminal, stamps `completed_at`.
    Fail { retry_count: i32, error: String },
    /// `failed → pending`, user initiated.
    Requeue,
    /// `processing → pending` for items abandoned by a crashed processor.
    Release { error: String },
}

impl Transition {
    pub fn source(&self) -> Status {
        match self {
            Transition::Claim => Status::Pending,
            Transition::Requeue => Status::Failed,
            Transition::Complete { .. }
            | Transition::Retry { .. }
            | Transition::Fail { .. }
            | Transition::Release { .. } => Status::Processing,
        }
    }

    pub fn target(&self) -> Status {
        match self {
            Transition::Claim => Status::Processing,
            Transition::Complete { .. } => Status::Completed,
            Transition::Fail { .. } => Status::Failed,
            Transition::Retry { .. } | Transition::Requeue | Transition::Release { .. } => {
                Status::Pending
            }
        }
    }
}
