//! Attempts made by the retry executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error_kind::ErrorKind;

/// A single call to the generation client for one work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// Work item this attempt belongs to
    pub work_item_id: String,

    /// 1-indexed attempt number
    pub attempt_number: u32,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// How the attempt ended
    pub outcome: AttemptOutcome,
}

/// Result of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "kind")]
pub enum AttemptOutcome {
    Success,
    RetryableError(ErrorKind),
    FatalError(ErrorKind),
}

impl AttemptOutcome {
    /// Build the outcome for a failed attempt from its error kind
    pub fn from_error(kind: ErrorKind) -> Self {
        if kind.is_retryable() {
            Self::RetryableError(kind)
        } else {
            Self::FatalError(kind)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
