//! Ledger records and run summaries.
//!
//! A ResultRecord is finalized the moment a work item reaches a terminal
//! status and is never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::attempt::Attempt;
use super::error_kind::ErrorKind;
use super::work_item::WorkItemStatus;

/// Terminal outcome of one work item in one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Run that appended this record
    pub run_id: Uuid,

    pub work_item_id: String,

    /// Succeeded, Failed or Skipped
    pub final_status: WorkItemStatus,

    /// Reference returned by the artifact store (on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_reference: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,

    /// Human-readable error detail (NO secrets)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Number of generation calls made
    pub total_attempts: u32,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Wall time from start to finish in milliseconds
    #[serde(default)]
    pub duration_ms: u64,

    /// Per-attempt audit trail
    #[serde(default)]
    pub attempts: Vec<Attempt>,
}

impl ResultRecord {
    /// Record a stored artifact
    pub fn succeeded(
        run_id: Uuid,
        work_item_id: impl Into<String>,
        artifact_reference: String,
        attempts: Vec<Attempt>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::finish(run_id, work_item_id.into(), WorkItemStatus::Succeeded, attempts, started_at)
            .with_artifact(artifact_reference)
    }

    /// Record a fatal or retry-exhausted failure
    pub fn failed(
        run_id: Uuid,
        work_item_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        attempts: Vec<Attempt>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::finish(run_id, work_item_id.into(), WorkItemStatus::Failed, attempts, started_at)
            .with_error(kind, message.into())
    }

    /// Record an item that was never attempted in this run
    pub fn skipped(run_id: Uuid, work_item_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut record = Self::finish(
            run_id,
            work_item_id.into(),
            WorkItemStatus::Skipped,
            Vec::new(),
            Utc::now(),
        );
        record.error_message = Some(reason.into());
        record
    }

    fn finish(
        run_id: Uuid,
        work_item_id: String,
        final_status: WorkItemStatus,
        attempts: Vec<Attempt>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            run_id,
            work_item_id,
            final_status,
            artifact_reference: None,
            error_kind: None,
            error_message: None,
            total_attempts: attempts.len() as u32,
            started_at,
            finished_at,
            duration_ms,
            attempts,
        }
    }

    fn with_artifact(mut self, reference: String) -> Self {
        self.artifact_reference = Some(reference);
        self
    }

    fn with_error(mut self, kind: ErrorKind, message: String) -> Self {
        self.error_kind = Some(kind);
        self.error_message = Some(message);
        self
    }

    pub fn is_succeeded(&self) -> bool {
        self.final_status == WorkItemStatus::Succeeded
    }
}

/// Why a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// Every item reached a terminal status
    Completed,

    /// A FatalAuth failure aborted the remainder
    AuthFailure,

    /// Cancellation was requested
    Cancelled,
}

/// Outcome counts for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub run_id: Uuid,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,

    /// Subset of `skipped` already succeeded in a prior run
    pub resumed: usize,

    pub halt: HaltReason,

    /// Records appended by this run, in append order
    pub records: Vec<ResultRecord>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Summary {
    /// Total number of items the run accounted for
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    /// Whether a re-run has anything left to do
    pub fn has_remaining_work(&self) -> bool {
        self.failed > 0 || self.skipped > self.resumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_record_carries_error() {
        let record = ResultRecord::failed(
            Uuid::new_v4(),
            "item-3",
            ErrorKind::FatalInput,
            "prompt rejected by safety filter",
            Vec::new(),
            Utc::now(),
        );

        assert_eq!(record.final_status, WorkItemStatus::Failed);
        assert_eq!(record.error_kind, Some(ErrorKind::FatalInput));
        assert!(record.artifact_reference.is_none());
    }

    #[test]
    fn test_record_serialization_omits_empty_fields() {
        let record = ResultRecord::succeeded(
            Uuid::new_v4(),
            "item-1",
            "file:///tmp/a.png".to_string(),
            Vec::new(),
            Utc::now(),
        );

        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("error_kind"));

        let parsed: ResultRecord = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_succeeded());
        assert_eq!(parsed.artifact_reference.as_deref(), Some("file:///tmp/a.png"));
    }
}
