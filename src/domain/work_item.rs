//! Work items: one unit of requested generation work.
//!
//! A WorkItem is built once when a run is loaded and only ever moves
//! forward through its status lifecycle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single generation request within a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier, used as the resume key across runs
    pub id: String,

    /// Prompt text sent to the generation client
    pub prompt: String,

    /// Free-form category tag (e.g. "windows", "doors")
    #[serde(default)]
    pub category: String,

    /// Higher priorities are processed first
    #[serde(default)]
    pub priority: i64,

    /// Destination path handed to the artifact store
    pub target_path: String,

    /// Resource key to dispatch against (falls back to the run default)
    #[serde(default)]
    pub resource: Option<String>,

    /// Extra metadata forwarded to the generation client and artifact store
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Current lifecycle status
    #[serde(default)]
    pub status: WorkItemStatus,
}

impl WorkItem {
    /// Create a pending work item
    pub fn new(
        id: impl Into<String>,
        prompt: impl Into<String>,
        category: impl Into<String>,
        target_path: impl Into<String>,
        priority: i64,
    ) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            category: category.into(),
            priority,
            target_path: target_path.into(),
            resource: None,
            metadata: BTreeMap::new(),
            status: WorkItemStatus::Pending,
        }
    }

    /// Set the resource key this item is dispatched against
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Resolve the resource key, using `default` when the item has none
    pub fn resource_key<'a>(&'a self, default: &'a str) -> &'a str {
        self.resource.as_deref().unwrap_or(default)
    }

    /// Move to a new status, rejecting backward or sideways transitions
    pub fn transition(&mut self, to: WorkItemStatus) -> Result<(), StatusTransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(StatusTransitionError {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Lifecycle status of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Loaded, not yet attempted
    Pending,

    /// Attempts are in flight (including backoff waits)
    InProgress,

    /// Artifact generated and stored
    Succeeded,

    /// Fatal error or retries exhausted
    Failed,

    /// Not attempted in this run (resumed, aborted, or cancelled)
    Skipped,
}

impl Default for WorkItemStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl WorkItemStatus {
    /// Whether this status is final for the current run
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Forward-only transition table
    pub fn can_transition_to(self, to: WorkItemStatus) -> bool {
        match (self, to) {
            (Self::Pending, Self::InProgress) => true,
            (Self::Pending, Self::Skipped) => true,
            (Self::InProgress, to) => to.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Rejected status change
#[derive(Debug, Clone, Error)]
#[error("Invalid status transition for '{id}': {from} → {to}")]
pub struct StatusTransitionError {
    pub id: String,
    pub from: WorkItemStatus,
    pub to: WorkItemStatus,
}
