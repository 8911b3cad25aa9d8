//! Domain types for the genbatch pipeline.
//!
//! This module contains the core data structures:
//! - WorkItem: One unit of requested generation work
//! - Attempt: A single call made by the retry executor
//! - ErrorKind: Closed failure classification
//! - ResultRecord / Summary: Ledger entries and run outcome

pub mod attempt;
pub mod error_kind;
pub mod record;
pub mod work_item;

// Re-export commonly used types
pub use attempt::{Attempt, AttemptOutcome};
pub use error_kind::ErrorKind;
pub use record::{HaltReason, ResultRecord, Summary};
pub use work_item::{StatusTransitionError, WorkItem, WorkItemStatus};
