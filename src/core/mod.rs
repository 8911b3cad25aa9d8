//! Core dispatch logic.
//!
//! This module contains:
//! - Quota: sliding-window request caps per resource
//! - Retry: classified retry with capped exponential backoff
//! - Ledger: append-only record of terminal outcomes
//! - Manifest: batch definitions and loading
//! - Orchestrator: sequential batch execution engine

pub mod ledger;
pub mod manifest;
pub mod orchestrator;
pub mod quota;
pub mod retry;

// Re-export commonly used types
pub use ledger::{
    reconcile, rerun_ids, status_counts, succeeded_ids, JsonlLedger, LedgerError, MemoryLedger,
    ResultLedger,
};
pub use manifest::{BatchManifest, ManifestError};
pub use orchestrator::{order_by_priority, BatchOrchestrator};
pub use quota::{QuotaLimit, QuotaTracker, DEFAULT_RESOURCE};
pub use retry::{Execution, ExecutionReport, RetryExecutor, RetryPolicy};
