//! genbatch - Quota-aware batch generation dispatcher
//!
//! Runs a batch of generation requests against rate-limited backends
//! without exceeding per-resource quotas, retrying transient failures
//! with capped backoff, and recording every terminal outcome so an
//! interrupted batch can be resumed.
//!
//! # Architecture
//!
//! - Each attempt acquires a slot from a sliding-window quota tracker
//! - Failures are classified by adapters and retried only when retryable
//! - Outcomes are appended to a JSONL ledger; the latest record per item wins
//! - A resumed run skips items whose latest record is Succeeded
//!
//! # Modules
//!
//! - `adapters`: Generation client and artifact store interfaces
//! - `core`: Quota, retry, ledger and the batch orchestrator
//! - `domain`: Work items, attempts and result records
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a batch
//! genbatch run batches/windows.yaml
//!
//! # See what a re-run would process
//! genbatch pending batches/windows.yaml
//!
//! # Summarize the ledger
//! genbatch status
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{ArtifactStore, GenerateOptions, GeneratedArtifact, GenerationClient, GenerationError};
pub use crate::core::{BatchManifest, BatchOrchestrator, JsonlLedger, QuotaTracker, ResultLedger, RetryExecutor};
pub use domain::{ErrorKind, HaltReason, ResultRecord, Summary, WorkItem, WorkItemStatus};
