//! Batch orchestrator.
//!
//! Drives each work item through quota acquisition, classified retry,
//! artifact storage, and ledger recording. Items are processed strictly
//! one at a time in descending priority order; a failed item never stops
//! the batch unless it failed on credentials.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{ArtifactMetadata, ArtifactStore, GenerateOptions, GenerationClient};
use crate::config::{ConfigError, DispatchSettings};
use crate::domain::{
    AttemptOutcome, ErrorKind, HaltReason, ResultRecord, Summary, WorkItem, WorkItemStatus,
};

use super::ledger::{succeeded_ids, ResultLedger};
use super::quota::QuotaTracker;
use super::retry::{Execution, ExecutionReport, RetryExecutor};

/// Sequential, quota-aware dispatcher for one batch
pub struct BatchOrchestrator {
    generator: Arc<dyn GenerationClient>,
    store: Arc<dyn ArtifactStore>,
    quota: QuotaTracker,
    retry: RetryExecutor,
    settings: DispatchSettings,
    cancel: CancellationToken,
}

impl BatchOrchestrator {
    /// Create an orchestrator; settings are validated up front
    pub fn new(
        generator: Arc<dyn GenerationClient>,
        store: Arc<dyn ArtifactStore>,
        settings: DispatchSettings,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;

        Ok(Self {
            generator,
            store,
            quota: QuotaTracker::new(settings.resource_limits.clone()),
            retry: RetryExecutor::new(settings.retry_policy()),
            settings,
            cancel: CancellationToken::new(),
        })
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run before its next item
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Run a batch, appending one record per processed item to `ledger`.
    ///
    /// Items whose authoritative record in `prior` is Succeeded are skipped
    /// without calling the generation client and without a new record.
    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        ledger: &dyn ResultLedger,
        prior: Option<&[ResultRecord]>,
    ) -> Result<Summary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        check_items(&items)?;
        let mut items = order_by_priority(items);
        let already_done = prior.map(succeeded_ids).unwrap_or_default();

        info!(
            %run_id,
            total = items.len(),
            resumable = already_done.len(),
            generator = self.generator.name(),
            store = self.store.name(),
            "Starting batch run"
        );

        let mut run = RunState::new(run_id);
        let total = items.len();
        let mut next = 0usize;

        while next < total {
            if self.cancel.is_cancelled() {
                warn!(%run_id, remaining = total - next, "Cancellation requested, stopping run");
                run.halt = HaltReason::Cancelled;
                break;
            }

            let item = &mut items[next];
            next += 1;

            if already_done.contains(&item.id) {
                item.transition(WorkItemStatus::Skipped)?;
                run.skipped += 1;
                run.resumed += 1;
                info!(item = %item.id, "Item already succeeded in a prior run, skipping");
                continue;
            }

            let record = self.process_item(run_id, item).await?;
            ledger
                .append(&record)
                .await
                .with_context(|| format!("Failed to append ledger record for '{}'", record.work_item_id))?;

            let auth_failure = record
                .attempts
                .iter()
                .any(|a| matches!(a.outcome, AttemptOutcome::FatalError(kind) if kind.aborts_run()));
            run.count(record);

            if auth_failure {
                warn!(
                    %run_id,
                    remaining = total - next,
                    "Credential failure, aborting remaining items"
                );
                run.halt = HaltReason::AuthFailure;
                break;
            }

            if next < total {
                self.pace(&mut run).await;
            }
        }

        if run.halt != HaltReason::Completed {
            let reason = match run.halt {
                HaltReason::AuthFailure => "run aborted after credential failure",
                _ => "run cancelled",
            };

            for item in items.iter_mut().skip(next) {
                item.transition(WorkItemStatus::Skipped)?;
                run.skipped += 1;

                // Keep the prior success authoritative
                if already_done.contains(&item.id) {
                    run.resumed += 1;
                    continue;
                }

                let record = ResultRecord::skipped(run_id, item.id.clone(), reason);
                ledger
                    .append(&record)
                    .await
                    .with_context(|| format!("Failed to append ledger record for '{}'", item.id))?;
                run.records.push(record);
            }
        }

        let summary = run.finish(started_at);
        info!(
            %run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            halt = ?summary.halt,
            "Batch run finished"
        );

        Ok(summary)
    }

    /// Execute, store and record one item
    async fn process_item(&self, run_id: Uuid, item: &mut WorkItem) -> Result<ResultRecord> {
        item.transition(WorkItemStatus::InProgress)?;
        let started_at = Utc::now();

        let resource = item.resource_key(&self.settings.default_resource).to_string();
        let options = GenerateOptions::for_item(item, &resource);

        info!(item = %item.id, %resource, priority = item.priority, "Processing item");

        let report = {
            let quota = &self.quota;
            let generator = self.generator.as_ref();
            let prompt = item.prompt.as_str();
            let resource = resource.as_str();
            let options = &options;

            // Every attempt is a request against the resource's quota
            self.retry
                .execute_gated(
                    &item.id,
                    move || quota.acquire(resource),
                    move |_attempt| generator.generate(prompt, options),
                )
                .await
        };

        let ExecutionReport {
            outcome, attempts, ..
        } = report;
        let total_attempts = attempts.len();

        match outcome {
            Execution::Success(artifact) => {
                let metadata = ArtifactMetadata::describe(item, &artifact);
                match self
                    .store
                    .store(&artifact.payload, &item.target_path, &metadata)
                    .await
                {
                    Ok(reference) => {
                        item.transition(WorkItemStatus::Succeeded)?;
                        info!(item = %item.id, %reference, attempts = total_attempts, "Item succeeded");
                        Ok(ResultRecord::succeeded(run_id, item.id.clone(), reference, attempts, started_at))
                    }
                    Err(e) => {
                        item.transition(WorkItemStatus::Failed)?;
                        warn!(item = %item.id, error = %e, "Artifact store failed");
                        Ok(ResultRecord::failed(
                            run_id,
                            item.id.clone(),
                            ErrorKind::FatalUnknown,
                            format!("artifact store: {:#}", e),
                            attempts,
                            started_at,
                        ))
                    }
                }
            }
            Execution::Failed(err) => {
                item.transition(WorkItemStatus::Failed)?;
                let message = if err.kind.is_retryable() {
                    format!("retries exhausted after {} attempts: {}", total_attempts, err.message)
                } else {
                    err.message
                };
                warn!(item = %item.id, kind = %err.kind, attempts = total_attempts, "Item failed");
                Ok(ResultRecord::failed(run_id, item.id.clone(), err.kind, message, attempts, started_at))
            }
        }
    }

    /// Inter-item delay plus the failure cool-down, if due
    async fn pace(&self, run: &mut RunState) {
        if let Some(cooldown) = self.settings.failure_cooldown {
            if run.consecutive_failures >= cooldown.after {
                warn!(
                    consecutive_failures = run.consecutive_failures,
                    delay_ms = cooldown.delay_ms,
                    "Multiple consecutive failures, cooling down"
                );
                self.pause(cooldown.delay()).await;
                run.consecutive_failures = 0;
            }
        }

        self.pause(self.settings.inter_item_delay()).await;
    }

    /// Sleep that ends early on cancellation
    async fn pause(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

/// Stable sort by descending priority; ties keep input order
pub fn order_by_priority(mut items: Vec<WorkItem>) -> Vec<WorkItem> {
    items.sort_by_key(|item| Reverse(item.priority));
    items
}

fn check_items(items: &[WorkItem]) -> Result<()> {
    let mut seen = HashSet::new();
    for item in items {
        if !seen.insert(item.id.as_str()) {
            anyhow::bail!("Duplicate work item id: {}", item.id);
        }
        if item.status != WorkItemStatus::Pending {
            anyhow::bail!("Work item '{}' is not pending (status: {})", item.id, item.status);
        }
    }
    Ok(())
}

/// Mutable counters for one run
struct RunState {
    run_id: Uuid,
    succeeded: usize,
    failed: usize,
    skipped: usize,
    resumed: usize,
    consecutive_failures: u32,
    halt: HaltReason,
    records: Vec<ResultRecord>,
}

impl RunState {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            resumed: 0,
            consecutive_failures: 0,
            halt: HaltReason::Completed,
            records: Vec::new(),
        }
    }

    fn count(&mut self, record: ResultRecord) {
        match record.final_status {
            WorkItemStatus::Succeeded => {
                self.succeeded += 1;
                self.consecutive_failures = 0;
            }
            WorkItemStatus::Failed => {
                self.failed += 1;
                self.consecutive_failures += 1;
            }
            _ => self.skipped += 1,
        }
        self.records.push(record);
    }

    fn finish(self, started_at: chrono::DateTime<Utc>) -> Summary {
        Summary {
            run_id: self.run_id,
            succeeded: self.succeeded,
            failed: self.failed,
            skipped: self.skipped,
            resumed: self.resumed,
            halt: self.halt,
            records: self.records,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::adapters::{GeneratedArtifact, GenerationError};
    use crate::config::FailureCooldown;
    use crate::core::ledger::MemoryLedger;

    struct EchoGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GenerationClient for EchoGenerator {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(
            &self,
            prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<GeneratedArtifact, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if prompt.contains("reject") {
                return Err(GenerationError::input("policy rejected"));
            }
            Ok(GeneratedArtifact::new(prompt.as_bytes().to_vec(), "text/plain"))
        }
    }

    struct FailingStore;

    #[async_trait]
    impl ArtifactStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }

        async fn store(&self, _: &[u8], _: &str, _: &ArtifactMetadata) -> Result<String> {
            anyhow::bail!("bucket not found")
        }
    }

    struct MemoryStore;

    #[async_trait]
    impl ArtifactStore for MemoryStore {
        fn name(&self) -> &str {
            "memory"
        }

        async fn store(&self, _: &[u8], target_path: &str, _: &ArtifactMetadata) -> Result<String> {
            Ok(format!("mem://{}", target_path))
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            inter_item_delay_ms: 0,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            ..Default::default()
        }
    }

    fn orchestrator(store: Arc<dyn ArtifactStore>, settings: DispatchSettings) -> BatchOrchestrator {
        let generator = Arc::new(EchoGenerator {
            calls: AtomicUsize::new(0),
        });
        BatchOrchestrator::new(generator, store, settings).unwrap()
    }

    #[test]
    fn test_priority_order_is_stable() {
        let items = vec![
            WorkItem::new("low", "p", "", "low.png", 1),
            WorkItem::new("high-a", "p", "", "a.png", 5),
            WorkItem::new("mid", "p", "", "mid.png", 3),
            WorkItem::new("high-b", "p", "", "b.png", 5),
        ];

        let ids: Vec<String> = order_by_priority(items).into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["high-a", "high-b", "mid", "low"]);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let generator = Arc::new(EchoGenerator {
            calls: AtomicUsize::new(0),
        });
        let settings = DispatchSettings {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(BatchOrchestrator::new(generator, Arc::new(MemoryStore), settings).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_fails_item_only() {
        let orchestrator = orchestrator(Arc::new(FailingStore), settings());
        let ledger = MemoryLedger::new();
        let items = vec![
            WorkItem::new("a", "a window", "", "a.png", 0),
            WorkItem::new("b", "a door", "", "b.png", 0),
        ];

        let summary = orchestrator.run(items, &ledger, None).await.unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.halt, HaltReason::Completed);
        let record = &summary.records[0];
        assert_eq!(record.error_kind, Some(ErrorKind::FatalUnknown));
        assert!(record.error_message.as_deref().unwrap().starts_with("artifact store:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_records_skips() {
        let orchestrator = orchestrator(Arc::new(MemoryStore), settings());
        orchestrator.cancellation_token().cancel();
        let ledger = MemoryLedger::new();
        let items = vec![
            WorkItem::new("a", "p", "", "a.png", 0),
            WorkItem::new("b", "p", "", "b.png", 0),
        ];

        let summary = orchestrator.run(items, &ledger, None).await.unwrap();

        assert_eq!(summary.halt, HaltReason::Cancelled);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.resumed, 0);
        let records = ledger.load_all().await.unwrap();
        assert!(records.iter().all(|r| r.final_status == WorkItemStatus::Skipped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_inter_item_delay() {
        let mut settings = settings();
        settings.inter_item_delay_ms = 60_000;
        let orchestrator = orchestrator(Arc::new(MemoryStore), settings);
        let ledger = MemoryLedger::new();
        let items = vec![
            WorkItem::new("a", "p", "", "a.png", 0),
            WorkItem::new("b", "p", "", "b.png", 0),
            WorkItem::new("c", "p", "", "c.png", 0),
        ];

        let token = orchestrator.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            token.cancel();
        });

        let start = tokio::time::Instant::now();
        let summary = orchestrator.run(items, &ledger, None).await.unwrap();

        assert_eq!(summary.halt, HaltReason::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 2);

        let statuses: Vec<(String, WorkItemStatus)> = ledger
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.work_item_id, r.final_status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("a".to_string(), WorkItemStatus::Succeeded),
                ("b".to_string(), WorkItemStatus::Skipped),
                ("c".to_string(), WorkItemStatus::Skipped),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_failure_cooldown() {
        let mut settings = settings();
        settings.failure_cooldown = Some(FailureCooldown {
            after: 1,
            delay_ms: 600_000,
        });
        let orchestrator = orchestrator(Arc::new(MemoryStore), settings);
        let ledger = MemoryLedger::new();
        let items = vec![
            WorkItem::new("a", "reject a", "", "a.png", 0),
            WorkItem::new("b", "fine", "", "b.png", 0),
        ];

        let token = orchestrator.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            token.cancel();
        });

        let start = tokio::time::Instant::now();
        let summary = orchestrator.run(items, &ledger, None).await.unwrap();

        assert_eq!(summary.halt, HaltReason::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.records[1].final_status, WorkItemStatus::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cooldown_pauses_after_streak() {
        let mut settings = settings();
        settings.failure_cooldown = Some(FailureCooldown {
            after: 2,
            delay_ms: 10_000,
        });
        let orchestrator = orchestrator(Arc::new(MemoryStore), settings);
        let ledger = MemoryLedger::new();
        let items = vec![
            WorkItem::new("a", "reject a", "", "a.png", 0),
            WorkItem::new("b", "reject b", "", "b.png", 0),
            WorkItem::new("c", "fine", "", "c.png", 0),
        ];

        let start = tokio::time::Instant::now();
        let summary = orchestrator.run(items, &ledger, None).await.unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.succeeded, 1);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ids_rejected() {
        let orchestrator = orchestrator(Arc::new(MemoryStore), settings());
        let ledger = MemoryLedger::new();
        let items = vec![
            WorkItem::new("a", "p", "", "a.png", 0),
            WorkItem::new("a", "p", "", "a2.png", 0),
        ];

        assert!(orchestrator.run(items, &ledger, None).await.is_err());
        assert!(ledger.load_all().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prior_success_survives_auth_abort() {
        struct AuthFails;

        #[async_trait]
        impl GenerationClient for AuthFails {
            fn name(&self) -> &str {
                "auth-fails"
            }

            async fn generate(
                &self,
                _: &str,
                _: &GenerateOptions,
            ) -> Result<GeneratedArtifact, GenerationError> {
                Err(GenerationError::auth("invalid service account key"))
            }
        }

        let orchestrator =
            BatchOrchestrator::new(Arc::new(AuthFails), Arc::new(MemoryStore), settings()).unwrap();

        let prior_run = Uuid::new_v4();
        let prior = vec![ResultRecord::succeeded(
            prior_run,
            "done",
            "mem://done.png".to_string(),
            Vec::new(),
            Utc::now(),
        )];
        let ledger = MemoryLedger::with_records(prior.clone());
        let items = vec![
            WorkItem::new("first", "p", "", "first.png", 10),
            WorkItem::new("done", "p", "", "done.png", 0),
            WorkItem::new("other", "p", "", "other.png", 0),
        ];

        let summary = orchestrator.run(items, &ledger, Some(prior.as_slice())).await.unwrap();

        assert_eq!(summary.halt, HaltReason::AuthFailure);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.resumed, 1);

        let records = ledger.load_all().await.unwrap();
        // prior + first (failed) + other (skipped); "done" stays Succeeded
        assert_eq!(records.len(), 3);
        assert!(succeeded_ids(&records).contains("done"));
    }
}
