//! Classified retry with capped exponential backoff.
//!
//! The executor never inspects error messages: the error kind assigned by
//! the adapter decides whether another attempt is made.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::adapters::GenerationError;
use crate::domain::{Attempt, AttemptOutcome};

/// Retry policy for one work item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Growth factor applied per retry
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

pub(crate) fn default_max_retries() -> u32 {
    5
}
pub(crate) fn default_initial_delay() -> u64 {
    1000
}
pub(crate) fn default_max_delay() -> u64 {
    60000
}
pub(crate) fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `n` (0-indexed): `min(max, initial * multiplier^n)`
    pub fn delay_for_retry(&self, n: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(n as i32);
        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Maximum number of attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Final result of an executed operation
#[derive(Debug)]
pub enum Execution<T> {
    Success(T),
    Failed(GenerationError),
}

/// Outcome plus the audit trail of attempts and waits
#[derive(Debug)]
pub struct ExecutionReport<T> {
    pub outcome: Execution<T>,
    pub attempts: Vec<Attempt>,

    /// Backoff delays slept between attempts, in order
    pub delays: Vec<Duration>,
}

impl<T> ExecutionReport<T> {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Execution::Success(_))
    }
}

/// Runs an operation under a retry policy
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Backoff before retry `n`, honoring a retry-after hint.
    ///
    /// Never below the previous delay and never above `max_delay`.
    fn next_delay(&self, n: u32, hint: Option<Duration>, previous: Duration) -> Duration {
        let backoff = self.policy.delay_for_retry(n);
        let wanted = backoff.max(hint.unwrap_or_default()).max(previous);
        wanted.min(self.policy.max_delay())
    }

    /// Run `op` until it succeeds, fails fatally, or retries are exhausted.
    ///
    /// `op` receives the 1-indexed attempt number.
    pub async fn execute<T, F, Fut>(&self, work_item_id: &str, op: F) -> ExecutionReport<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        self.execute_gated(work_item_id, || std::future::ready(()), op).await
    }

    /// Like [`execute`](Self::execute), awaiting `gate` before every attempt.
    ///
    /// Time spent in the gate (e.g. a quota wait) is not part of the
    /// attempt's recorded start and finish.
    pub async fn execute_gated<T, G, GFut, F, Fut>(
        &self,
        work_item_id: &str,
        mut gate: G,
        mut op: F,
    ) -> ExecutionReport<T>
    where
        G: FnMut() -> GFut,
        GFut: Future,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let mut attempts = Vec::new();
        let mut delays: Vec<Duration> = Vec::new();
        let mut attempt_number = 0u32;

        loop {
            attempt_number += 1;
            gate().await;
            let started_at = Utc::now();
            let result = op(attempt_number).await;
            let finished_at = Utc::now();

            let err = match result {
                Ok(value) => {
                    attempts.push(Attempt {
                        work_item_id: work_item_id.to_string(),
                        attempt_number,
                        started_at,
                        finished_at,
                        outcome: AttemptOutcome::Success,
                    });
                    debug!(item = work_item_id, attempt_number, "Attempt succeeded");
                    return ExecutionReport {
                        outcome: Execution::Success(value),
                        attempts,
                        delays,
                    };
                }
                Err(err) => err,
            };

            attempts.push(Attempt {
                work_item_id: work_item_id.to_string(),
                attempt_number,
                started_at,
                finished_at,
                outcome: AttemptOutcome::from_error(err.kind),
            });

            if err.kind.is_retryable() && attempt_number < self.policy.max_attempts() {
                let retry_index = attempt_number - 1;
                let previous = delays.last().copied().unwrap_or_default();
                let delay = self.next_delay(retry_index, err.retry_after, previous);

                warn!(
                    item = work_item_id,
                    attempt_number,
                    kind = %err.kind,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.message,
                    "Attempt failed, retrying"
                );

                tokio::time::sleep(delay).await;
                delays.push(delay);
                continue;
            }

            error!(
                item = work_item_id,
                attempt_number,
                kind = %err.kind,
                error = %err.message,
                "Attempt failed permanently"
            );

            return ExecutionReport {
                outcome: Execution::Failed(err),
                attempts,
                delays,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = policy(5);

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(10000)); // Capped
        assert_eq!(policy.delay_for_retry(40), Duration::from_millis(10000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(policy(3));

        let report = executor
            .execute("a", |attempt| async move {
                if attempt < 3 {
                    Err(GenerationError::transient("connection reset"))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert!(matches!(report.outcome, Execution::Success(3)));
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(
            report.delays,
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
        assert!(report.attempts[2].outcome.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_short_circuits() {
        let executor = RetryExecutor::new(policy(5));

        let report: ExecutionReport<()> = executor
            .execute("a", |_| async { Err(GenerationError::input("prompt rejected")) })
            .await;

        assert_eq!(report.attempts.len(), 1);
        assert!(report.delays.is_empty());
        match report.outcome {
            Execution::Failed(err) => assert_eq!(err.kind, ErrorKind::FatalInput),
            Execution::Success(_) => panic!("Expected failure"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_an_outcome() {
        let executor = RetryExecutor::new(policy(2));

        let report: ExecutionReport<()> = executor
            .execute("a", |_| async { Err(GenerationError::quota("RESOURCE_EXHAUSTED")) })
            .await;

        assert_eq!(report.attempts.len(), 3);
        assert_eq!(report.delays.len(), 2);
        assert!(!report.is_success());
        assert_eq!(
            report.attempts.last().unwrap().outcome,
            AttemptOutcome::RetryableError(ErrorKind::RetryableQuota)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_single_attempt() {
        let executor = RetryExecutor::new(policy(0));

        let report: ExecutionReport<()> = executor
            .execute("a", |_| async { Err(GenerationError::transient("timeout")) })
            .await;

        assert_eq!(report.attempts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_capped() {
        let executor = RetryExecutor::new(policy(2));

        let report: ExecutionReport<()> = executor
            .execute("a", |_| async {
                Err(GenerationError::quota("429").with_retry_after(Duration::from_secs(30)))
            })
            .await;

        assert_eq!(report.delays, vec![Duration::from_secs(10), Duration::from_secs(10)]);
    }

    #[tokio::test]
    async fn test_gate_runs_before_each_attempt_start() {
        let executor = RetryExecutor::new(RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 1,
            ..policy(2)
        });
        let gate_done = std::sync::Mutex::new(Vec::new());
        let gate_log = &gate_done;

        let report: ExecutionReport<()> = executor
            .execute_gated(
                "a",
                move || async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    gate_log.lock().unwrap().push(Utc::now());
                },
                |_| async { Err(GenerationError::transient("timeout")) },
            )
            .await;

        let gate_done = gate_done.into_inner().unwrap();
        assert_eq!(gate_done.len(), 3);
        for (attempt, gated_at) in report.attempts.iter().zip(&gate_done) {
            assert!(attempt.started_at >= *gated_at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_raises_delay() {
        let executor = RetryExecutor::new(policy(1));

        let report: ExecutionReport<()> = executor
            .execute("a", |_| async {
                Err(GenerationError::quota("429").with_retry_after(Duration::from_secs(5)))
            })
            .await;

        assert_eq!(report.delays, vec![Duration::from_secs(5)]);
    }
}
