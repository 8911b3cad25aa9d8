//! Sliding-window quota tracking per resource key.
//!
//! Each resource key keeps an ordered queue of recent request timestamps.
//! `acquire` blocks until one more request fits inside the window, then
//! records it. Capacity frees itself as timestamps age out.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

/// Resource key whose limit applies to keys without their own entry
pub const DEFAULT_RESOURCE: &str = "default";

/// Extra wait added after the oldest timestamp leaves the window
pub const DEFAULT_SAFETY_EPSILON: Duration = Duration::from_millis(100);

/// Request cap for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimit {
    /// Maximum requests per window
    pub count: u32,

    /// Window length in seconds
    pub window_seconds: u64,
}

impl QuotaLimit {
    pub fn new(count: u32, window_seconds: u64) -> Self {
        Self {
            count,
            window_seconds,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Recent request timestamps for one resource key
#[derive(Debug)]
pub struct QuotaWindow {
    pub resource_key: String,
    timestamps: VecDeque<Instant>,
    limit: usize,
    window: Duration,
}

impl QuotaWindow {
    pub fn new(resource_key: impl Into<String>, limit: QuotaLimit) -> Self {
        Self {
            resource_key: resource_key.into(),
            timestamps: VecDeque::new(),
            limit: limit.count as usize,
            window: limit.window(),
        }
    }

    /// Drop timestamps that are no longer inside the window
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// How long to wait before another request fits, if at all
    fn wait_needed(&mut self, now: Instant, epsilon: Duration) -> Option<Duration> {
        self.prune(now);
        if self.timestamps.len() < self.limit {
            return None;
        }

        let oldest = *self.timestamps.front()?;
        let frees_at = oldest + self.window + epsilon;
        Some(frees_at.saturating_duration_since(now))
    }

    fn record(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }

    /// Requests currently inside the window
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.timestamps.len()
    }
}

/// Blocks callers so no resource exceeds its configured request rate
#[derive(Debug)]
pub struct QuotaTracker {
    limits: HashMap<String, QuotaLimit>,
    windows: Mutex<HashMap<String, QuotaWindow>>,
    epsilon: Duration,
}

impl QuotaTracker {
    /// Create a tracker from per-resource limits
    pub fn new(limits: HashMap<String, QuotaLimit>) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
            epsilon: DEFAULT_SAFETY_EPSILON,
        }
    }

    /// Tracker with no limits (every acquire returns immediately)
    pub fn unlimited() -> Self {
        Self::new(HashMap::new())
    }

    pub fn with_epsilon(mut self, epsilon: Duration) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Effective limit for a resource key
    pub fn limit_for(&self, resource_key: &str) -> Option<QuotaLimit> {
        self.limits
            .get(resource_key)
            .or_else(|| self.limits.get(DEFAULT_RESOURCE))
            .copied()
    }

    /// Wait until a request for `resource_key` is allowed, then record it.
    ///
    /// Returns the total time spent waiting.
    pub async fn acquire(&self, resource_key: &str) -> Duration {
        let Some(limit) = self.limit_for(resource_key) else {
            return Duration::ZERO;
        };

        let mut waited = Duration::ZERO;

        loop {
            let wait = {
                let mut windows = self.lock_windows();
                let window = windows
                    .entry(resource_key.to_string())
                    .or_insert_with(|| QuotaWindow::new(resource_key, limit));

                let now = Instant::now();
                match window.wait_needed(now, self.epsilon) {
                    None => {
                        window.record(now);
                        debug!(
                            resource = resource_key,
                            used = window.timestamps.len(),
                            limit = limit.count,
                            "Quota acquired"
                        );
                        return waited;
                    }
                    Some(wait) => wait,
                }
            };

            info!(
                resource = resource_key,
                wait_ms = wait.as_millis() as u64,
                "Quota limit reached, waiting for window to free"
            );
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    /// Number of requests for `resource_key` inside its current window
    pub fn usage(&self, resource_key: &str) -> usize {
        let mut windows = self.lock_windows();
        windows
            .get_mut(resource_key)
            .map(|w| w.in_window(Instant::now()))
            .unwrap_or(0)
    }

    fn lock_windows(&self) -> std::sync::MutexGuard<'_, HashMap<String, QuotaWindow>> {
        // Windows hold plain timestamps; a poisoned lock still has valid data
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
