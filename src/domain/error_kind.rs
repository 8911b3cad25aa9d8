//! Closed classification of generation failures.
//!
//! Kinds are assigned once, at the adapter boundary. Everything downstream
//! (retry executor, orchestrator, ledger) branches on the kind only.

use serde::{Deserialize, Serialize};

/// Classification of a failed generation call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or timeout class failure
    RetryableTransient,

    /// Explicit throttling signal from the service
    RetryableQuota,

    /// Malformed or policy-rejected prompt
    FatalInput,

    /// Credential or permission failure; recurs for every later call
    FatalAuth,

    /// Unclassifiable; treated as fatal to avoid unbounded retry
    FatalUnknown,
}

impl ErrorKind {
    /// Whether another attempt may succeed
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RetryableTransient | Self::RetryableQuota)
    }

    /// Whether this failure aborts the rest of the run
    pub fn aborts_run(self) -> bool {
        matches!(self, Self::FatalAuth)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetryableTransient => "retryable_transient",
            Self::RetryableQuota => "retryable_quota",
            Self::FatalInput => "fatal_input",
            Self::FatalAuth => "fatal_auth",
            Self::FatalUnknown => "fatal_unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
