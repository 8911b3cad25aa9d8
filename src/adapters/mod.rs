//! Collaborator interfaces for external systems.
//!
//! The dispatch engine talks to two collaborators:
//! - GenerationClient: issues the actual generation call
//! - ArtifactStore: persists the produced artifact and returns a reference
//!
//! Adapters are the only place where raw failures are classified into
//! an [`ErrorKind`].

pub mod command;
pub mod local_store;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::{ErrorKind, WorkItem};

// Re-export the reference adapters
pub use command::{CommandGenerator, ExitCodeMap};
pub use local_store::LocalArtifactStore;

/// Per-call options passed to the generation client
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Resource key (e.g. model name) the call is dispatched against
    pub resource: String,

    /// Category tag of the work item
    pub category: String,

    /// Item metadata forwarded verbatim
    pub metadata: BTreeMap<String, String>,
}

impl GenerateOptions {
    /// Build options for a work item
    pub fn for_item(item: &WorkItem, resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            category: item.category.clone(),
            metadata: item.metadata.clone(),
        }
    }
}

/// Output of a successful generation call
#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    /// Raw artifact bytes (e.g. a PNG)
    pub payload: Vec<u8>,

    /// MIME type of the payload
    pub content_type: String,

    /// Collaborator-specific metadata (e.g. enhanced prompt)
    pub metadata: BTreeMap<String, String>,
}

impl GeneratedArtifact {
    /// Create an artifact with just a payload and content type
    pub fn new(payload: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            payload,
            content_type: content_type.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// A classified generation failure
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct GenerationError {
    pub kind: ErrorKind,

    pub message: String,

    /// Server-provided hint for how long to wait before retrying
    pub retry_after: Option<Duration>,
}

impl GenerationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RetryableTransient, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RetryableQuota, message)
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FatalInput, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FatalAuth, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FatalUnknown, message)
    }

    /// Attach a retry-after hint
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Trait for generation backends
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Human-readable client name
    fn name(&self) -> &str;

    /// Generate one artifact for a prompt
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<GeneratedArtifact, GenerationError>;
}

/// Metadata stored alongside an artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub work_item_id: String,
    pub category: String,
    pub prompt: String,
    pub content_type: String,

    /// SHA-256 of the payload, hex encoded
    pub sha256: String,

    pub generated_at: DateTime<Utc>,

    /// Item metadata merged with generation metadata
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ArtifactMetadata {
    /// Describe a generated artifact for a work item
    pub fn describe(item: &WorkItem, artifact: &GeneratedArtifact) -> Self {
        let mut extra = item.metadata.clone();
        extra.extend(artifact.metadata.clone());

        Self {
            work_item_id: item.id.clone(),
            category: item.category.clone(),
            prompt: item.prompt.clone(),
            content_type: artifact.content_type.clone(),
            sha256: payload_digest(&artifact.payload),
            generated_at: Utc::now(),
            extra,
        }
    }
}

/// Hex SHA-256 of an artifact payload
pub fn payload_digest(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Trait for artifact persistence backends
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Human-readable store name
    fn name(&self) -> &str;

    /// Persist a payload at `target_path` and return its public reference
    async fn store(
        &self,
        payload: &[u8],
        target_path: &str,
        metadata: &ArtifactMetadata,
    ) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_error_display() {
        let err = GenerationError::quota("RESOURCE_EXHAUSTED");
        assert_eq!(err.to_string(), "retryable_quota: RESOURCE_EXHAUSTED");
    }

    #[test]
    fn test_payload_digest_is_stable() {
        let a = payload_digest(b"png bytes");
        assert_eq!(a, payload_digest(b"png bytes"));
        assert_ne!(a, payload_digest(b"other bytes"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_metadata_merges_generation_metadata() {
        let mut item = WorkItem::new("a", "a door", "doors", "doors/a.png", 0);
        item.metadata.insert("original_url".into(), "/doors".into());

        let mut artifact = GeneratedArtifact::new(vec![1, 2, 3], "image/png");
        artifact
            .metadata
            .insert("enhanced_prompt".into(), "a red door".into());

        let meta = ArtifactMetadata::describe(&item, &artifact);
        assert_eq!(meta.extra.len(), 2);
        assert_eq!(meta.content_type, "image/png");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GenerationError>();
    }
}
