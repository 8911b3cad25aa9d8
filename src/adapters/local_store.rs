//! Local filesystem artifact store.
//!
//! Writes each payload under a root directory with a `.meta.json` sidecar.
//! References are `<public_base_url>/<target_path>` when a public base URL
//! is configured, otherwise a `file://` URL.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;

use super::{ArtifactMetadata, ArtifactStore};

/// Artifact store rooted at a local directory
pub struct LocalArtifactStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base_url: None,
        }
    }

    /// Publish references under a base URL instead of file paths
    pub fn with_public_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.public_base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a target path inside the root, rejecting escapes
    fn resolve(&self, target_path: &str) -> Result<PathBuf> {
        let relative = Path::new(target_path.trim_start_matches('/'));

        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.as_os_str().is_empty() {
            anyhow::bail!("Target path escapes the store root: {}", target_path);
        }

        Ok(self.root.join(relative))
    }

    fn reference_for(&self, target_path: &str, absolute: &Path) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base, target_path.trim_start_matches('/')),
            None => format!("file://{}", absolute.display()),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn store(
        &self,
        payload: &[u8],
        target_path: &str,
        metadata: &ArtifactMetadata,
    ) -> Result<String> {
        let artifact_path = self.resolve(target_path)?;

        if let Some(parent) = artifact_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        fs::write(&artifact_path, payload)
            .await
            .with_context(|| format!("Failed to write artifact: {}", artifact_path.display()))?;

        let mut sidecar = artifact_path.clone().into_os_string();
        sidecar.push(".meta.json");
        let json = serde_json::to_string_pretty(metadata).context("Failed to serialize metadata")?;
        fs::write(&sidecar, json)
            .await
            .with_context(|| format!("Failed to write metadata: {:?}", sidecar))?;

        let absolute = artifact_path
            .canonicalize()
            .unwrap_or_else(|_| artifact_path.clone());

        Ok(self.reference_for(target_path, &absolute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::GeneratedArtifact;
    use crate::domain::WorkItem;
    use tempfile::TempDir;

    fn metadata() -> ArtifactMetadata {
        let item = WorkItem::new("a", "a bay window", "windows", "windows/a.png", 0);
        ArtifactMetadata::describe(&item, &GeneratedArtifact::new(b"png".to_vec(), "image/png"))
    }

    #[tokio::test]
    async fn test_store_writes_payload_and_sidecar() {
        let temp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(temp.path());

        let reference = store
            .store(b"png", "windows/a.png", &metadata())
            .await
            .unwrap();

        assert!(reference.starts_with("file://"));
        assert_eq!(std::fs::read(temp.path().join("windows/a.png")).unwrap(), b"png");

        let sidecar = std::fs::read_to_string(temp.path().join("windows/a.png.meta.json")).unwrap();
        let parsed: ArtifactMetadata = serde_json::from_str(&sidecar).unwrap();
        assert_eq!(parsed.work_item_id, "a");
    }

    #[tokio::test]
    async fn test_public_reference() {
        let temp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(temp.path())
            .with_public_base_url("https://cdn.example.com/generated-images/");

        let reference = store
            .store(b"png", "/doors/b.png", &metadata())
            .await
            .unwrap();

        assert_eq!(reference, "https://cdn.example.com/generated-images/doors/b.png");
    }

    #[tokio::test]
    async fn test_parent_escape_rejected() {
        let temp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(temp.path());

        let result = store.store(b"png", "../outside.png", &metadata()).await;
        assert!(result.is_err());
    }
}
