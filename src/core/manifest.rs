//! Batch manifests.
//!
//! A manifest is a YAML (or JSON) document listing work item descriptors,
//! optionally with per-run dispatch overrides.

use std::collections::HashSet;
use std::path::{Component, Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DispatchOverrides;
use crate::domain::{WorkItem, WorkItemStatus};

/// A batch of work items to dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchManifest {
    /// Batch name (used in logs)
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Dispatch overrides for this batch
    #[serde(default)]
    pub dispatch: DispatchOverrides,

    /// Work item descriptors in input order
    pub items: Vec<WorkItem>,
}

/// Manifest validation failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManifestError {
    #[error("Manifest contains no items")]
    Empty,

    #[error("Item {index} has an empty id")]
    EmptyId { index: usize },

    #[error("Duplicate item id: {0}")]
    DuplicateId(String),

    #[error("Item '{0}' has an empty prompt")]
    EmptyPrompt(String),

    #[error("Item '{id}' has an invalid target path: {path}")]
    InvalidTargetPath { id: String, path: String },

    #[error("Item '{id}' must start pending, found status: {status}")]
    NotPending { id: String, status: WorkItemStatus },
}

impl BatchManifest {
    /// Load a manifest from a YAML or JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to load manifest: {}", path.display()))
    }

    /// Parse and validate manifest content (JSON is valid YAML)
    pub fn from_yaml(content: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(content).context("Failed to parse manifest YAML")?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.items.is_empty() {
            return Err(ManifestError::Empty);
        }

        let mut seen = HashSet::new();
        for (index, item) in self.items.iter().enumerate() {
            if item.id.trim().is_empty() {
                return Err(ManifestError::EmptyId { index });
            }
            if !seen.insert(item.id.as_str()) {
                return Err(ManifestError::DuplicateId(item.id.clone()));
            }
            if item.prompt.trim().is_empty() {
                return Err(ManifestError::EmptyPrompt(item.id.clone()));
            }
            if !is_relative_target(&item.target_path) {
                return Err(ManifestError::InvalidTargetPath {
                    id: item.id.clone(),
                    path: item.target_path.clone(),
                });
            }
            if item.status != WorkItemStatus::Pending {
                return Err(ManifestError::NotPending {
                    id: item.id.clone(),
                    status: item.status,
                });
            }
        }

        Ok(())
    }

    /// Get an item by id
    pub fn get_item(&self, id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|i| i.id == id)
    }
}

/// Target paths must be non-empty, relative, and stay below the store root
fn is_relative_target(target: &str) -> bool {
    let path = Path::new(target);
    !target.trim().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MANIFEST_YAML: &str = r#"
name: windows-la
description: Hero images for window product pages

dispatch:
  max_retries: 2
  resource_limits:
    imagen-3.0-generate: { count: 1, window_seconds: 60 }

items:
  - id: double-hung-hero
    prompt: A white double-hung window in a craftsman home
    category: windows
    priority: 10
    target_path: windows/double-hung-hero.png
    resource: imagen-3.0-generate

  - id: garden-window
    prompt: A garden window above a kitchen sink
    category: windows
    target_path: windows/garden-window.png
    metadata:
      original_url: /garden
"#;

    #[test]
    fn test_manifest_parsing() {
        let manifest = BatchManifest::from_yaml(TEST_MANIFEST_YAML).unwrap();

        assert_eq!(manifest.name, "windows-la");
        assert_eq!(manifest.items.len(), 2);
        assert_eq!(manifest.dispatch.max_retries, Some(2));
        assert_eq!(manifest.items[0].priority, 10);
        assert_eq!(
            manifest.get_item("garden-window").unwrap().metadata["original_url"],
            "/garden"
        );
    }

    #[test]
    fn test_json_manifest() {
        let json = r#"{
            "name": "json-batch",
            "items": [
                {"id": "a", "prompt": "a door", "target_path": "doors/a.png"}
            ]
        }"#;
        let manifest = BatchManifest::from_yaml(json).unwrap();
        assert_eq!(manifest.items[0].id, "a");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut manifest = BatchManifest::from_yaml(TEST_MANIFEST_YAML).unwrap();
        manifest.items[1].id = "double-hung-hero".to_string();

        assert_eq!(
            manifest.validate(),
            Err(ManifestError::DuplicateId("double-hung-hero".to_string()))
        );
    }

    #[test]
    fn test_target_path_rules() {
        assert!(is_relative_target("windows/a.png"));
        assert!(is_relative_target("./a.png"));
        assert!(!is_relative_target("/etc/passwd"));
        assert!(!is_relative_target("../outside.png"));
        assert!(!is_relative_target("windows/../../x.png"));
        assert!(!is_relative_target(""));
    }

    #[test]
    fn test_preset_status_rejected() {
        let yaml = r#"
name: preset
items:
  - id: a
    prompt: A bay window
    target_path: a.png
    status: succeeded
"#;
        let err = BatchManifest::from_yaml(yaml).unwrap_err();
        let err = err.downcast::<ManifestError>().unwrap();
        assert_eq!(
            err,
            ManifestError::NotPending {
                id: "a".to_string(),
                status: WorkItemStatus::Succeeded,
            }
        );
    }

    #[test]
    fn test_empty_manifest_rejected() {
        let yaml = "name: empty\nitems: []\n";
        assert!(BatchManifest::from_yaml(yaml).is_err());
    }
}
