//! Configuration for genbatch.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (GENBATCH_HOME, GENBATCH_LEDGER)
//! 2. Config file (.genbatch/config.yaml)
//! 3. Defaults (~/.genbatch)
//!
//! Config file discovery:
//! - Searches current directory and parents for .genbatch/config.yaml
//! - Paths in config file are relative to the project root (parent of .genbatch/)
//!
//! A batch manifest may override dispatch settings for its own run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapters::ExitCodeMap;
use crate::core::quota::{QuotaLimit, DEFAULT_RESOURCE};
use crate::core::retry::{
    default_backoff_multiplier, default_initial_delay, default_max_delay, default_max_retries,
    RetryPolicy,
};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub generator: Option<GeneratorConfig>,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to project root)
    pub home: Option<String>,
    /// Ledger file (relative to project root)
    pub ledger: Option<String>,
}

/// Settings for the subprocess generation client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_generator_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub exit_codes: ExitCodeMap,
}

fn default_generator_timeout() -> u64 {
    120
}
fn default_content_type() -> String {
    "image/png".to_string()
}

impl GeneratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Settings for the local artifact store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Artifact root (relative to project root)
    pub root: Option<String>,
    /// Base URL used to build public references
    pub public_base_url: Option<String>,
}

/// Extra pause after a streak of failed items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCooldown {
    /// Consecutive failed items that trigger the pause
    pub after: u32,
    pub delay_ms: u64,
}

impl FailureCooldown {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Quota, retry and pacing settings for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Resource key for items that do not name one
    #[serde(default = "default_resource")]
    pub default_resource: String,

    /// Request caps per resource key
    #[serde(default)]
    pub resource_limits: HashMap<String, QuotaLimit>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fixed pause between items
    #[serde(default = "default_inter_item_delay")]
    pub inter_item_delay_ms: u64,

    #[serde(default)]
    pub failure_cooldown: Option<FailureCooldown>,
}

fn default_resource() -> String {
    DEFAULT_RESOURCE.to_string()
}
fn default_inter_item_delay() -> u64 {
    1500
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_resource: default_resource(),
            resource_limits: HashMap::new(),
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            inter_item_delay_ms: default_inter_item_delay(),
            failure_cooldown: None,
        }
    }
}

/// Invalid dispatch settings
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Resource '{resource}' has a zero request limit")]
    ZeroLimit { resource: String },

    #[error("Resource '{resource}' has a zero-length window")]
    ZeroWindow { resource: String },

    #[error("Backoff multiplier must be >= 1.0, got {0}")]
    Multiplier(f64),

    #[error("Initial delay {initial_ms}ms exceeds max delay {max_ms}ms")]
    DelayBounds { initial_ms: u64, max_ms: u64 },

    #[error("Default resource key cannot be empty")]
    EmptyDefaultResource,

    #[error("Failure cool-down threshold must be at least 1")]
    CooldownThreshold,
}

impl DispatchSettings {
    /// Check settings that would break quota or backoff guarantees
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_resource.trim().is_empty() {
            return Err(ConfigError::EmptyDefaultResource);
        }

        for (resource, limit) in &self.resource_limits {
            if limit.count == 0 {
                return Err(ConfigError::ZeroLimit {
                    resource: resource.clone(),
                });
            }
            if limit.window_seconds == 0 {
                return Err(ConfigError::ZeroWindow {
                    resource: resource.clone(),
                });
            }
        }

        if !(self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::Multiplier(self.backoff_multiplier));
        }

        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::DelayBounds {
                initial_ms: self.initial_delay_ms,
                max_ms: self.max_delay_ms,
            });
        }

        if matches!(self.failure_cooldown, Some(c) if c.after == 0) {
            return Err(ConfigError::CooldownThreshold);
        }

        Ok(())
    }

    /// Retry policy derived from these settings
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }

    /// Apply per-run overrides from a manifest
    pub fn merged(&self, overrides: &DispatchOverrides) -> Self {
        let mut merged = self.clone();
        if let Some(ref resource) = overrides.default_resource {
            merged.default_resource = resource.clone();
        }
        merged
            .resource_limits
            .extend(overrides.resource_limits.iter().map(|(k, v)| (k.clone(), *v)));
        if let Some(v) = overrides.max_retries {
            merged.max_retries = v;
        }
        if let Some(v) = overrides.initial_delay_ms {
            merged.initial_delay_ms = v;
        }
        if let Some(v) = overrides.max_delay_ms {
            merged.max_delay_ms = v;
        }
        if let Some(v) = overrides.backoff_multiplier {
            merged.backoff_multiplier = v;
        }
        if let Some(v) = overrides.inter_item_delay_ms {
            merged.inter_item_delay_ms = v;
        }
        if overrides.failure_cooldown.is_some() {
            merged.failure_cooldown = overrides.failure_cooldown;
        }
        merged
    }
}

/// Partial dispatch settings carried by a batch manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchOverrides {
    pub default_resource: Option<String>,
    #[serde(default)]
    pub resource_limits: HashMap<String, QuotaLimit>,
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub inter_item_delay_ms: Option<u64>,
    pub failure_cooldown: Option<FailureCooldown>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to genbatch home (engine state)
    pub home: PathBuf,
    /// Default ledger file
    pub ledger: PathBuf,
    /// Root directory for the local artifact store
    pub artifacts: PathBuf,
    pub public_base_url: Option<String>,
    pub dispatch: DispatchSettings,
    pub generator: Option<GeneratorConfig>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".genbatch").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse config YAML content
pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = serde_yaml::from_str(content).context("Invalid config YAML")?;
    config.dispatch.validate()?;
    Ok(config)
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".genbatch");

    let config_file = find_config_file();

    let resolved = match config_file {
        Some(ref config_path) => {
            let config = load_config_file(config_path)?;

            // Base directory is the parent of .genbatch/
            let base_dir = config_path
                .parent()
                .and_then(|p| p.parent())
                .unwrap_or(Path::new("."));

            resolve_from_file(config, base_dir, &default_home, Some(config_path.clone()))
        }
        None => {
            let home = env_path("GENBATCH_HOME").unwrap_or(default_home);
            ResolvedConfig {
                ledger: env_path("GENBATCH_LEDGER").unwrap_or_else(|| home.join("ledger.jsonl")),
                artifacts: home.join("artifacts"),
                home,
                public_base_url: None,
                dispatch: DispatchSettings::default(),
                generator: None,
                config_file: None,
            }
        }
    };

    Ok(resolved)
}

fn resolve_from_file(
    config: ConfigFile,
    base_dir: &Path,
    default_home: &Path,
    config_file: Option<PathBuf>,
) -> ResolvedConfig {
    let home = env_path("GENBATCH_HOME")
        .or_else(|| config.paths.home.as_deref().map(|h| resolve_path(base_dir, h)))
        .unwrap_or_else(|| default_home.to_path_buf());

    let ledger = env_path("GENBATCH_LEDGER")
        .or_else(|| config.paths.ledger.as_deref().map(|l| resolve_path(base_dir, l)))
        .unwrap_or_else(|| home.join("ledger.jsonl"));

    let artifacts = config
        .store
        .root
        .as_deref()
        .map(|r| resolve_path(base_dir, r))
        .unwrap_or_else(|| home.join("artifacts"));

    ResolvedConfig {
        home,
        ledger,
        artifacts,
        public_base_url: config.store.public_base_url,
        dispatch: config.dispatch,
        generator: config.generator,
        config_file,
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
