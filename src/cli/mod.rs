//! Command-line interface for genbatch.
//!
//! Provides commands for running a batch manifest, summarizing the
//! ledger, listing what a re-run would process, and showing config.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::adapters::{CommandGenerator, LocalArtifactStore};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    order_by_priority, reconcile, rerun_ids, status_counts, BatchManifest, BatchOrchestrator,
    JsonlLedger, ResultLedger,
};
use crate::domain::{HaltReason, Summary, WorkItemStatus};

/// genbatch - Quota-aware batch generation dispatcher
#[derive(Parser, Debug)]
#[command(name = "genbatch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a batch manifest
    Run {
        /// Manifest file (YAML or JSON)
        manifest: PathBuf,

        /// Ledger file (defaults to the configured ledger)
        #[arg(short, long, env = "GENBATCH_LEDGER")]
        ledger: Option<PathBuf>,

        /// Ignore prior ledger records and process every item
        #[arg(long)]
        fresh: bool,
    },

    /// Summarize the latest outcome of every recorded item
    Status {
        /// Ledger file (defaults to the configured ledger)
        #[arg(short, long, env = "GENBATCH_LEDGER")]
        ledger: Option<PathBuf>,
    },

    /// List items a re-run of the manifest would process
    Pending {
        /// Manifest file (YAML or JSON)
        manifest: PathBuf,

        /// Ledger file (defaults to the configured ledger)
        #[arg(short, long, env = "GENBATCH_LEDGER")]
        ledger: Option<PathBuf>,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                manifest,
                ledger,
                fresh,
            } => run_batch(&manifest, ledger, fresh).await,
            Commands::Status { ledger } => show_status(ledger).await,
            Commands::Pending { manifest, ledger } => show_pending(&manifest, ledger).await,
            Commands::Config => show_config(),
        }
    }
}

fn ledger_path(cfg: &ResolvedConfig, explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| cfg.ledger.clone())
}

fn build_generator(cfg: &ResolvedConfig) -> Result<CommandGenerator> {
    let generator = cfg.generator.as_ref().context(
        "No generator configured. Add a `generator:` section to .genbatch/config.yaml",
    )?;

    Ok(CommandGenerator::new(&generator.program)
        .with_args(generator.args.clone())
        .with_timeout(generator.timeout())
        .with_content_type(&generator.content_type)
        .with_exit_codes(generator.exit_codes.clone()))
}

fn build_store(cfg: &ResolvedConfig) -> LocalArtifactStore {
    let store = LocalArtifactStore::new(&cfg.artifacts);
    match cfg.public_base_url {
        Some(ref base_url) => store.with_public_base_url(base_url),
        None => store,
    }
}

/// Run a batch manifest to completion (or until aborted)
async fn run_batch(manifest_path: &Path, ledger: Option<PathBuf>, fresh: bool) -> Result<()> {
    let cfg = config::config()?;
    let manifest = BatchManifest::from_file(manifest_path)?;
    let settings = cfg.dispatch.merged(&manifest.dispatch);

    let generator = build_generator(cfg)?;
    let store = build_store(cfg);

    let ledger_path = ledger_path(cfg, ledger);
    let ledger = JsonlLedger::open(&ledger_path)
        .await
        .with_context(|| format!("Failed to open ledger: {}", ledger_path.display()))?;
    let prior = if fresh {
        None
    } else {
        Some(ledger.load_all().await?)
    };

    let cancel = CancellationToken::new();
    let orchestrator = BatchOrchestrator::new(Arc::new(generator), Arc::new(store), settings)?
        .with_cancellation(cancel.clone());

    // Ctrl-C stops the run before the next item
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing current item");
            cancel.cancel();
        }
    });

    eprintln!(
        "Running batch '{}' ({} items, ledger: {})",
        manifest.name,
        manifest.items.len(),
        ledger_path.display()
    );

    let summary = orchestrator
        .run(manifest.items, &ledger, prior.as_deref())
        .await?;

    print_summary(&summary);

    if summary.halt == HaltReason::AuthFailure {
        anyhow::bail!("Run {} aborted: credential failure", summary.run_id);
    }

    Ok(())
}

fn print_summary(summary: &Summary) {
    for record in &summary.records {
        match record.final_status {
            WorkItemStatus::Succeeded => println!(
                "  ok      {:<30} {}",
                record.work_item_id,
                record.artifact_reference.as_deref().unwrap_or("")
            ),
            WorkItemStatus::Failed => println!(
                "  failed  {:<30} {} ({} attempts)",
                record.work_item_id,
                record.error_message.as_deref().unwrap_or(""),
                record.total_attempts
            ),
            _ => println!(
                "  skipped {:<30} {}",
                record.work_item_id,
                record.error_message.as_deref().unwrap_or("")
            ),
        }
    }

    eprintln!(
        "\n[Run {}: {} succeeded, {} failed, {} skipped ({} already done)]",
        summary.run_id, summary.succeeded, summary.failed, summary.skipped, summary.resumed
    );

    match summary.halt {
        HaltReason::Completed if summary.has_remaining_work() => {
            eprintln!("[Re-run the same manifest to retry the remaining items]")
        }
        HaltReason::Completed => {}
        HaltReason::AuthFailure => eprintln!("[Stopped: credential failure]"),
        HaltReason::Cancelled => eprintln!("[Stopped: cancelled]"),
    }
}

/// Summarize authoritative outcomes in the ledger
async fn show_status(ledger: Option<PathBuf>) -> Result<()> {
    let cfg = config::config()?;
    let path = ledger_path(cfg, ledger);
    let records = JsonlLedger::read(&path).await?;

    if records.is_empty() {
        println!("No records in ledger: {}", path.display());
        return Ok(());
    }

    let counts = status_counts(&records);
    let count = |status: WorkItemStatus| counts.get(&status).copied().unwrap_or(0);

    println!("Ledger: {}", path.display());
    println!("Records: {}", records.len());
    println!("Succeeded: {}", count(WorkItemStatus::Succeeded));
    println!("Failed:    {}", count(WorkItemStatus::Failed));
    println!("Skipped:   {}", count(WorkItemStatus::Skipped));

    let mut unfinished: Vec<_> = reconcile(&records)
        .into_values()
        .filter(|r| !r.is_succeeded())
        .collect();
    unfinished.sort_by(|a, b| a.work_item_id.cmp(&b.work_item_id));

    if !unfinished.is_empty() {
        println!();
        println!("{:<30} {:<10} {:<20} {}", "ITEM", "STATUS", "ERROR KIND", "MESSAGE");
        println!("{}", "-".repeat(90));
        for record in unfinished {
            println!(
                "{:<30} {:<10} {:<20} {}",
                record.work_item_id,
                record.final_status.to_string(),
                record.error_kind.map(|k| k.as_str()).unwrap_or("-"),
                record.error_message.as_deref().unwrap_or("")
            );
        }
    }

    Ok(())
}

/// List items a re-run would process, in dispatch order
async fn show_pending(manifest_path: &Path, ledger: Option<PathBuf>) -> Result<()> {
    let cfg = config::config()?;
    let manifest = BatchManifest::from_file(manifest_path)?;
    let records = JsonlLedger::read(&ledger_path(cfg, ledger)).await?;

    let items = order_by_priority(manifest.items);
    let pending = rerun_ids(&items, &records);

    if pending.is_empty() {
        println!("All {} items already succeeded", items.len());
        return Ok(());
    }

    for id in &pending {
        println!("{}", id);
    }
    eprintln!("\n{} of {} items pending", pending.len(), items.len());

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("genbatch configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Ledger:    {}", cfg.ledger.display());
    println!("  Artifacts: {}", cfg.artifacts.display());
    if let Some(ref base_url) = cfg.public_base_url {
        println!("  Public URL base: {}", base_url);
    }
    println!();
    println!("Generator:");
    match cfg.generator {
        Some(ref generator) => {
            println!("  Program: {} {}", generator.program, generator.args.join(" "));
            println!("  Timeout: {}s", generator.timeout_seconds);
        }
        None => println!("  (not configured)"),
    }
    println!();

    let dispatch = &cfg.dispatch;
    println!("Dispatch:");
    println!("  Default resource: {}", dispatch.default_resource);
    println!("  Max retries:      {}", dispatch.max_retries);
    println!(
        "  Backoff:          {}ms x{} (max {}ms)",
        dispatch.initial_delay_ms, dispatch.backoff_multiplier, dispatch.max_delay_ms
    );
    println!("  Inter-item delay: {}ms", dispatch.inter_item_delay_ms);
    if let Some(cooldown) = dispatch.failure_cooldown {
        println!(
            "  Failure cooldown: {}ms after {} failures",
            cooldown.delay_ms, cooldown.after
        );
    }
    println!();
    println!("Resource limits:");
    if dispatch.resource_limits.is_empty() {
        println!("  (unlimited)");
    } else {
        let mut limits: Vec<_> = dispatch.resource_limits.iter().collect();
        limits.sort_by(|a, b| a.0.cmp(b.0));
        for (resource, limit) in limits {
            println!("  {}: {} per {}s", resource, limit.count, limit.window_seconds);
        }
    }

    Ok(())
}
