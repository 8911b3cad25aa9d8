//! Append-only result ledger with file-based persistence.
//!
//! Records are stored as newline-delimited JSON (JSONL), one terminal
//! outcome per line. Records are never rewritten; when several runs record
//! the same work item, the most recently appended record is authoritative.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions as StdOpenOptions;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::{ResultRecord, WorkItem, WorkItemStatus};

/// Errors that can occur with the result ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger is locked by another writer: {0}")]
    Locked(PathBuf),

    #[error("Corrupt ledger record at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable store of terminal outcomes
#[async_trait]
pub trait ResultLedger: Send + Sync {
    /// Append one record; appended records are immutable
    async fn append(&self, record: &ResultRecord) -> Result<(), LedgerError>;

    /// Load every record in append order
    async fn load_all(&self) -> Result<Vec<ResultRecord>, LedgerError>;
}

/// JSONL ledger file guarded by an exclusive advisory lock
pub struct JsonlLedger {
    path: PathBuf,

    /// Held for the lifetime of the ledger; released on drop
    _lock: std::fs::File,
}

impl JsonlLedger {
    /// Open (or create) a ledger for writing.
    ///
    /// Fails with [`LedgerError::Locked`] if another writer holds it.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let lock_path = lock_path_for(&path);
        let lock = StdOpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;

        if lock.try_lock_exclusive().is_err() {
            return Err(LedgerError::Locked(path));
        }

        repair_tail(&path).await?;

        Ok(Self { path, _lock: lock })
    }

    /// Path to the ledger file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a ledger without taking the writer lock
    pub async fn read(path: &Path) -> Result<Vec<ResultRecord>, LedgerError> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let mut numbered = Vec::new();
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            numbered.push((line_no, line));
        }

        let last = numbered.len();
        let mut records = Vec::with_capacity(last);

        for (idx, (line_no, line)) in numbered.into_iter().enumerate() {
            match serde_json::from_str::<ResultRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) if idx + 1 == last => {
                    // Torn final write from an interrupted run
                    warn!(line = line_no, error = %e, "Ignoring incomplete trailing ledger record");
                }
                Err(e) => return Err(LedgerError::Corrupt { line: line_no, source: e }),
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl ResultLedger for JsonlLedger {
    async fn append(&self, record: &ResultRecord) -> Result<(), LedgerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let json = serde_json::to_string(record)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<ResultRecord>, LedgerError> {
        Self::read(&self.path).await
    }
}

/// Make the file end on a line boundary before anything is appended.
///
/// An unterminated last line that still parses is kept and terminated;
/// otherwise the torn fragment is truncated away.
async fn repair_tail(path: &Path) -> Result<(), LedgerError> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(());
    }

    let line_start = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);

    if serde_json::from_slice::<ResultRecord>(&content[line_start..]).is_ok() {
        let mut file = OpenOptions::new().append(true).open(path).await?;
        file.write_all(b"\n").await?;
        file.sync_data().await?;
        return Ok(());
    }

    warn!(
        path = %path.display(),
        bytes = content.len() - line_start,
        "Truncating incomplete trailing ledger record"
    );
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(line_start as u64).await?;
    file.sync_data().await?;

    Ok(())
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

/// In-process ledger, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<ResultRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a ledger with records from an earlier run
    pub fn with_records(records: Vec<ResultRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

#[async_trait]
impl ResultLedger for MemoryLedger {
    async fn append(&self, record: &ResultRecord) -> Result<(), LedgerError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<ResultRecord>, LedgerError> {
        Ok(self.records.lock().await.clone())
    }
}

/// Authoritative record per work item (last appended wins)
pub fn reconcile(records: &[ResultRecord]) -> HashMap<String, ResultRecord> {
    let mut latest = HashMap::new();
    for record in records {
        latest.insert(record.work_item_id.clone(), record.clone());
    }
    latest
}

/// Ids whose authoritative record is Succeeded
pub fn succeeded_ids(records: &[ResultRecord]) -> HashSet<String> {
    reconcile(records)
        .into_values()
        .filter(|r| r.is_succeeded())
        .map(|r| r.work_item_id)
        .collect()
}

/// Ids from `items` that a re-run would process, in input order
pub fn rerun_ids(items: &[WorkItem], records: &[ResultRecord]) -> Vec<String> {
    let done = succeeded_ids(records);
    items
        .iter()
        .filter(|item| !done.contains(&item.id))
        .map(|item| item.id.clone())
        .collect()
}

/// Authoritative outcome counts per status
pub fn status_counts(records: &[ResultRecord]) -> HashMap<WorkItemStatus, usize> {
    let mut counts = HashMap::new();
    for record in reconcile(records).values() {
        *counts.entry(record.final_status).or_insert(0) += 1;
    }
    counts
}
