//! Append-only execution history log.
//!
//! Entries are appended as line-delimited JSON, UTF-8, one `write()` call
//! per line. Reads never write; writes never read. A corrupt line is
//! skipped silently rather than failing the whole read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Execution mode that produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Kernel,
    Terminal,
}

/// Terminal outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error,
    Abort,
}

/// Coarse classification of execution failures, derived from `error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Syntax,
    Import,
    Runtime,
    Timeout,
    Transport,
    Canceled,
    Other,
}

/// Pinned `error_code` constants. The numeric ranges are not part of any
/// upstream standard; this module is the single place they're defined, and
/// `category_for_code` is the single place they're interpreted.
pub mod error_code {
    pub const NONE: i32 = 0;
    pub const SYNTAX_START: i32 = 100;
    pub const SYNTAX_END: i32 = 199;
    pub const IMPORT_START: i32 = 200;
    pub const IMPORT_END: i32 = 299;
    pub const RUNTIME_START: i32 = 300;
    pub const RUNTIME_END: i32 = 699;
    pub const TIMEOUT: i32 = 700;
    pub const CANCELED: i32 = 701;
    pub const TRANSPORT: i32 = 702;
}

/// Map an `error_code` to its `ErrorCategory`. `None` means "no error"
/// (the code is `error_code::NONE` or otherwise indicates success).
pub fn category_for_code(code: i32) -> Option<ErrorCategory> {
    use error_code::*;
    match code {
        NONE => None,
        SYNTAX_START..=SYNTAX_END => Some(ErrorCategory::Syntax),
        IMPORT_START..=IMPORT_END => Some(ErrorCategory::Import),
        RUNTIME_START..=RUNTIME_END => Some(ErrorCategory::Runtime),
        TIMEOUT => Some(ErrorCategory::Timeout),
        CANCELED => Some(ErrorCategory::Canceled),
        TRANSPORT => Some(ErrorCategory::Transport),
        _ => Some(ErrorCategory::Other),
    }
}

/// Structured error detail, mirroring a Jupyter `error` content payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

/// Which runtime an entry ran against, for display and filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRef {
    pub label: String,
    pub accelerator: String,
}

/// One immutable record of a single execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub mode: Mode,
    pub status: Status,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub traceback: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<i64>,
    pub runtime: RuntimeRef,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

impl HistoryEntry {
    /// Fills `category` from `error_code` if not already set, matching the
    /// "pin the mapping" instruction: entries are self-describing once
    /// appended.
    pub fn with_derived_category(mut self) -> Self {
        if self.category.is_none() {
            self.category = category_for_code(self.error_code);
        }
        self
    }
}

/// Filters for `HistoryStore::query`.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub status: Option<Status>,
    pub mode: Option<Mode>,
    pub category: Option<ErrorCategory>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl QueryFilter {
    pub fn with_limit(limit: usize) -> Self {
        QueryFilter {
            limit,
            ..Default::default()
        }
    }

    fn matches(&self, entry: &HistoryEntry) -> bool {
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        if let Some(mode) = self.mode {
            if entry.mode != mode {
                return false;
            }
        }
        if let Some(category) = self.category {
            if entry.category != Some(category) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        true
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Kernel
    }
}

/// Aggregate statistics over the whole log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub total_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    pub aborted_executions: usize,
    pub success_rate: u32,
    pub executions_by_mode: std::collections::BTreeMap<String, usize>,
    pub errors_by_category: std::collections::BTreeMap<String, usize>,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize history entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only JSON-lines execution history log.
///
/// Appends are totally ordered per-process by a single mutex guarding the
/// file handle, matching the "process-wide append mutex" policy.
#[derive(Clone)]
pub struct HistoryStore {
    path: PathBuf,
    append_lock: Arc<Mutex<()>>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        HistoryStore {
            path: path.into(),
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Creates the parent directory on demand. Each
    /// append is a single `write()` call of the serialized line plus `\n`.
    pub async fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let entry = entry.with_derived_category();
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.append_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Read the whole file, skipping lines that fail to parse, apply
    /// `filter`, sort by `timestamp` descending, and truncate to
    /// `filter.limit`.
    pub async fn query(&self, filter: &QueryFilter) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut entries = self.read_all().await?;
        entries.retain(|e| filter.matches(e));
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(filter.limit);
        Ok(entries)
    }

    /// Read every valid entry in the log, oldest-line-first, ignoring
    /// parse failures.
    async fn read_all(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    log::warn!("[colab-history] skipping corrupt line: {e}");
                }
            }
        }
        Ok(entries)
    }

    pub async fn get_stats(&self) -> Result<Stats, HistoryError> {
        let entries = self.read_all().await?;

        let total = entries.len();
        let successful = entries.iter().filter(|e| e.status == Status::Ok).count();
        let failed = entries.iter().filter(|e| e.status == Status::Error).count();
        let aborted = entries.iter().filter(|e| e.status == Status::Abort).count();

        let success_rate = if total > 0 {
            ((successful as f64 / total as f64) * 100.0).round() as u32
        } else {
            0
        };

        let mut by_mode = std::collections::BTreeMap::new();
        for entry in &entries {
            let key = match entry.mode {
                Mode::Kernel => "kernel",
                Mode::Terminal => "terminal",
            };
            *by_mode.entry(key.to_string()).or_insert(0) += 1;
        }

        let mut by_category = std::collections::BTreeMap::new();
        for entry in &entries {
            if let Some(category) = entry.category {
                let key = serde_json::to_value(category)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| "OTHER".to_string());
                *by_category.entry(key).or_insert(0) += 1;
            }
        }

        let oldest = entries.iter().map(|e| e.timestamp).min();
        let newest = entries.iter().map(|e| e.timestamp).max();

        Ok(Stats {
            total_executions: total,
            successful_executions: successful,
            failed_executions: failed,
            aborted_executions: aborted,
            success_rate,
            executions_by_mode: by_mode,
            errors_by_category: by_category,
            oldest_entry: oldest,
            newest_entry: newest,
        })
    }

    /// Truncate the log to zero bytes.
    pub async fn clear(&self) -> Result<(), HistoryError> {
        let _guard = self.append_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(ts: DateTime<Utc>, status: Status, error_code: i32) -> HistoryEntry {
        HistoryEntry {
            timestamp: ts,
            command: "print('hi')".into(),
            mode: Mode::Kernel,
            status,
            stdout: "hi\n".into(),
            stderr: String::new(),
            traceback: Vec::new(),
            execution_count: Some(1),
            runtime: RuntimeRef {
                label: "gpu-1".into(),
                accelerator: "GPU".into(),
            },
            error_code,
            error: None,
            category: None,
        }
    }

    #[tokio::test]
    async fn append_and_query_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        let entry = sample_entry(Utc::now(), Status::Ok, 0);
        store.append(entry.clone()).await.unwrap();

        let results = store.query(&QueryFilter::with_limit(50)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].command, entry.command);
        assert_eq!(results[0].category, None);
    }

    #[tokio::test]
    async fn query_sorts_descending_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        let t0 = Utc::now();
        store
            .append(sample_entry(t0, Status::Ok, 0))
            .await
            .unwrap();
        store
            .append(sample_entry(t0 + chrono::Duration::seconds(1), Status::Ok, 0))
            .await
            .unwrap();
        store
            .append(sample_entry(t0 + chrono::Duration::seconds(2), Status::Ok, 0))
            .await
            .unwrap();

        let results = store.query(&QueryFilter::with_limit(2)).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].timestamp > results[1].timestamp);
    }

    #[tokio::test]
    async fn query_limit_zero_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        store
            .append(sample_entry(Utc::now(), Status::Ok, 0))
            .await
            .unwrap();
        let results = store.query(&QueryFilter::with_limit(0)).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn corrupt_line_is_skipped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = HistoryStore::new(path.clone());
        let t0 = Utc::now();
        store
            .append(sample_entry(t0, Status::Ok, 0))
            .await
            .unwrap();
        store
            .append(sample_entry(t0 + chrono::Duration::seconds(1), Status::Ok, 0))
            .await
            .unwrap();

        // Manually corrupt the middle by appending a bad line via a direct write.
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"invalid json\n").await.unwrap();
        store
            .append(sample_entry(t0 + chrono::Duration::seconds(2), Status::Ok, 0))
            .await
            .unwrap();

        let results = store.query(&QueryFilter::with_limit(50)).await.unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn category_filter_uses_derived_category() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        store
            .append(sample_entry(Utc::now(), Status::Error, error_code::RUNTIME_START))
            .await
            .unwrap();
        store
            .append(sample_entry(Utc::now(), Status::Ok, 0))
            .await
            .unwrap();

        let mut filter = QueryFilter::with_limit(50);
        filter.category = Some(ErrorCategory::Runtime);
        let results = store.query(&filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, Status::Error);
    }

    #[tokio::test]
    async fn stats_match_counts_and_success_rate() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        store
            .append(sample_entry(Utc::now(), Status::Ok, 0))
            .await
            .unwrap();
        store
            .append(sample_entry(Utc::now(), Status::Ok, 0))
            .await
            .unwrap();
        store
            .append(sample_entry(Utc::now(), Status::Error, error_code::RUNTIME_START))
            .await
            .unwrap();
        store
            .append(sample_entry(Utc::now(), Status::Abort, error_code::TIMEOUT))
            .await
            .unwrap();

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_executions, 4);
        assert_eq!(stats.successful_executions, 2);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.aborted_executions, 1);
        assert_eq!(
            stats.total_executions,
            stats.successful_executions + stats.failed_executions + stats.aborted_executions
        );
        assert_eq!(stats.success_rate, 50);
    }

    #[tokio::test]
    async fn stats_on_empty_log_has_zero_success_rate() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_executions, 0);
        assert_eq!(stats.success_rate, 0);
    }

    #[tokio::test]
    async fn clear_truncates_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        store
            .append(sample_entry(Utc::now(), Status::Ok, 0))
            .await
            .unwrap();
        store.clear().await.unwrap();
        let results = store.query(&QueryFilter::with_limit(50)).await.unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn category_ranges_are_pinned() {
        assert_eq!(category_for_code(error_code::NONE), None);
        assert_eq!(category_for_code(150), Some(ErrorCategory::Syntax));
        assert_eq!(category_for_code(250), Some(ErrorCategory::Import));
        assert_eq!(category_for_code(300), Some(ErrorCategory::Runtime));
        assert_eq!(category_for_code(error_code::TIMEOUT), Some(ErrorCategory::Timeout));
        assert_eq!(category_for_code(error_code::CANCELED), Some(ErrorCategory::Canceled));
        assert_eq!(category_for_code(error_code::TRANSPORT), Some(ErrorCategory::Transport));
        assert_eq!(category_for_code(9999), Some(ErrorCategory::Other));
    }
}
