//! Per-function file logging sink.
//!
//! Records land in UTF-8 text files under the function's log directory,
//! one file per UTC day, oldest files pruned past a fixed retention cap.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::sinks::{SinkError, TraceSink};
use crate::trace::{TraceLevel, TraceRecord};

/// Timestamp prefix for log lines, ISO-8601 UTC with millisecond precision.
pub(crate) const LINE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// How many daily files are kept per function, including the current one.
pub const DEFAULT_MAX_LOG_FILES: usize = 5;

/// Appends trace records to `{directory}/{YYYY-MM-DD}.log`.
pub struct FileSink {
    directory: PathBuf,
    level: TraceLevel,
    max_log_files: usize,
    last_rotation: Mutex<Option<NaiveDate>>,
}

impl FileSink {
    /// Creates a sink writing beneath `directory`, keeping records at or
    /// below `level`.
    pub fn new(directory: impl Into<PathBuf>, level: TraceLevel) -> Self {
        Self {
            directory: directory.into(),
            level,
            max_log_files: DEFAULT_MAX_LOG_FILES,
            last_rotation: Mutex::new(None),
        }
    }

    /// Overrides the retention cap (minimum 1, the current file).
    pub fn with_retention(mut self, max_log_files: usize) -> Self {
        self.max_log_files = max_log_files.max(1);
        self
    }

    pub fn directory(&self) -> &std::path::Path {
        &self.directory
    }

    fn file_path(&self, day: NaiveDate) -> PathBuf {
        self.directory.join(format!("{}.log", day.format("%Y-%m-%d")))
    }

    /// Removes the oldest daily files so that `day`'s file fits within the
    /// retention cap. Prune failures are logged and do not fail the flush.
    async fn prune_old_files(&self, day: NaiveDate) {
        let today_name = format!("{}.log", day.format("%Y-%m-%d"));

        let mut names = Vec::new();
        match tokio::fs::read_dir(&self.directory).await {
            Ok(mut entries) => {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.ends_with(".log") && name != today_name {
                        names.push(name);
                    }
                }
            }
            Err(err) => {
                tracing::debug!(directory = %self.directory.display(), error = %err,
                    "Failed to enumerate log directory for pruning");
                return;
            }
        }

        // Daily names sort chronologically; drop the oldest beyond the cap.
        names.sort();
        let keep = self.max_log_files.saturating_sub(1);
        if names.len() <= keep {
            return;
        }

        for name in names.drain(..names.len() - keep) {
            let path = self.directory.join(&name);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = %path.display(), error = %err,
                    "Failed to prune rotated log file");
            }
        }
    }
}

#[async_trait]
impl TraceSink for FileSink {
    async fn flush_batch(&self, records: &[TraceRecord]) -> Result<(), SinkError> {
        let kept: Vec<&TraceRecord> = records
            .iter()
            .filter(|r| r.level != TraceLevel::Off && r.level <= self.level)
            .collect();
        if kept.is_empty() {
            return Ok(());
        }

        let today = Utc::now().date_naive();

        tokio::fs::create_dir_all(&self.directory).await?;
        {
            let mut last = self.last_rotation.lock().await;
            if *last != Some(today) {
                self.prune_old_files(today).await;
                *last = Some(today);
            }
        }

        let mut text = String::new();
        for record in kept {
            text.push_str(&format!(
                "{} [{}] {}\n",
                record.timestamp.format(LINE_TIMESTAMP_FORMAT),
                record.level,
                record.message
            ));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path(today))
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }
}
