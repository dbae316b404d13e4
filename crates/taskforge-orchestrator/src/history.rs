use crate::swarm::WorkflowReport;
use crate::types::TaskRecord;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use taskforge_core::{TaskforgeError, TaskforgeResult};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// One line of the history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: HistoryRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum HistoryRecord {
    Task(TaskRecord),
    Workflow(Box<WorkflowReport>),
}

/// Append-only destination for finished tasks and workflow reports.
///
/// Calls must not block; the engine never reads entries back.
pub trait HistorySink: Send + Sync {
    fn record_task(&self, record: &TaskRecord);

    fn record_report(&self, report: &WorkflowReport);
}

enum WriterMessage {
    Entry(HistoryEntry),
    Flush(oneshot::Sender<()>),
}

/// Appends entries as JSON lines from a background writer task.
pub struct JsonlHistorySink {
    tx: mpsc::UnboundedSender<WriterMessage>,
    path: PathBuf,
}

impl JsonlHistorySink {
    /// Open (or create) `path` for appending and spawn the writer.
    /// Must be called from within a tokio runtime.
    pub async fn open(path: impl Into<PathBuf>) -> TaskforgeResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<WriterMessage>();
        let log_path = path.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    WriterMessage::Entry(entry) => {
                        let line = match serde_json::to_string(&entry) {
                            Ok(line) => format!("{line}\n"),
                            Err(e) => {
                                warn!(error = %e, "Failed to serialize history entry");
                                continue;
                            }
                        };
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            warn!(path = %log_path.display(), error = %e, "Failed to append history entry");
                        }
                    }
                    WriterMessage::Flush(done) => {
                        if let Err(e) = file.flush().await {
                            warn!(path = %log_path.display(), error = %e, "Failed to flush history log");
                        }
                        let _ = done.send(());
                    }
                }
            }
            debug!(path = %log_path.display(), "History writer stopped");
        });

        Ok(Self { tx, path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Wait until every entry sent so far has been written.
    pub async fn flush(&self) -> TaskforgeResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterMessage::Flush(done_tx))
            .map_err(|_| TaskforgeError::Io(std::io::Error::other("history writer stopped")))?;
        done_rx
            .await
            .map_err(|_| TaskforgeError::Io(std::io::Error::other("history writer stopped")))
    }

    fn send(&self, record: HistoryRecord) {
        let entry = HistoryEntry {
            recorded_at: Utc::now(),
            record,
        };
        if self.tx.send(WriterMessage::Entry(entry)).is_err() {
            warn!(path = %self.path.display(), "History writer is gone; entry dropped");
        }
    }
}

impl HistorySink for JsonlHistorySink {
    fn record_task(&self, record: &TaskRecord) {
        self.send(HistoryRecord::Task(record.clone()));
    }

    fn record_report(&self, report: &WorkflowReport) {
        self.send(HistoryRecord::Workflow(Box::new(report.clone())));
    }
}

/// Keeps entries in memory. Useful for embedding and tests.
#[derive(Default)]
pub struct MemoryHistorySink {
    entries: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<HistoryRecord> {
        self.entries.lock().clone()
    }

    pub fn task_records(&self) -> Vec<TaskRecord> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| match e {
                HistoryRecord::Task(r) => Some(r.clone()),
                HistoryRecord::Workflow(_) => None,
            })
            .collect()
    }

    pub fn reports(&self) -> Vec<WorkflowReport> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| match e {
                HistoryRecord::Workflow(r) => Some((**r).clone()),
                HistoryRecord::Task(_) => None,
            })
            .collect()
    }
}

impl HistorySink for MemoryHistorySink {
    fn record_task(&self, record: &TaskRecord) {
        self.entries.lock().push(HistoryRecord::Task(record.clone()));
    }

    fn record_report(&self, report: &WorkflowReport) {
        self.entries
            .lock()
            .push(HistoryRecord::Workflow(Box::new(report.clone())));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{SubmitRequest, Task};

    fn record() -> TaskRecord {
        TaskRecord::from(&Task::from_request(SubmitRequest::new("echo"), 0))
    }

    #[tokio::test]
    async fn test_jsonl_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("history.jsonl");
        let sink = JsonlHistorySink::open(&path).await.unwrap();
        let first = record();
        sink.record_task(&first);
        sink.record_task(&record());
        sink.flush().await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: HistoryEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.record, HistoryRecord::Task(first));
        let raw: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(raw["record"], "task");
        assert_eq!(raw["kind"], "echo");
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        for _ in 0..2 {
            let sink = JsonlHistorySink::open(&path).await.unwrap();
            sink.record_task(&record());
            sink.flush().await.unwrap();
        }
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemoryHistorySink::new();
        sink.record_task(&record());
        assert_eq!(sink.task_records().len(), 1);
        assert!(sink.reports().is_empty());
    }
}
