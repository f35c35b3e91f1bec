//! Run log - per-task attributed output stream
//!
//! Every line a task emits (command echoes, command output, lifecycle
//! messages) is tagged with the task identity, appended to the run-wide
//! ordered log, broadcast to live followers and optionally mirrored to
//! `output.log` in the logdir.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::warn;

/// Broadcast channel capacity for live followers
const BROADCAST_CAPACITY: usize = 1024;

/// A single attributed log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Emission time
    pub timestamp: DateTime<Utc>,

    /// Task the line belongs to
    pub task: String,

    /// Line content, without trailing newline
    pub line: String,
}

impl LogLine {
    pub fn new(task: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            task: task.into(),
            line: line.into(),
        }
    }

    /// Render in the on-disk format: `<timestamp> <task padded> <line>`
    pub fn render(&self) -> String {
        format!(
            "{} {:<20} {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.6f"),
            self.task,
            self.line
        )
    }
}

/// Append-only log for one run
pub struct RunLog {
    lines: Mutex<Vec<LogLine>>,
    tx: broadcast::Sender<LogLine>,
    file: Option<Mutex<File>>,
}

impl RunLog {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            lines: Mutex::new(Vec::new()),
            tx,
            file: None,
        })
    }

    /// Create a run log that also appends rendered lines to
    /// `<logdir>/output.log`.
    pub fn with_file(logdir: &Path) -> std::io::Result<Arc<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logdir.join("output.log"))?;
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Arc::new(Self {
            lines: Mutex::new(Vec::new()),
            tx,
            file: Some(Mutex::new(file)),
        }))
    }

    /// Per-task handle tagging every line with the task identity
    pub fn logger(self: &Arc<Self>, task: impl Into<String>) -> TaskLogger {
        TaskLogger {
            run: Arc::clone(self),
            task: task.into(),
        }
    }

    /// Follow lines as they are appended
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }

    /// All lines appended so far, in emission order
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn append(&self, entry: LogLine) {
        if let Some(file) = &self.file {
            // A logger that panicked mid-append must not take the whole run
            // log down with it
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writeln!(file, "{}", entry.render()) {
                warn!("failed to append to output.log: {}", e);
            }
        }
        let _ = self.tx.send(entry.clone());
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }
}

/// Cloneable per-task logging handle
#[derive(Clone)]
pub struct TaskLogger {
    run: Arc<RunLog>,
    task: String,
}

impl TaskLogger {
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Append one or more lines under this task's identity.
    ///
    /// Multi-line input is split, carriage returns are scrubbed (apt-get
    /// style progress output) and blank lines are dropped.
    pub fn line(&self, content: impl AsRef<str>) {
        for raw in content.as_ref().lines() {
            let line = raw.replace('\r', "");
            if line.trim().is_empty() {
                continue;
            }
            self.run.append(LogLine::new(&self.task, line));
        }
    }

    /// The run log this handle feeds
    pub fn run_log(&self) -> Arc<RunLog> {
        Arc::clone(&self.run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_attributed_and_ordered() {
        let log = RunLog::new();
        let a = log.logger("build");
        let b = log.logger("test");
        a.line("first");
        b.line("second");
        a.line("third");

        let lines = log.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].task, "build");
        assert_eq!(lines[1].task, "test");
        assert_eq!(lines[2].task, "build");
        assert_eq!(lines[2].line, "third");
    }

    #[test]
    fn test_multiline_and_carriage_returns() {
        let log = RunLog::new();
        let logger = log.logger("apt");
        logger.line("one\rtwo\nthree\n\n");

        let lines = log.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line, "onetwo");
        assert_eq!(lines[1].line, "three");
    }

    #[tokio::test]
    async fn test_follower_receives_appends() {
        let log = RunLog::new();
        let mut rx = log.subscribe();
        log.logger("task").line("hello");
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.task, "task");
        assert_eq!(entry.line, "hello");
    }

    #[test]
    fn test_log_survives_poisoned_lock() {
        let log = RunLog::new();
        log.logger("task").line("before");

        let poisoner = Arc::clone(&log);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lines.lock().unwrap();
            panic!("poison the log lock");
        })
        .join();

        log.logger("task").line("after");
        let lines = log.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].line, "after");
    }

    #[test]
    fn test_file_sink_appends_rendered_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::with_file(dir.path()).unwrap();
        log.logger("build").line("compiled");

        let raw = std::fs::read_to_string(dir.path().join("output.log")).unwrap();
        assert!(raw.contains("build"));
        assert!(raw.contains("compiled"));
    }
}
