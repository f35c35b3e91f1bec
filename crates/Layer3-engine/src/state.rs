//! Durable run state
//!
//! One `TaskRecord` per task, status behind a watch channel so dependents can
//! wait without polling. Every transition rewrites `taskstate.json` in the
//! logdir so an external observer always sees the current run.

use crate::status::TaskStatus;
use chrono::{DateTime, Utc};
use conveyor_foundation::RunConfig;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::warn;

pub const STATE_FILE: &str = "taskstate.json";

/// Live status of one task within a run
pub struct TaskRecord {
    name: String,
    status: watch::Sender<TaskStatus>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl TaskRecord {
    fn new(name: String) -> Self {
        Self {
            name,
            status: watch::Sender::new(TaskStatus::Pending),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    /// Receiver for awaiting status changes without polling
    pub fn watch(&self) -> watch::Receiver<TaskStatus> {
        self.status.subscribe()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, next: TaskStatus) {
        let now = Utc::now();
        if next == TaskStatus::Running {
            *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
        }
        if next.is_terminal() {
            *self.finished_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
        }
        self.status.send_replace(next);
    }
}

/// Shared state of one run: identity plus ordered task records
pub struct RunState {
    config: RunConfig,
    tasks: Vec<Arc<TaskRecord>>,
}

impl RunState {
    pub fn new(config: RunConfig, task_names: impl IntoIterator<Item = String>) -> Arc<Self> {
        let tasks = task_names
            .into_iter()
            .map(|name| Arc::new(TaskRecord::new(name)))
            .collect();
        Arc::new(Self { config, tasks })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn tasks(&self) -> &[Arc<TaskRecord>] {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&Arc<TaskRecord>> {
        self.tasks.iter().find(|record| record.name() == name)
    }

    /// Whether every task has reached a terminal state
    pub fn finished(&self) -> bool {
        self.tasks.iter().all(|record| record.status().is_terminal())
    }

    /// Apply a status change and persist the snapshot. Persistence is
    /// best-effort: a broken logdir must not take the run down.
    pub fn transition(&self, record: &TaskRecord, next: TaskStatus) {
        record.set_status(next);
        self.save();
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            commit: self.config.commit.clone(),
            branch: self.config.branch.clone(),
            repo_name: self.config.repo_name.clone(),
            identifier: self.config.identifier.clone(),
            log_url: self.config.log_url.clone(),
            finished: self.finished(),
            tasks: self
                .tasks
                .iter()
                .map(|record| TaskSnapshot {
                    name: record.name().to_string(),
                    status: record.status(),
                    started_at: record.started_at(),
                    finished_at: record.finished_at(),
                })
                .collect(),
        }
    }

    pub fn save(&self) {
        let path = self.config.logdir.join(STATE_FILE);
        let result = serde_json::to_string_pretty(&self.snapshot())
            .map_err(std::io::Error::other)
            .and_then(|encoded| std::fs::write(&path, encoded));
        if let Err(err) = result {
            warn!("could not write {}: {}", path.display(), err);
        }
    }
}

/// Serializable view of a run, written to `taskstate.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub commit: String,
    pub branch: String,
    pub repo_name: String,
    pub identifier: String,
    pub log_url: String,
    pub finished: bool,
    pub tasks: Vec<TaskSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
