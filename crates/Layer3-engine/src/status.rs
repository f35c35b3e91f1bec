//! Task lifecycle states
//!
//! `Pending → WaitingForDependencies → {Skipped | WaitingForSemaphore} →
//! Running → {Success | Failed | Skipped}`. Terminal states never change.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    WaitingForDependencies,
    WaitingForSemaphore,
    Running,
    Success,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::WaitingForDependencies => "waiting for dependencies",
            Self::WaitingForSemaphore => "waiting for semaphore",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(label)
    }
}
