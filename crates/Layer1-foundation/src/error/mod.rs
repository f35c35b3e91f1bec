//! Error types for Conveyor
//!
//! All errors across the workspace flow through this single enum so that
//! the scheduler can map a task body's failure onto a terminal status
//! without downcasting.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Conveyor error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Executor
    // ========================================================================
    /// The execution environment could not be prepared (container failed to
    /// start, ssh connection failed, temp dir could not be created).
    #[error("Executor setup failed: {0}")]
    Setup(String),

    /// A command run through an executor exited non-zero.
    #[error("Exit code: {exit_code}")]
    Command { exit_code: i32 },

    // ========================================================================
    // Task outcomes
    // ========================================================================
    /// A task body explicitly opted out. Maps to `Skipped`, not `Failed`.
    #[error("Task skipped: {0}")]
    Skipped(String),

    /// A dependency did not reach `Success`. Internal skip signal computed by
    /// the scheduler, never surfaced as a run failure on its own.
    #[error("Dependent task did not succeed: {0}")]
    DependencyNotSatisfied(String),

    #[error("Task error: {0}")]
    Task(String),

    // ========================================================================
    // Semaphore queue
    // ========================================================================
    /// Queue storage unreachable after retries.
    #[error("Semaphore unavailable: {0}")]
    SemaphoreUnavailable(String),

    /// Queue state did not parse. Never auto-repaired.
    #[error("Semaphore queue corrupt: {0}")]
    SemaphoreCorrupt(String),

    // ========================================================================
    // Cancellation
    // ========================================================================
    /// External kill request terminated the run.
    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // External error conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error is the explicit voluntary-skip signal.
    pub fn is_skip(&self) -> bool {
        matches!(self, Error::Skipped(_) | Error::DependencyNotSatisfied(_))
    }
}
