//! Per-task execution context
//!
//! Handed to every task body. Executor sessions opened through the context
//! are bound to the task's log stream and the run's kill signal, so output
//! attribution and cancellation need no extra plumbing in task code.

use crate::state::RunState;
use crate::status::TaskStatus;
use conveyor_exec::{Container, ExecOptions, KillSignal, Local, Ssh, TaskLogger};
use conveyor_foundation::{Error, Result, RunConfig, SemaphoreRequirement};
use conveyor_semaphore::{QueuePath, Semaphore, SemaphoreOptions, SemaphoreTicket};
use std::sync::Arc;

#[derive(Clone)]
pub struct TaskContext {
    state: Arc<RunState>,
    log: TaskLogger,
    kill: KillSignal,
    task: String,
}

impl TaskContext {
    pub(crate) fn new(
        state: Arc<RunState>,
        log: TaskLogger,
        kill: KillSignal,
        task: String,
    ) -> Self {
        Self {
            state,
            log,
            kill,
            task,
        }
    }

    pub fn task_name(&self) -> &str {
        &self.task
    }

    pub fn log(&self) -> &TaskLogger {
        &self.log
    }

    pub fn kill(&self) -> &KillSignal {
        &self.kill
    }

    pub fn run_config(&self) -> &RunConfig {
        self.state.config()
    }

    /// Current status of another task. Dependencies declared via `run_after`
    /// are guaranteed terminal by the time the body runs.
    pub fn status_of(&self, name: &str) -> Option<TaskStatus> {
        self.state.task(name).map(|record| record.status())
    }

    /// Error value marking this task as voluntarily skipped
    pub fn skip(&self, reason: impl Into<String>) -> Error {
        Error::Skipped(reason.into())
    }

    /// Shell session on the scheduler host
    pub async fn local(&self, options: ExecOptions) -> Result<Local> {
        Local::open(options, self.log.clone(), self.kill.clone()).await
    }

    /// Session inside a fresh container from `image`
    pub async fn container(
        &self,
        image: &str,
        options: ExecOptions,
        mount_docker: bool,
    ) -> Result<Container> {
        Container::start(image, options, mount_docker, self.log.clone(), self.kill.clone()).await
    }

    /// Session on a remote host
    pub async fn ssh(&self, host: &str, options: ExecOptions) -> Result<Ssh> {
        Ssh::connect(host, options, self.log.clone(), self.kill.clone()).await
    }

    /// Ad-hoc semaphore acquisition from inside a task body
    pub async fn acquire(&self, requirement: &SemaphoreRequirement) -> Result<SemaphoreTicket> {
        let semaphore = Semaphore::new(
            QueuePath::parse(&requirement.key),
            semaphore_options(self.state.config(), &self.task, requirement),
        );
        semaphore.acquire(&self.log, &self.kill).await
    }
}

/// Queue entry description: enough for `conveyor queue` to say who is holding
pub(crate) fn semaphore_options(
    config: &RunConfig,
    task: &str,
    requirement: &SemaphoreRequirement,
) -> SemaphoreOptions {
    let description = if config.identifier.is_empty() {
        task.to_string()
    } else {
        format!("{} {}", config.identifier, task)
    };
    SemaphoreOptions::new(description)
        .capacity(requirement.capacity)
        .weight(requirement.weight)
}
