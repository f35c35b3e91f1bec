//! Dependency-ordered task execution
//!
//! Every task gets its own tokio task at launch. Each unit waits for its
//! dependencies to reach a terminal state over watch channels, applies the
//! skip rule, acquires declared semaphores in declaration order, runs the
//! body, and records the outcome. Ordering therefore falls out of the waits
//! rather than out of a central dispatch loop.

use crate::context::{semaphore_options, TaskContext};
use crate::state::{RunState, StateSnapshot, TaskRecord};
use crate::status::TaskStatus;
use crate::task::{TaskSet, TaskSpec};
use conveyor_exec::{KillSignal, RunLog, TaskLogger};
use conveyor_foundation::{Error, Result, RunConfig};
use conveyor_semaphore::{QueuePath, Semaphore};
use std::sync::Arc;
use tracing::warn;

/// Outcome of a whole run
#[derive(Debug, Clone)]
pub struct RunReport {
    snapshot: StateSnapshot,
}

impl RunReport {
    /// The run succeeds iff every task ended `Success` or `Skipped`
    pub fn success(&self) -> bool {
        self.snapshot
            .tasks
            .iter()
            .all(|task| matches!(task.status, TaskStatus::Success | TaskStatus::Skipped))
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }
}

pub struct Scheduler {
    set: TaskSet,
    state: Arc<RunState>,
    log: Arc<RunLog>,
    kill: KillSignal,
}

impl Scheduler {
    pub fn new(
        set: TaskSet,
        config: RunConfig,
        log: Arc<RunLog>,
        kill: KillSignal,
    ) -> Result<Self> {
        set.validate()?;
        let state = RunState::new(config, set.tasks().iter().map(|spec| spec.name.clone()));
        Ok(Self {
            set,
            state,
            log,
            kill,
        })
    }

    /// Shared run state, for observers outside the scheduler
    pub fn state(&self) -> Arc<RunState> {
        Arc::clone(&self.state)
    }

    pub async fn run(self) -> RunReport {
        self.state.save();

        let mut units = Vec::with_capacity(self.set.len());
        for spec in self.set.tasks() {
            let logger = self.log.logger(&spec.name);
            units.push((
                spec.name.clone(),
                tokio::spawn(drive(
                    spec.clone(),
                    Arc::clone(&self.state),
                    logger,
                    self.kill.clone(),
                )),
            ));
        }

        for (name, unit) in units {
            if unit.await.is_err() {
                // A panicked body must not leave its record non-terminal
                if let Some(record) = self.state.task(&name) {
                    if !record.status().is_terminal() {
                        warn!("task {} panicked", name);
                        self.state.transition(record, TaskStatus::Failed);
                    }
                }
            }
        }

        self.state.save();
        RunReport {
            snapshot: self.state.snapshot(),
        }
    }
}

async fn drive(spec: TaskSpec, state: Arc<RunState>, logger: TaskLogger, kill: KillSignal) {
    let record = match state.task(&spec.name) {
        Some(record) => Arc::clone(record),
        None => return,
    };
    state.transition(&record, TaskStatus::WaitingForDependencies);

    let mut unsatisfied: Option<String> = None;
    for dep_name in &spec.run_after {
        let dep = match state.task(dep_name) {
            Some(dep) => Arc::clone(dep),
            None => {
                unsatisfied.get_or_insert_with(|| dep_name.clone());
                continue;
            }
        };
        match wait_terminal(&dep, &kill).await {
            Some(status) => {
                if !status.is_success() {
                    unsatisfied.get_or_insert_with(|| dep_name.clone());
                }
            }
            None => {
                logger.line("Cancelled");
                state.transition(&record, TaskStatus::Failed);
                return;
            }
        }
    }

    if kill.is_killed() {
        logger.line("Cancelled");
        state.transition(&record, TaskStatus::Failed);
        return;
    }

    // Skipped and Failed dependencies both propagate as a skip
    if let Some(dep_name) = unsatisfied {
        if !spec.run_always {
            let reason = Error::DependencyNotSatisfied(dep_name);
            logger.line(format!("Task skipped: {}", reason));
            state.transition(&record, TaskStatus::Skipped);
            return;
        }
    }

    let mut tickets = Vec::with_capacity(spec.semaphores.len());
    if !spec.semaphores.is_empty() {
        state.transition(&record, TaskStatus::WaitingForSemaphore);
        for requirement in &spec.semaphores {
            let semaphore = Semaphore::new(
                QueuePath::parse(&requirement.key),
                semaphore_options(state.config(), &spec.name, requirement),
            );
            match semaphore.acquire(&logger, &kill).await {
                Ok(ticket) => tickets.push(ticket),
                Err(Error::Cancelled) => {
                    logger.line("Cancelled");
                    state.transition(&record, TaskStatus::Failed);
                    return;
                }
                Err(err) => {
                    logger.line(format!("Task failed: {}", err));
                    state.transition(&record, TaskStatus::Failed);
                    return;
                }
            }
        }
    }

    state.transition(&record, TaskStatus::Running);
    logger.line("Task started");

    let context = TaskContext::new(
        Arc::clone(&state),
        logger.clone(),
        kill.clone(),
        spec.name.clone(),
    );
    let outcome = (spec.body)(context).await;

    for ticket in tickets {
        if let Err(err) = ticket.release().await {
            warn!("semaphore release for task {} failed: {}", spec.name, err);
        }
    }

    match outcome {
        Ok(()) => {
            logger.line("Task success");
            state.transition(&record, TaskStatus::Success);
        }
        Err(err) if err.is_skip() => {
            logger.line(format!("Task skipped: {}", err));
            state.transition(&record, TaskStatus::Skipped);
        }
        Err(err) => {
            logger.line(format!("Task failed: {}", err));
            state.transition(&record, TaskStatus::Failed);
        }
    }
}

/// Wait until `dep` is terminal; `None` means the kill signal fired first
async fn wait_terminal(dep: &TaskRecord, kill: &KillSignal) -> Option<TaskStatus> {
    let mut watcher = dep.watch();
    loop {
        let status = *watcher.borrow_and_update();
        if status.is_terminal() {
            return Some(status);
        }
        tokio::select! {
            changed = watcher.changed() => {
                if changed.is_err() {
                    let last = *watcher.borrow();
                    return last.is_terminal().then_some(last);
                }
            }
            _ = kill.wait() => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use conveyor_foundation::SemaphoreRequirement;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn config(logdir: &std::path::Path) -> RunConfig {
        RunConfig {
            commit: "deadbeef".to_string(),
            branch: "main".to_string(),
            repo_name: "demo".to_string(),
            identifier: "run-1".to_string(),
            log_url: String::new(),
            logdir: logdir.to_path_buf(),
        }
    }

    fn recording(name: &str, order: &Arc<Mutex<Vec<String>>>) -> TaskSpec {
        let order = Arc::clone(order);
        let task = name.to_string();
        TaskSpec::new(name, move |_ctx| {
            let order = Arc::clone(&order);
            let task = task.clone();
            async move {
                order.lock().unwrap().push(task);
                Ok(())
            }
        })
    }

    async fn run(set: TaskSet, logdir: &std::path::Path) -> RunReport {
        Scheduler::new(set, config(logdir), RunLog::new(), KillSignal::new())
            .unwrap()
            .run()
            .await
    }

    fn index_of(order: &[String], name: &str) -> usize {
        order
            .iter()
            .position(|entry| entry == name)
            .unwrap_or_else(|| panic!("{} never ran", name))
    }

    #[tokio::test]
    async fn test_dependencies_run_first() {
        let dir = tempfile::tempdir().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut set = TaskSet::new();
        set.add(recording("a", &order));
        set.add(recording("b", &order).after("a"));
        set.add(recording("c", &order).after("b"));
        set.add(recording("d", &order).after("c"));
        set.add(recording("e", &order).after("c"));
        set.add(recording("f", &order).after("c"));
        set.add(recording("g", &order).after("c"));
        set.add(
            recording("h", &order)
                .after("d")
                .after("e")
                .after("f")
                .after("g"),
        );

        let report = run(set, dir.path()).await;
        assert!(report.success());

        let order = order.lock().unwrap();
        assert_eq!(order.len(), 8);
        assert!(index_of(&order, "a") < index_of(&order, "b"));
        assert!(index_of(&order, "b") < index_of(&order, "c"));
        for fanned in ["d", "e", "f", "g"] {
            assert!(index_of(&order, "c") < index_of(&order, fanned));
            assert!(index_of(&order, fanned) < index_of(&order, "h"));
        }
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_except_run_always() {
        let dir = tempfile::tempdir().unwrap();
        let ran_cleanup = Arc::new(AtomicUsize::new(0));

        let mut set = TaskSet::new();
        set.add(TaskSpec::new("broken", |_ctx| async {
            Err(Error::Task("boom".to_string()))
        }));
        set.add(TaskSpec::new("dependent", |_ctx| async { Ok(()) }).after("broken"));
        let counter = Arc::clone(&ran_cleanup);
        set.add(
            TaskSpec::new("cleanup", move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .after("broken")
            .always(),
        );

        let scheduler =
            Scheduler::new(set, config(dir.path()), RunLog::new(), KillSignal::new()).unwrap();
        let state = scheduler.state();
        let report = scheduler.run().await;

        assert!(!report.success());
        assert_eq!(state.task("broken").unwrap().status(), TaskStatus::Failed);
        assert_eq!(
            state.task("dependent").unwrap().status(),
            TaskStatus::Skipped
        );
        assert_eq!(state.task("cleanup").unwrap().status(), TaskStatus::Success);
        assert_eq!(ran_cleanup.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_voluntary_skip_propagates_but_run_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();

        let mut set = TaskSet::new();
        set.add(TaskSpec::new("optional", |ctx| async move {
            Err(ctx.skip("nothing to do"))
        }));
        set.add(TaskSpec::new("downstream", |_ctx| async { Ok(()) }).after("optional"));

        let scheduler =
            Scheduler::new(set, config(dir.path()), RunLog::new(), KillSignal::new()).unwrap();
        let state = scheduler.state();
        let report = scheduler.run().await;

        assert!(report.success());
        assert_eq!(state.task("optional").unwrap().status(), TaskStatus::Skipped);
        assert_eq!(
            state.task("downstream").unwrap().status(),
            TaskStatus::Skipped
        );
    }

    #[tokio::test]
    async fn test_semaphore_serializes_contenders() {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("q");
        let requirement = SemaphoreRequirement {
            key: queue.display().to_string(),
            capacity: 1,
            weight: 1,
        };

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut set = TaskSet::new();
        for name in ["left", "right"] {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            set.add(
                TaskSpec::new(name, move |_ctx| {
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .semaphore(requirement.clone()),
            );
        }

        let report = run(set, dir.path()).await;
        assert!(report.success());
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        let state = conveyor_semaphore::read_queue(&QueuePath::parse(
            &queue.display().to_string(),
        ))
        .await
        .unwrap();
        assert!(state.queue.is_empty());
    }

    #[tokio::test]
    async fn test_kill_fails_running_and_waiting_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let kill = KillSignal::new();

        let mut set = TaskSet::new();
        set.add(TaskSpec::new("slow", |ctx| async move {
            ctx.kill().wait().await;
            Err(Error::Cancelled)
        }));
        set.add(TaskSpec::new("blocked", |_ctx| async { Ok(()) }).after("slow"));

        let scheduler =
            Scheduler::new(set, config(dir.path()), RunLog::new(), kill.clone()).unwrap();
        let state = scheduler.state();
        let running = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        kill.kill();
        let report = running.await.unwrap();

        assert!(!report.success());
        assert_eq!(state.task("slow").unwrap().status(), TaskStatus::Failed);
        assert_eq!(state.task("blocked").unwrap().status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_log_carries_lifecycle_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new();

        let mut set = TaskSet::new();
        set.add(TaskSpec::new("only", |_ctx| async { Ok(()) }));
        let report = Scheduler::new(set, config(dir.path()), Arc::clone(&log), KillSignal::new())
            .unwrap()
            .run()
            .await;
        assert!(report.success());

        let lines: Vec<String> = log.lines().iter().map(|line| line.line.clone()).collect();
        assert!(lines.contains(&"Task started".to_string()));
        assert!(lines.contains(&"Task success".to_string()));
    }

    #[tokio::test]
    async fn test_final_snapshot_is_finished() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = TaskSet::new();
        set.add(TaskSpec::new("one", |_ctx| async { Ok(()) }));
        set.add(TaskSpec::new("two", |_ctx| async { Ok(()) }).after("one"));
        let report = run(set, dir.path()).await;
        assert!(report.success());

        let raw = std::fs::read_to_string(dir.path().join(crate::state::STATE_FILE)).unwrap();
        let snapshot: StateSnapshot = serde_json::from_str(&raw).unwrap();
        assert!(snapshot.finished);
        assert!(snapshot
            .tasks
            .iter()
            .all(|task| task.status == TaskStatus::Success));
    }
}
