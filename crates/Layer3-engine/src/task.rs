//! Task specifications and the validated task set

use crate::context::TaskContext;
use conveyor_foundation::{Error, Result, SemaphoreRequirement};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

/// Boxed async task body; one invocation per run
pub type TaskBody = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One schedulable unit of work
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,

    /// Names of tasks that must reach a terminal state first
    pub run_after: Vec<String>,

    /// Run even when a dependency did not succeed (cleanup, reporting)
    pub run_always: bool,

    /// Acquired in declaration order before the body runs
    pub semaphores: Vec<SemaphoreRequirement>,

    pub body: TaskBody,
}

impl TaskSpec {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run_after: Vec::new(),
            run_always: false,
            semaphores: Vec::new(),
            body: Arc::new(move |ctx| Box::pin(body(ctx))),
        }
    }

    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.run_after.push(dependency.into());
        self
    }

    pub fn always(mut self) -> Self {
        self.run_always = true;
        self
    }

    pub fn semaphore(mut self, requirement: SemaphoreRequirement) -> Self {
        self.semaphores.push(requirement);
        self
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("run_after", &self.run_after)
            .field("run_always", &self.run_always)
            .field("semaphores", &self.semaphores)
            .finish_non_exhaustive()
    }
}

/// Ordered, validated collection of task specs for one run
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    tasks: Vec<TaskSpec>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: TaskSpec) {
        self.tasks.push(spec);
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Reject duplicate names, unknown or self dependencies, and cycles
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for spec in &self.tasks {
            if !names.insert(spec.name.as_str()) {
                return Err(Error::Config(format!("duplicate task name: {}", spec.name)));
            }
        }
        for spec in &self.tasks {
            for dep in &spec.run_after {
                if dep == &spec.name {
                    return Err(Error::Config(format!(
                        "task {} depends on itself",
                        spec.name
                    )));
                }
                if !names.contains(dep.as_str()) {
                    return Err(Error::Config(format!(
                        "task {} depends on unknown task {}",
                        spec.name, dep
                    )));
                }
            }
        }
        self.check_acyclic()
    }

    /// Kahn's algorithm; whatever cannot be ordered is part of a cycle
    fn check_acyclic(&self) -> Result<()> {
        let mut indegree: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|spec| (spec.name.as_str(), spec.run_after.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for spec in &self.tasks {
            for dep in &spec.run_after {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(spec.name.as_str());
            }
        }

        let mut ready: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&name, _)| name)
            .collect();
        let mut ordered = 0;
        while let Some(name) = ready.pop_front() {
            ordered += 1;
            for &dependent in dependents.get(name).into_iter().flatten() {
                let degree = indegree
                    .get_mut(dependent)
                    .ok_or_else(|| Error::Config(format!("unknown task {}", dependent)))?;
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(dependent);
                }
            }
        }

        if ordered < self.tasks.len() {
            let mut stuck: Vec<&str> = indegree
                .iter()
                .filter(|(_, &degree)| degree > 0)
                .map(|(&name, _)| name)
                .collect();
            stuck.sort_unstable();
            return Err(Error::Config(format!(
                "dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }
        Ok(())
    }
}
