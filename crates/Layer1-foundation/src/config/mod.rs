//! Run and pipeline configuration
//!
//! A run is identified by `RunConfig` (commit, branch, identifier, logdir).
//! The task graph itself is either built in code against the engine API or
//! loaded from a `conveyor.toml` pipeline file (`PipelineConfig`).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default pipeline file name
pub const PIPELINE_FILE: &str = "conveyor.toml";

// ============================================================================
// Run identity
// ============================================================================

/// Immutable identifying fields for one run of the task graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Commit sha under test
    #[serde(default)]
    pub commit: String,

    /// Branch name
    #[serde(default)]
    pub branch: String,

    /// Repository name
    #[serde(default)]
    pub repo_name: String,

    /// Arbitrary unique identifier for the run
    #[serde(default)]
    pub identifier: String,

    /// URL where this run's log can be viewed (forwarded to status hooks)
    #[serde(default)]
    pub log_url: String,

    /// Directory for the state snapshot and the aggregated output log
    #[serde(default = "default_logdir")]
    pub logdir: PathBuf,
}

fn default_logdir() -> PathBuf {
    PathBuf::from(".")
}

// ============================================================================
// Pipeline definition
// ============================================================================

/// Which execution environment a configured task runs against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorBackend {
    /// Child process on the scheduler host
    Local,
    /// Ephemeral Docker container
    Container,
    /// Remote host over key-authenticated ssh
    Ssh,
}

impl Default for ExecutorBackend {
    fn default() -> Self {
        Self::Local
    }
}

/// One semaphore requirement declared by a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemaphoreRequirement {
    /// Queue storage location: a local path or `host:path`
    pub key: String,

    /// Total capacity used when the queue file is first created
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Weight of this claim against the capacity
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_capacity() -> u32 {
    1
}

fn default_weight() -> u32 {
    1
}

/// One task in a TOML-defined pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task name, unique within the pipeline
    pub name: String,

    /// Shell command to run
    pub command: String,

    /// Execution backend
    #[serde(default)]
    pub executor: ExecutorBackend,

    /// Container image (container backend)
    #[serde(default)]
    pub image: Option<String>,

    /// Target host (ssh backend)
    #[serde(default)]
    pub host: Option<String>,

    /// Working directory inside the execution environment
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// Tasks that must be terminal before this one starts
    #[serde(default)]
    pub run_after: Vec<String>,

    /// Run even if a dependency failed or was skipped
    #[serde(default)]
    pub run_always: bool,

    /// Semaphores to hold while the body runs, acquired in declaration order
    #[serde(default)]
    pub semaphores: Vec<SemaphoreRequirement>,
}

/// A full TOML pipeline: `[[task]]` entries in file order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskConfig>,
}

impl PipelineConfig {
    /// Load and validate a pipeline file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check name uniqueness, dependency resolution and backend fields
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for task in &self.tasks {
            if task.name.is_empty() {
                return Err(Error::Config("task with empty name".to_string()));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(Error::Config(format!("duplicate task name: {}", task.name)));
            }
        }
        for task in &self.tasks {
            for dep in &task.run_after {
                if !seen.contains(dep.as_str()) {
                    return Err(Error::Config(format!(
                        "task {} depends on unknown task: {}",
                        task.name, dep
                    )));
                }
                if dep == &task.name {
                    return Err(Error::Config(format!("task {} depends on itself", task.name)));
                }
            }
            match task.executor {
                ExecutorBackend::Container if task.image.is_none() => {
                    return Err(Error::Config(format!(
                        "task {} uses the container backend but sets no image",
                        task.name
                    )));
                }
                ExecutorBackend::Ssh if task.host.is_none() => {
                    return Err(Error::Config(format!(
                        "task {} uses the ssh backend but sets no host",
                        task.name
                    )));
                }
                _ => {}
            }
            for requirement in &task.semaphores {
                if requirement.capacity == 0 {
                    return Err(Error::Config(format!(
                        "task {}: semaphore {} has zero capacity",
                        task.name, requirement.key
                    )));
                }
                if requirement.weight > requirement.capacity {
                    return Err(Error::Config(format!(
                        "task {}: semaphore {} weight {} exceeds capacity {}",
                        task.name, requirement.key, requirement.weight, requirement.capacity
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<PipelineConfig> {
        let config: PipelineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_parse_minimal_pipeline() {
        let config = parse(
            r#"
            [[task]]
            name = "build"
            command = "make build"

            [[task]]
            name = "test"
            command = "make test"
            run_after = ["build"]
            "#,
        )
        .unwrap();
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[1].run_after, vec!["build"]);
        assert_eq!(config.tasks[0].executor, ExecutorBackend::Local);
    }

    #[test]
    fn test_container_requires_image() {
        let err = parse(
            r#"
            [[task]]
            name = "test"
            command = "make test"
            executor = "container"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = parse(
            r#"
            [[task]]
            name = "test"
            command = "make test"
            run_after = ["build"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown task"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = parse(
            r#"
            [[task]]
            name = "a"
            command = "true"

            [[task]]
            name = "a"
            command = "false"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PIPELINE_FILE);
        std::fs::write(
            &path,
            r#"
            [[task]]
            name = "build"
            command = "make"
            "#,
        )
        .unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.tasks[0].name, "build");

        let missing = PipelineConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(Error::Io(_))));
    }

    #[test]
    fn test_semaphore_requirement_defaults() {
        let config = parse(
            r#"
            [[task]]
            name = "deploy"
            command = "make deploy"
            semaphores = [{ key = "deploy-slot" }]
            "#,
        )
        .unwrap();
        let requirement = &config.tasks[0].semaphores[0];
        assert_eq!(requirement.capacity, 1);
        assert_eq!(requirement.weight, 1);
    }

    #[test]
    fn test_semaphore_weight_must_fit_capacity() {
        let err = parse(
            r#"
            [[task]]
            name = "deploy"
            command = "make deploy"
            semaphores = [{ key = "deploy-slot", capacity = 2, weight = 3 }]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds capacity"));
    }
}
