//! TOML pipeline to task set
//!
//! Every configured task becomes a spec whose body opens the configured
//! executor, runs the command, and tears the session down whether or not the
//! command succeeded.

use conveyor_engine::{TaskContext, TaskSet, TaskSpec};
use conveyor_exec::{ExecOptions, Executor};
use conveyor_foundation::{ExecutorBackend, PipelineConfig, Result, TaskConfig};

pub fn build_task_set(pipeline: &PipelineConfig) -> Result<TaskSet> {
    pipeline.validate()?;
    let mut set = TaskSet::new();
    for task in &pipeline.tasks {
        set.add(task_spec(task));
    }
    set.validate()?;
    Ok(set)
}

fn task_spec(config: &TaskConfig) -> TaskSpec {
    let body_config = config.clone();
    let mut spec = TaskSpec::new(&config.name, move |ctx| {
        let config = body_config.clone();
        async move { run_configured(config, ctx).await }
    });
    for dependency in &config.run_after {
        spec = spec.after(dependency.clone());
    }
    if config.run_always {
        spec = spec.always();
    }
    for requirement in &config.semaphores {
        spec = spec.semaphore(requirement.clone());
    }
    spec
}

fn exec_options(config: &TaskConfig) -> ExecOptions {
    match &config.workdir {
        Some(dir) => ExecOptions::at(dir.clone()),
        None => ExecOptions::temp(),
    }
}

async fn run_configured(config: TaskConfig, ctx: TaskContext) -> Result<()> {
    let options = exec_options(&config);
    match config.executor {
        ExecutorBackend::Local => {
            let session = ctx.local(options).await?;
            run_in(&session, &config.command).await
        }
        ExecutorBackend::Container => {
            // validate() guarantees an image for the container backend
            let image = config.image.as_deref().unwrap_or_default();
            let session = ctx.container(image, options, false).await?;
            run_in(&session, &config.command).await
        }
        ExecutorBackend::Ssh => {
            let host = config.host.as_deref().unwrap_or_default();
            let session = ctx.ssh(host, options).await?;
            run_in(&session, &config.command).await
        }
    }
}

async fn run_in(session: &dyn Executor, command: &str) -> Result<()> {
    let outcome = session.sh(command).await.map(drop);
    let closed = session.close().await;
    outcome?;
    closed
}
