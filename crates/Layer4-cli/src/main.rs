//! Conveyor CLI - main entry point

mod pipeline;

use clap::{Parser, Subcommand};
use conveyor_engine::Scheduler;
use conveyor_exec::{KillSignal, RunLog};
use conveyor_foundation::{PipelineConfig, RunConfig, PIPELINE_FILE};
use conveyor_semaphore::{read_queue, QueuePath};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Conveyor - dependency-ordered task runner
#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline described by a TOML file
    Run {
        /// Pipeline definition
        #[arg(short, long, default_value = PIPELINE_FILE)]
        file: PathBuf,

        /// Commit sha under test
        #[arg(long, default_value = "")]
        commit: String,

        /// Branch name
        #[arg(long, default_value = "")]
        branch: String,

        /// Repository name
        #[arg(long, default_value = "")]
        repo_name: String,

        /// Unique identifier for this run
        #[arg(long, default_value = "")]
        identifier: String,

        /// URL where this run's log can be viewed
        #[arg(long, default_value = "")]
        log_url: String,

        /// Directory for taskstate.json and output.log
        #[arg(long, default_value = ".")]
        logdir: PathBuf,
    },
    /// Print the state of a semaphore queue
    Queue {
        /// Local path or host:path
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match args.command {
        Command::Run {
            file,
            commit,
            branch,
            repo_name,
            identifier,
            log_url,
            logdir,
        } => {
            let config = RunConfig {
                commit,
                branch,
                repo_name,
                identifier,
                log_url,
                logdir,
            };
            run_pipeline(&file, config).await
        }
        Command::Queue { path } => print_queue(&path).await,
    }
}

async fn run_pipeline(file: &Path, config: RunConfig) -> anyhow::Result<()> {
    let pipeline = PipelineConfig::load(file)?;
    let set = pipeline::build_task_set(&pipeline)?;

    tokio::fs::create_dir_all(&config.logdir).await?;
    let log = RunLog::with_file(&config.logdir)?;
    let kill = KillSignal::new();
    install_signal_handler(kill.clone());

    // Mirror the run log to stdout while the scheduler owns the file copy
    let mut follower = log.subscribe();
    let printer = tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match follower.recv().await {
                Ok(line) => println!("{}", line.render()),
                Err(RecvError::Lagged(missed)) => {
                    eprintln!("[output fell behind, {} lines not shown]", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let report = Scheduler::new(set, config, Arc::clone(&log), kill)?
        .run()
        .await;
    drop(log);
    let _ = printer.await;

    println!();
    for task in &report.snapshot().tasks {
        println!("{:<20} {}", task.name, task.status);
    }
    if !report.success() {
        std::process::exit(1);
    }
    Ok(())
}

/// SIGINT/SIGTERM cancel the run; tasks then fail with their cleanup done
fn install_signal_handler(kill: KillSignal) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = term.recv() => {}
                    }
                }
                Err(err) => {
                    tracing::warn!("could not install SIGTERM handler: {}", err);
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::warn!("shutdown signal received, cancelling run");
        kill.kill();
    });
}

async fn print_queue(path: &str) -> anyhow::Result<()> {
    let state = read_queue(&QueuePath::parse(path)).await?;
    println!("capacity: {}", state.capacity);
    if state.queue.is_empty() {
        println!("queue is empty");
        return Ok(());
    }
    for (position, entry) in state.queue.iter().enumerate() {
        let claim = if state.granted(&entry.id) {
            "held"
        } else {
            "waiting"
        };
        println!(
            "{:>3}  {:<7}  weight {}  since {}  {}",
            position,
            claim,
            entry.weight,
            entry.joined_at.format("%Y-%m-%dT%H:%M:%S"),
            entry.description,
        );
    }
    Ok(())
}
