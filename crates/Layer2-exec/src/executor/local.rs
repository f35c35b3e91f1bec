//! Local executor - commands as child processes on the scheduler host

use crate::executor::{
    cd_command, mkdir_command, rm_tmp_dir_command, tar_create_command, tar_extract_command,
    ExecOptions, Executor,
};
use crate::tmp::{assert_path_in_tmp, random_tmp_path};
use crate::{run_command, run_quiet, KillSignal, Stash, TaskLogger};
use async_trait::async_trait;
use conveyor_foundation::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Local execution session rooted at a working directory on this host
pub struct Local {
    path: PathBuf,
    temp_path: bool,
    logger: TaskLogger,
    kill: KillSignal,
    closed: AtomicBool,
}

impl std::fmt::Debug for Local {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Local")
            .field("path", &self.path)
            .field("temp_path", &self.temp_path)
            .finish_non_exhaustive()
    }
}

impl Local {
    /// Open a session. With `temp_path`, a fresh `/tmp` working directory is
    /// created and removed again on close.
    pub async fn open(options: ExecOptions, logger: TaskLogger, kill: KillSignal) -> Result<Self> {
        options.validate()?;
        let (path, temp_path) = if options.temp_path {
            let dir = random_tmp_path();
            local_shell(Path::new("."), &mkdir_command(&dir)?, &logger, &kill).await?;
            (dir, true)
        } else {
            (options.path.unwrap_or_else(|| PathBuf::from(".")), false)
        };
        Ok(Self {
            path,
            temp_path,
            logger,
            kill,
            closed: AtomicBool::new(false),
        })
    }

    async fn shell_at(&self, path: &Path, command: &str) -> Result<Vec<u8>> {
        local_shell(path, command, &self.logger, &self.kill).await
    }
}

/// Run a command through the local shell, echoing it into the task log
pub(crate) async fn local_shell(
    path: &Path,
    command: &str,
    logger: &TaskLogger,
    kill: &KillSignal,
) -> Result<Vec<u8>> {
    logger.line(format!("+ {}", command));
    run_command(
        &[
            "/bin/bash".to_string(),
            "-ce".to_string(),
            cd_command(path, command)?,
        ],
        logger,
        kill,
    )
    .await
}

#[async_trait]
impl Executor for Local {
    async fn sh(&self, command: &str) -> Result<Vec<u8>> {
        self.shell_at(&self.path, command).await
    }

    async fn stash(&self, paths: &[&str]) -> Result<Stash> {
        let archive = random_tmp_path();
        self.sh(&tar_create_command(&archive, paths)?).await?;
        Stash::adopt(archive)
    }

    async fn unstash_member(&self, stash: &Stash, member: &str) -> Result<()> {
        self.sh(&tar_extract_command(stash.path(), member)?)
            .await
            .map(drop)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.temp_path {
            // Teardown still runs after a kill, so it cannot go through the
            // kill-raced command path.
            let remove = rm_tmp_dir_command(&self.path)?;
            self.logger.line(format!("+ {}", remove));
            run_quiet(&["/bin/bash".to_string(), "-ce".to_string(), remove]).await?;
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

impl Drop for Local {
    fn drop(&mut self) {
        // Fallback teardown for sessions abandoned mid-task or whose close()
        // failed. The atomic swap keeps it exactly-once with close().
        if !self.closed.swap(true, Ordering::SeqCst) && self.temp_path {
            if assert_path_in_tmp(&self.path).is_ok() {
                if let Err(e) = std::fs::remove_dir_all(&self.path) {
                    warn!("failed to remove temp dir {}: {}", self.path.display(), e);
                }
            }
        }
    }
}
