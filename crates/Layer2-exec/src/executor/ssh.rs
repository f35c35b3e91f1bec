//! SSH executor - commands on a remote host over OpenSSH
//!
//! Authentication must already be in place (keys or an agent); the session
//! never prompts. Stash transfer uses `scp`.

use crate::executor::local::local_shell;
use crate::executor::{
    cd_command, mkdir_command, quote, rm_tmp_dir_command, rm_tmp_file_command,
    tar_create_command, tar_extract_command, ExecOptions, Executor,
};
use crate::tmp::{assert_path_in_tmp, random_tmp_path};
use crate::{run_command, run_quiet, KillSignal, Stash, TaskLogger};
use async_trait::async_trait;
use conveyor_foundation::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Execution session on a remote host
pub struct Ssh {
    host: String,
    path: Option<PathBuf>,
    temp_path: bool,
    logger: TaskLogger,
    kill: KillSignal,
    closed: AtomicBool,
}

impl std::fmt::Debug for Ssh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ssh")
            .field("host", &self.host)
            .field("path", &self.path)
            .field("temp_path", &self.temp_path)
            .finish_non_exhaustive()
    }
}

impl Ssh {
    /// Open a session on `host`, verifying connectivity up front so a bad
    /// host fails as a setup error rather than on the first command.
    pub async fn connect(
        host: &str,
        options: ExecOptions,
        logger: TaskLogger,
        kill: KillSignal,
    ) -> Result<Self> {
        options.validate()?;
        run_quiet(&[
            "ssh".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            host.to_string(),
            "true".to_string(),
        ])
        .await
        .map_err(|e| Error::Setup(format!("cannot reach {} over ssh: {}", host, e)))?;

        let mut exe = Self {
            host: host.to_string(),
            path: options.path,
            temp_path: false,
            logger,
            kill,
            closed: AtomicBool::new(false),
        };
        if options.temp_path {
            let dir = random_tmp_path();
            exe.sh(&mkdir_command(&dir)?).await?;
            exe.path = Some(dir);
            exe.temp_path = true;
        }
        Ok(exe)
    }

    async fn scp(&self, source: &str, target: &str) -> Result<()> {
        let copy = format!("scp {} {}", quote(source)?, quote(target)?);
        local_shell(Path::new("."), &copy, &self.logger, &self.kill)
            .await
            .map(drop)
    }

    fn remote(&self, path: &Path) -> String {
        format!("{}:{}", self.host, path.display())
    }
}

#[async_trait]
impl Executor for Ssh {
    async fn sh(&self, command: &str) -> Result<Vec<u8>> {
        for line in command.lines() {
            self.logger.line(format!("+ {}", line));
        }
        let workdir = self.path.as_deref().unwrap_or(Path::new("."));
        run_command(
            &[
                "ssh".to_string(),
                self.host.clone(),
                cd_command(workdir, command)?,
            ],
            &self.logger,
            &self.kill,
        )
        .await
    }

    async fn stash(&self, paths: &[&str]) -> Result<Stash> {
        let remote_archive = random_tmp_path();
        self.sh(&tar_create_command(&remote_archive, paths)?).await?;

        let local_archive = random_tmp_path();
        let copied = self
            .scp(
                &self.remote(&remote_archive),
                &local_archive.display().to_string(),
            )
            .await;
        let cleaned = self.sh(&rm_tmp_file_command(&remote_archive)?).await;
        copied?;
        cleaned?;
        Stash::adopt(local_archive)
    }

    async fn unstash_member(&self, stash: &Stash, member: &str) -> Result<()> {
        let remote_tmp = random_tmp_path();
        self.scp(
            &stash.path().display().to_string(),
            &self.remote(&remote_tmp),
        )
        .await?;

        let extracted = self.sh(&tar_extract_command(&remote_tmp, member)?).await;
        let cleaned = self.sh(&rm_tmp_file_command(&remote_tmp)?).await;
        extracted?;
        cleaned?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.temp_path {
            if let Some(dir) = self.path.clone() {
                // Teardown still runs after a kill, so it cannot go through
                // the kill-raced command path.
                let remove = rm_tmp_dir_command(&dir)?;
                self.logger.line(format!("+ {}", remove));
                run_quiet(&[
                    "ssh".to_string(),
                    self.host.clone(),
                    cd_command(Path::new("."), &remove)?,
                ])
                .await?;
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ssh"
    }
}

impl Drop for Ssh {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) || !self.temp_path {
            return;
        }
        if let Some(dir) = &self.path {
            if assert_path_in_tmp(dir).is_err() {
                return;
            }
            let result = std::process::Command::new("ssh")
                .arg(&self.host)
                .arg(format!("rm -r {}", dir.display()))
                .output();
            if let Err(e) = result {
                warn!("failed to remove {} on {}: {}", dir.display(), self.host, e);
            }
        }
    }
}
