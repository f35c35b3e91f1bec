//! Container executor - commands inside an ephemeral Docker container
//!
//! A fresh container is started from the given image when the session opens
//! (`/bin/bash -c cat` keeps it alive) and force-removed exactly once when
//! the session closes. Stash transfer crosses the container boundary with
//! `docker cp`.

use crate::executor::local::local_shell;
use crate::executor::{
    mkdir_command, quote, quote_path, rm_tmp_file_command, tar_create_command,
    tar_extract_command, ExecOptions, Executor,
};
use crate::tmp::random_tmp_path;
use crate::{run_command, run_quiet, KillSignal, Stash, TaskLogger};
use async_trait::async_trait;
use conveyor_foundation::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;
use uuid::Uuid;

/// Execution session inside a single-use Docker container
pub struct Container {
    container_name: String,
    path: Option<PathBuf>,
    temp_path: bool,
    logger: TaskLogger,
    kill: KillSignal,
    closed: AtomicBool,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("container_name", &self.container_name)
            .field("path", &self.path)
            .field("temp_path", &self.temp_path)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Start a container from `image` and open a session inside it.
    /// `mount_docker` exposes the host Docker socket for docker-in-docker
    /// builds.
    pub async fn start(
        image: &str,
        options: ExecOptions,
        mount_docker: bool,
        logger: TaskLogger,
        kill: KillSignal,
    ) -> Result<Self> {
        options.validate()?;
        let container_name = Uuid::new_v4().simple().to_string();
        let run = format!(
            "docker run --rm --name {} {} -t -d {} /bin/bash -c cat",
            quote(&container_name)?,
            if mount_docker {
                "-v /var/run/docker.sock:/var/run/docker.sock"
            } else {
                ""
            },
            quote(image)?,
        );
        local_shell(Path::new("."), &run, &logger, &kill)
            .await
            .map_err(|e| {
                Error::Setup(format!("failed to start container from {}: {}", image, e))
            })?;

        let mut exe = Self {
            container_name,
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

    /// Container name assigned for this session
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Files copied in with `docker cp` are owned by root; hand them to the
    /// container's default user before extraction.
    async fn chown_to_container_user(&self, path: &Path) -> Result<()> {
        let user_raw = self.sh("whoami").await?;
        let user = String::from_utf8_lossy(&user_raw).trim().to_string();
        let command = format!("chown {0}:{0} {1}", quote(&user)?, quote_path(path)?);
        self.logger.line(format!("+ {}", command));
        run_command(
            &[
                "docker".to_string(),
                "exec".to_string(),
                "--user".to_string(),
                "root".to_string(),
                self.container_name.clone(),
                "/bin/bash".to_string(),
                "-ce".to_string(),
                command,
            ],
            &self.logger,
            &self.kill,
        )
        .await
        .map(drop)
    }
}

#[async_trait]
impl Executor for Container {
    async fn sh(&self, command: &str) -> Result<Vec<u8>> {
        for line in command.lines() {
            self.logger.line(format!("+ {}", line));
        }
        let mut argv = vec!["docker".to_string(), "exec".to_string()];
        if let Some(path) = &self.path {
            argv.push("--workdir".to_string());
            argv.push(path.display().to_string());
        }
        argv.extend([
            "-t".to_string(),
            self.container_name.clone(),
            "/bin/bash".to_string(),
            "-ce".to_string(),
            command.to_string(),
        ]);
        run_command(&argv, &self.logger, &self.kill).await
    }

    async fn stash(&self, paths: &[&str]) -> Result<Stash> {
        let container_archive = random_tmp_path();
        self.sh(&tar_create_command(&container_archive, paths)?)
            .await?;

        let local_archive = random_tmp_path();
        let copy = format!(
            "docker cp {}:{} {}",
            quote(&self.container_name)?,
            quote_path(&container_archive)?,
            quote_path(&local_archive)?,
        );
        let copied = local_shell(Path::new("."), &copy, &self.logger, &self.kill).await;
        let cleaned = self.sh(&rm_tmp_file_command(&container_archive)?).await;
        copied?;
        cleaned?;
        Stash::adopt(local_archive)
    }

    async fn unstash_member(&self, stash: &Stash, member: &str) -> Result<()> {
        let container_tmp = random_tmp_path();
        let copy = format!(
            "docker cp {} {}:{}",
            quote_path(stash.path())?,
            quote(&self.container_name)?,
            quote_path(&container_tmp)?,
        );
        local_shell(Path::new("."), &copy, &self.logger, &self.kill).await?;
        self.chown_to_container_user(&container_tmp).await?;

        let extracted = self
            .sh(&tar_extract_command(&container_tmp, member)?)
            .await;
        let cleaned = self.sh(&rm_tmp_file_command(&container_tmp)?).await;
        extracted?;
        cleaned?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Removal still runs after a kill, so it cannot go through the
        // kill-raced command path.
        let remove = format!("docker rm -f {}", quote(&self.container_name)?);
        self.logger.line(format!("+ {}", remove));
        run_quiet(&["/bin/bash".to_string(), "-ce".to_string(), remove]).await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "container"
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let result = std::process::Command::new("docker")
                .args(["rm", "-f", &self.container_name])
                .output();
            if let Err(e) = result {
                warn!(
                    "failed to remove container {}: {}",
                    self.container_name, e
                );
            }
        }
    }
}
