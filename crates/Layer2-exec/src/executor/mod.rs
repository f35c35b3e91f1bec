//! Executor backends
//!
//! One command-execution and file-transfer contract over three environments:
//! - `Local` - child process on the scheduler host
//! - `Container` - ephemeral Docker container, torn down on close
//! - `Ssh` - remote host over key-authenticated ssh
//!
//! Sessions are scoped: opening prepares the environment, `close` (or drop,
//! as a blocking fallback) tears it down exactly once.

pub mod container;
pub mod local;
pub mod ssh;
mod r#trait;

pub use container::Container;
pub use local::Local;
pub use ssh::Ssh;
pub use r#trait::Executor;

use conveyor_foundation::{Error, Result};
use std::path::{Path, PathBuf};

/// Session options shared by every backend
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory inside the execution environment
    pub path: Option<PathBuf>,

    /// Create a fresh temp working directory, removed on close
    pub temp_path: bool,
}

impl ExecOptions {
    /// Work in a fixed directory
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            temp_path: false,
        }
    }

    /// Work in a run-scoped temp directory
    pub fn temp() -> Self {
        Self {
            path: None,
            temp_path: true,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.path.is_some() && self.temp_path {
            return Err(Error::Config(
                "path and temp_path are incompatible".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shell-quote a user string for embedding in `bash -ce` / ssh / docker exec
pub(crate) fn quote(raw: &str) -> Result<String> {
    shlex::try_quote(raw)
        .map(|cow| cow.into_owned())
        .map_err(|_| Error::Task(format!("cannot shell-quote: {:?}", raw)))
}

pub(crate) fn quote_path(path: &Path) -> Result<String> {
    quote(&path.display().to_string())
}

/// `cd <dir> && /bin/bash -ce <command>`
pub(crate) fn cd_command(path: &Path, command: &str) -> Result<String> {
    Ok(format!(
        "cd {} && /bin/bash -ce {}",
        quote_path(path)?,
        quote(command)?
    ))
}

// Plumbing command lines shared by all backends. Stash paths are quoted; the
// stashed patterns themselves are left unquoted so the remote shell expands
// globs.

pub(crate) fn tar_create_command(archive: &Path, paths: &[&str]) -> Result<String> {
    Ok(format!(
        "tar --gzip --create --file {} {}",
        quote_path(archive)?,
        paths.join(" ")
    ))
}

pub(crate) fn tar_extract_command(archive: &Path, member: &str) -> Result<String> {
    if member.is_empty() {
        return Ok(format!(
            "tar --extract --gzip --file {}",
            quote_path(archive)?
        ));
    }
    Ok(format!(
        "tar --extract --gzip --file {} {}",
        quote_path(archive)?,
        quote(member)?
    ))
}

pub(crate) fn mkdir_command(dir: &Path) -> Result<String> {
    Ok(format!("mkdir {}", quote_path(dir)?))
}

pub(crate) fn rm_tmp_file_command(path: &Path) -> Result<String> {
    crate::tmp::assert_path_in_tmp(path)?;
    Ok(format!("rm {}", quote_path(path)?))
}

pub(crate) fn rm_tmp_dir_command(path: &Path) -> Result<String> {
    crate::tmp::assert_path_in_tmp(path)?;
    Ok(format!("rm -r {}", quote_path(path)?))
}
