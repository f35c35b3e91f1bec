//! Executor trait

use crate::Stash;
use async_trait::async_trait;
use conveyor_foundation::Result;

/// Uniform command-execution and file-transfer contract over all backends
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a shell command in the session's working directory, streaming
    /// combined output into the task log. Returns captured stdout; non-zero
    /// exit maps to `Error::Command`.
    async fn sh(&self, command: &str) -> Result<Vec<u8>>;

    /// Package paths (shell patterns, relative to the working directory) from
    /// this environment into a portable stash.
    async fn stash(&self, paths: &[&str]) -> Result<Stash>;

    /// Materialize a single stash member into the working directory.
    /// An empty member extracts everything.
    async fn unstash_member(&self, stash: &Stash, member: &str) -> Result<()>;

    /// Materialize a stash's full contents into the working directory.
    async fn unstash(&self, stash: &Stash) -> Result<()> {
        self.unstash_member(stash, "").await
    }

    /// Tear down the environment. Exactly-once; later calls are no-ops.
    async fn close(&self) -> Result<()>;

    /// Backend name
    fn name(&self) -> &'static str;
}
