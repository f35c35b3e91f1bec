//! Stash broker - portable file bundles
//!
//! A stash is an immutable gzipped tar held in a temp file on the scheduler
//! host. Executors produce one from their working directory and materialize
//! one into it, whatever environment they target; the broker only ever deals
//! in the local temp file. Handles are refcounted and the backing file is
//! removed when the last handle drops.

use crate::process::run_quiet;
use crate::tmp::{assert_path_in_tmp, random_tmp_path};
use conveyor_foundation::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct StashInner {
    path: PathBuf,
}

impl Drop for StashInner {
    fn drop(&mut self) {
        // Creation already validated the path; re-check before deleting.
        if assert_path_in_tmp(&self.path).is_ok() {
            let _ = std::fs::remove_file(&self.path);
            debug!("removed stash file {}", self.path.display());
        }
    }
}

/// Immutable named bundle of files, transferable between executors
#[derive(Debug, Clone)]
pub struct Stash {
    inner: Arc<StashInner>,
}

impl Stash {
    /// Adopt an already-written archive under `/tmp`
    pub(crate) fn adopt(path: PathBuf) -> Result<Self> {
        assert_path_in_tmp(&path)?;
        Ok(Self {
            inner: Arc::new(StashInner { path }),
        })
    }

    /// An empty stash
    pub async fn empty() -> Result<Self> {
        let path = random_tmp_path();
        run_quiet(&[
            "tar".to_string(),
            "--create".to_string(),
            "--gzip".to_string(),
            "--file".to_string(),
            path.display().to_string(),
            "--files-from".to_string(),
            "/dev/null".to_string(),
        ])
        .await?;
        Self::adopt(path)
    }

    /// Archive location on the scheduler host
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Extract a single member's bytes without materializing the stash
    pub async fn read(&self, member: &str) -> Result<Vec<u8>> {
        run_quiet(&[
            "tar".to_string(),
            "--extract".to_string(),
            "--gzip".to_string(),
            "--file".to_string(),
            self.inner.path.display().to_string(),
            "--to-stdout".to_string(),
            member.to_string(),
        ])
        .await
    }

    /// `read`, decoded and trimmed
    pub async fn read_text(&self, member: &str) -> Result<String> {
        let bytes = self.read(member).await?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    /// Member paths contained in the archive
    pub async fn members(&self) -> Result<Vec<String>> {
        let out = run_quiet(&[
            "tar".to_string(),
            "--list".to_string(),
            "--gzip".to_string(),
            "--file".to_string(),
            self.inner.path.display().to_string(),
        ])
        .await?;
        Ok(String::from_utf8_lossy(&out)
            .lines()
            .map(|s| s.to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_stash_lists_no_members() {
        let stash = Stash::empty().await.unwrap();
        assert!(stash.members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backing_file_removed_when_last_handle_drops() {
        let stash = Stash::empty().await.unwrap();
        let path = stash.path().to_path_buf();
        assert!(path.exists());

        let second = stash.clone();
        drop(stash);
        assert!(path.exists());
        drop(second);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_adopt_rejects_paths_outside_tmp() {
        assert!(Stash::adopt(PathBuf::from("/etc/archive.tgz")).is_err());
    }
}
