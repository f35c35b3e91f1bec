//! Temp path conventions shared by executors and the stash broker
//!
//! Scratch files and directories live directly under `/tmp` with a random
//! suffix, on whichever host the executor targets. Deletion helpers refuse
//! any path outside `/tmp` so an injected or corrupted path can never turn
//! into `rm -r /`.

use conveyor_foundation::{Error, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A fresh random path directly under `/tmp`
pub fn random_tmp_path() -> PathBuf {
    PathBuf::from(format!("/tmp/exe_{}", Uuid::new_v4().simple()))
}

/// Guard that a path is a direct child of `/tmp` before it is deleted
pub fn assert_path_in_tmp(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::Task(format!(
            "temp path is not absolute: {}",
            path.display()
        )));
    }
    if path.parent() != Some(Path::new("/tmp")) {
        return Err(Error::Task(format!(
            "temp path does not start with /tmp/: {}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_tmp_path_is_under_tmp() {
        let path = random_tmp_path();
        assert_path_in_tmp(&path).unwrap();
    }

    #[test]
    fn test_rejects_paths_outside_tmp() {
        assert!(assert_path_in_tmp(Path::new("/etc/passwd")).is_err());
        assert!(assert_path_in_tmp(Path::new("relative/path")).is_err());
        assert!(assert_path_in_tmp(Path::new("/tmp/nested/deeper")).is_err());
        assert!(assert_path_in_tmp(Path::new("/tmp")).is_err());
    }
}
