use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::{ExecutionResult, Result, TestCommand};

/// Version-control operations against checked-out working copies.
///
/// Calls are synchronous: the pool invokes them while holding its lock, and
/// async callers reach the pool through `spawn_blocking`.
pub trait VcsAdapter: Send + Sync {
    /// Name of the branch currently checked out in `repo`.
    ///
    /// # Errors
    /// Returns an error if the repository cannot be queried.
    fn current_branch(&self, repo: &Path) -> Result<String>;

    /// Create a working copy of `repo` at `path`.
    ///
    /// Without `branch` the copy is detached at the current branch. Returns
    /// `path` unchanged if it already exists.
    ///
    /// # Errors
    /// Returns an error if the working copy cannot be created.
    fn create(&self, repo: &Path, path: &Path, branch: Option<&str>) -> Result<PathBuf>;

    /// Discard tracked modifications and remove untracked files in one call.
    ///
    /// # Errors
    /// Returns an error if the working copy could not be brought back to HEAD.
    fn reset(&self, path: &Path) -> Result<()>;

    /// Remove the working copy at `path`. Best-effort: failures are logged.
    fn remove(&self, repo: &Path, path: &Path, force: bool);
}

/// Runs one test command inside a snapshot.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run `command` rooted at `workdir`, killing it after `timeout`.
    ///
    /// Never fails: spawn errors, missing artifacts, and timeouts are all
    /// classified into the returned record.
    async fn run(
        &self,
        hypothesis_id: &str,
        workdir: &Path,
        command: &TestCommand,
        timeout: Duration,
    ) -> ExecutionResult;
}
