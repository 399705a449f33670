//! Git worktree implementation of [`VcsAdapter`].

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use falsify_core::{Error, Result, VcsAdapter};
use tracing::{debug, info, warn};

/// Creates, resets, and removes Git worktrees by shelling out to `git`.
#[derive(Debug, Clone)]
pub struct GitAdapter {
    program: PathBuf,
}

impl GitAdapter {
    /// Adapter using the `git` found on `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }

    /// Adapter using a specific git binary.
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run git in `cwd`, returning trimmed stdout.
    ///
    /// # Errors
    /// Returns `Error::Vcs` if git cannot be spawned or exits nonzero.
    fn git<I, S>(&self, cwd: &Path, operation: &'static str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command.args(args).current_dir(cwd);
        debug!("Running {operation} in {}", cwd.display());

        let output = command.output().map_err(|err| Error::Vcs {
            operation,
            message: err.to_string(),
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
        } else {
            Err(Error::Vcs {
                operation,
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }

    /// Drop registrations of worktrees whose directories were deleted by hand.
    fn prune(&self, repo: &Path) {
        if let Err(error) = self.git(repo, "git worktree prune", ["worktree", "prune"]) {
            debug!("Worktree prune failed (ignored): {error}");
        }
    }
}

impl Default for GitAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl VcsAdapter for GitAdapter {
    fn current_branch(&self, repo: &Path) -> Result<String> {
        let branch = self.git(
            repo,
            "git rev-parse",
            ["rev-parse", "--abbrev-ref", "HEAD"],
        )?;
        debug!("Current branch: {branch}");
        Ok(branch)
    }

    fn create(&self, repo: &Path, path: &Path, branch: Option<&str>) -> Result<PathBuf> {
        if path.exists() {
            warn!("Worktree already exists: {}, reusing", path.display());
            return Ok(path.to_path_buf());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // A registered worktree whose directory is gone blocks `worktree add` on the same path.
        self.prune(repo);

        let path_arg = path.as_os_str();
        match branch {
            Some(branch) => self.git(
                repo,
                "git worktree add",
                [OsStr::new("worktree"), OsStr::new("add"), path_arg, OsStr::new(branch)],
            )?,
            None => {
                let current = self.current_branch(repo)?;
                self.git(
                    repo,
                    "git worktree add",
                    [
                        OsStr::new("worktree"),
                        OsStr::new("add"),
                        OsStr::new("--detach"),
                        path_arg,
                        OsStr::new(&current),
                    ],
                )?
            }
        };

        info!("Created worktree: {}", path.display());
        Ok(path.to_path_buf())
    }

    fn reset(&self, path: &Path) -> Result<()> {
        if !path.is_dir() {
            return Err(Error::Vcs {
                operation: "git reset",
                message: format!("{} does not exist", path.display()),
            });
        }
        self.git(path, "git reset", ["reset", "--hard", "--quiet", "HEAD"])?;
        self.git(path, "git clean", ["clean", "-fd", "--quiet"])?;
        debug!("Reset worktree: {}", path.display());
        Ok(())
    }

    fn remove(&self, repo: &Path, path: &Path, force: bool) {
        if !path.exists() {
            debug!("Worktree does not exist: {}", path.display());
            self.prune(repo);
            return;
        }

        let mut args = vec![OsStr::new("worktree"), OsStr::new("remove"), path.as_os_str()];
        if force {
            args.push(OsStr::new("--force"));
        }

        match self.git(repo, "git worktree remove", args) {
            Ok(_) => info!("Removed worktree: {}", path.display()),
            Err(error) => warn!("Failed to remove worktree {}: {error}", path.display()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, reason = "Test code is allowed to use expect")]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|output| output.status.success())
    }

    fn run_git(cwd: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(["-c", "user.name=falsify", "-c", "user.email=falsify@localhost"])
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("spawn git");
        assert!(
            status.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&status.stderr)
        );
    }

    fn init_repo(dir: &Path) {
        run_git(dir, &["init", "--quiet"]);
        fs::write(dir.join("tracked.txt"), "original\n")
            .expect("write file");
        run_git(dir, &["add", "tracked.txt"]);
        run_git(dir, &["commit", "--quiet", "-m", "init"]);
    }

    #[test]
    fn test_create_reset_remove_cycle() {
        if !git_available() {
            return;
        }
        let temp = TempDir::new().expect("temp dir");
        let repo = temp.path().join("repo");
        fs::create_dir_all(&repo).expect("create repo dir");
        init_repo(&repo);

        let adapter = GitAdapter::new();
        let worktree = temp.path().join("pool").join("pool-wt-000");
        let created = adapter
            .create(&repo, &worktree, None)
            .expect("create worktree");
        assert_eq!(created, worktree);
        assert!(worktree.join("tracked.txt").exists());

        fs::write(worktree.join("tracked.txt"), "dirty\n")
            .expect("write file");
        fs::write(worktree.join("untracked.txt"), "scratch\n")
            .expect("write file");

        adapter
            .reset(&worktree)
            .expect("reset worktree");
        let restored = fs::read_to_string(worktree.join("tracked.txt"))
            .expect("read file");
        assert_eq!(restored, "original\n");
        assert!(!worktree.join("untracked.txt").exists());

        adapter.remove(&repo, &worktree, true);
        assert!(!worktree.exists());
    }

    #[test]
    fn test_create_is_idempotent_and_recovers_deleted_worktree() {
        if !git_available() {
            return;
        }
        let temp = TempDir::new().expect("temp dir");
        let repo = temp.path().join("repo");
        fs::create_dir_all(&repo).expect("create repo dir");
        init_repo(&repo);

        let adapter = GitAdapter::new();
        let worktree = temp.path().join("wt");
        adapter
            .create(&repo, &worktree, None)
            .expect("create worktree");
        adapter
            .create(&repo, &worktree, None)
            .expect("create existing worktree");

        fs::remove_dir_all(&worktree).expect("delete worktree dir");
        adapter
            .create(&repo, &worktree, None)
            .expect("recreate worktree");
        assert!(worktree.join("tracked.txt").exists());
    }

    #[test]
    fn test_reset_missing_worktree_fails() {
        let temp = TempDir::new().expect("temp dir");
        let adapter = GitAdapter::new();
        let result = adapter.reset(&temp.path().join("missing"));
        assert!(matches!(result, Err(Error::Vcs { .. })));
    }

    #[test]
    fn test_current_branch_outside_repo_fails() {
        if !git_available() {
            return;
        }
        let temp = TempDir::new().expect("temp dir");
        let result = GitAdapter::new().current_branch(temp.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_program_is_vcs_error() {
        let temp = TempDir::new().expect("temp dir");
        let adapter = GitAdapter::with_program(temp.path().join("no-such-git"));

        let branch = adapter.current_branch(temp.path());
        assert!(matches!(
            branch,
            Err(Error::Vcs {
                operation: "git rev-parse",
                ..
            })
        ));
        assert!(matches!(adapter.reset(temp.path()), Err(Error::Vcs { .. })));
    }
}
