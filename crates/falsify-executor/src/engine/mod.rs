//! Runs one test command inside a snapshot under a hard timeout.

mod output;

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use falsify_core::{Error, ExecutionConfig, ExecutionResult, TestCommand, TestRunner};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use output::{TailBuffer, capture};

const SHELL: &str = "sh";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

enum Exit {
    Completed(ExitStatus),
    TimedOut,
    Failed(String),
}

/// Spawns test commands as child processes and classifies how they ended.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    output_limit: usize,
    fast_run_threshold: Duration,
}

impl ExecutionEngine {
    /// Engine using the output limit and fast-run threshold from `config`.
    #[must_use]
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            output_limit: config.output_limit_bytes,
            fast_run_threshold: config.fast_run_threshold(),
        }
    }

    /// Run `command` with `workdir` as its working directory.
    ///
    /// The reported duration stops when the command exits or times out. The
    /// command's process group is killed either way, so background jobs do not
    /// outlive the run. On timeout the result is TIMEOUT with exit code 124. A missing snapshot, a missing script, or a spawn
    /// failure yields ERROR. This never fails.
    pub async fn execute(
        &self,
        hypothesis_id: &str,
        workdir: &Path,
        command: &TestCommand,
        timeout: Duration,
    ) -> ExecutionResult {
        let started = Instant::now();

        if !workdir.is_dir() {
            return ExecutionResult::error(
                hypothesis_id,
                Error::Execution(format!("snapshot not found: {}", workdir.display()))
                    .to_string(),
                started.elapsed(),
            );
        }

        let mut process = Command::new(SHELL);
        match command {
            TestCommand::Shell(line) => {
                process.arg("-c").arg(line);
            }
            TestCommand::Script(_) => {
                let Some(script) = command.script_path(workdir).filter(|path| path.is_file())
                else {
                    return ExecutionResult::error(
                        hypothesis_id,
                        Error::Execution(format!("test script not found: {command}")).to_string(),
                        started.elapsed(),
                    );
                };
                process.arg(script);
            }
        }

        process
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        process.process_group(0);

        debug!("Running {command} in {}", workdir.display());
        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(error) => {
                return ExecutionResult::error(
                    hypothesis_id,
                    Error::Execution(format!("failed to spawn {command}: {error}")).to_string(),
                    started.elapsed(),
                );
            }
        };

        let group = child.id();
        let stdout = tokio::spawn(capture(child.stdout.take(), self.output_limit));
        let stderr = tokio::spawn(capture(child.stderr.take(), self.output_limit));

        let exit = match time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Exit::Completed(status),
            Ok(Err(error)) => Exit::Failed(
                Error::Execution(format!("failed to wait for {command}: {error}")).to_string(),
            ),
            Err(_elapsed) => {
                warn!(
                    "{hypothesis_id} exceeded {}s timeout, killing",
                    timeout.as_secs_f64()
                );
                Exit::TimedOut
            }
        };
        let elapsed = started.elapsed();

        // Background jobs left by the command must not outlive the lease.
        kill_process_group(group);
        if !matches!(exit, Exit::Completed(_))
            && let Err(error) = child.kill().await
        {
            debug!("Kill after abnormal exit: {error}");
        }
        let (stdout, stderr) = drain(stdout, stderr).await;

        let result = match exit {
            Exit::Completed(status) => ExecutionResult::completed(
                hypothesis_id,
                exit_code(status),
                elapsed,
                self.fast_run_threshold,
            ),
            Exit::TimedOut => ExecutionResult::timeout(hypothesis_id, elapsed, timeout),
            Exit::Failed(message) => ExecutionResult::error(hypothesis_id, message, elapsed),
        };
        debug!(
            "{hypothesis_id} finished: {} (exit {}) in {}ms",
            result.outcome, result.exit_code, result.duration_ms
        );
        result.with_output(stdout, stderr)
    }
}

#[async_trait]
impl TestRunner for ExecutionEngine {
    async fn run(
        &self,
        hypothesis_id: &str,
        workdir: &Path,
        command: &TestCommand,
        timeout: Duration,
    ) -> ExecutionResult {
        self.execute(hypothesis_id, workdir, command, timeout).await
    }
}

/// Collect both capture tasks under one deadline, giving up on pipes that
/// escaped processes keep open.
async fn drain(stdout: JoinHandle<TailBuffer>, stderr: JoinHandle<TailBuffer>) -> (String, String) {
    let deadline = time::Instant::now() + DRAIN_TIMEOUT;
    tokio::join!(drain_until(stdout, deadline), drain_until(stderr, deadline))
}

async fn drain_until(mut handle: JoinHandle<TailBuffer>, deadline: time::Instant) -> String {
    match time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(buffer)) => buffer.into_text(),
        Ok(Err(error)) => {
            debug!("Output capture task failed: {error}");
            String::new()
        }
        Err(_elapsed) => {
            handle.abort();
            debug!("Output capture did not finish, discarding");
            String::new()
        }
    }
}

/// Kill the process group led by the spawned shell so grandchildren die with it.
///
/// Takes the id recorded at spawn because the child forgets it once reaped.
#[cfg(unix)]
fn kill_process_group(group: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(raw) = group.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => warn!("Failed to kill process group {raw}: {errno}"),
    }
}

#[cfg(not(unix))]
const fn kill_process_group(_group: Option<u32>) {}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt as _;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
#[allow(clippy::expect_used, reason = "Test code is allowed to use expect")]
mod tests {
    use super::*;
    use falsify_core::{Outcome, TIMEOUT_EXIT_CODE};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(&ExecutionConfig::default())
    }

    fn workdir() -> TempDir {
        TempDir::new().expect("temp dir")
    }

    #[tokio::test]
    async fn test_exit_zero_is_pass() {
        let dir = workdir();
        let result = engine()
            .execute(
                "h",
                dir.path(),
                &TestCommand::Shell("echo reproduced".to_owned()),
                Duration::from_secs(10),
            )
            .await;
        assert_eq!(result.outcome, Outcome::Pass);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "reproduced\n");
        assert!((result.confidence - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_fail() {
        let dir = workdir();
        let result = engine()
            .execute(
                "h",
                dir.path(),
                &TestCommand::Shell("echo gone >&2; exit 3".to_owned()),
                Duration::from_secs(10),
            )
            .await;
        assert_eq!(result.outcome, Outcome::Fail);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr, "gone\n");
    }

    #[tokio::test]
    async fn test_runs_in_workdir() {
        let dir = workdir();
        fs::write(dir.path().join("marker"), "x").expect("write marker");
        let result = engine()
            .execute(
                "h",
                dir.path(),
                &TestCommand::Shell("test -f marker".to_owned()),
                Duration::from_secs(10),
            )
            .await;
        assert_eq!(result.outcome, Outcome::Pass);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = workdir();
        let started = Instant::now();
        let result = engine()
            .execute(
                "slow",
                dir.path(),
                &TestCommand::Shell("sleep 5; sleep 5".to_owned()),
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(result.outcome, Outcome::Timeout);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!((result.confidence - 0.3).abs() < f64::EPSILON);
        assert!(
            (1000..2000).contains(&result.duration_ms),
            "duration {}ms",
            result.duration_ms
        );
    }

    #[tokio::test]
    async fn test_background_job_does_not_stretch_fast_pass() {
        let dir = workdir();
        let started = Instant::now();
        let result = engine()
            .execute(
                "bg",
                dir.path(),
                &TestCommand::Shell("sleep 30 & sleep 1.5; exit 0".to_owned()),
                Duration::from_secs(60),
            )
            .await;
        assert_eq!(result.outcome, Outcome::Pass);
        assert!(result.duration_ms < 3000, "duration {}ms", result.duration_ms);
        assert!((result.confidence - 0.6).abs() < f64::EPSILON);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_background_job_is_killed_after_exit() {
        let dir = workdir();
        let result = engine()
            .execute(
                "bg",
                dir.path(),
                &TestCommand::Shell("(sleep 1; touch late) & exit 0".to_owned()),
                Duration::from_secs(10),
            )
            .await;
        assert_eq!(result.outcome, Outcome::Pass);

        time::sleep(Duration::from_secs(2)).await;
        assert!(!dir.path().join("late").exists());
    }

    #[tokio::test]
    async fn test_missing_script_is_error() {
        let dir = workdir();
        let result = engine()
            .execute(
                "h",
                dir.path(),
                &TestCommand::Script(PathBuf::from(".falsification/test_h.sh")),
                Duration::from_secs(10),
            )
            .await;
        assert_eq!(result.outcome, Outcome::Error);
        let message = result.error_message.expect("error message");
        assert!(message.contains("test script not found"), "{message}");
    }

    #[tokio::test]
    async fn test_missing_workdir_is_error() {
        let dir = workdir();
        let result = engine()
            .execute(
                "h",
                &dir.path().join("gone"),
                &TestCommand::Shell("true".to_owned()),
                Duration::from_secs(10),
            )
            .await;
        assert_eq!(result.outcome, Outcome::Error);
        assert!((result.confidence - 0.2).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_script_runs_relative_to_snapshot() {
        let dir = workdir();
        let script_dir = dir.path().join(".falsification");
        fs::create_dir_all(&script_dir).expect("create artifact dir");
        fs::write(script_dir.join("test_h.sh"), "#!/bin/sh\nexit 7\n").expect("write script");
        let result = engine()
            .execute(
                "h",
                dir.path(),
                &TestCommand::Script(PathBuf::from(".falsification/test_h.sh")),
                Duration::from_secs(10),
            )
            .await;
        assert_eq!(result.outcome, Outcome::Fail);
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let dir = workdir();
        let config = ExecutionConfig {
            output_limit_bytes: 1024,
            ..ExecutionConfig::default()
        };
        let result = ExecutionEngine::new(&config)
            .execute(
                "h",
                dir.path(),
                &TestCommand::Shell("i=0; while [ $i -lt 500 ]; do echo 0123456789; i=$((i+1)); done".to_owned()),
                Duration::from_secs(10),
            )
            .await;
        assert_eq!(result.outcome, Outcome::Pass);
        assert!(result.stdout.starts_with("[... "));
        assert!(result.stdout.ends_with("0123456789\n"));
    }
}
