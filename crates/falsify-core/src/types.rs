use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Synthetic exit code recorded when a test command is killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code recorded when a test command never produced one.
pub const ERROR_EXIT_CODE: i32 = 1;

const TIMEOUT_CONFIDENCE: f64 = 0.3;
const ERROR_CONFIDENCE: f64 = 0.2;
const FAST_RUN_CONFIDENCE: f64 = 0.6;
const COMPLETED_CONFIDENCE: f64 = 0.85;

/// A candidate explanation for a bug, paired with the command that checks it.
///
/// The command is expected to exit 0 when the explanation is false (the bug
/// still reproduces) and nonzero when it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Unique identifier, also used in snapshot and artifact file names
    pub id: String,
    /// Human-readable description
    pub description: String,
    /// Shell command run inside the leased snapshot
    pub test_command: String,
    /// What the command is expected to show if the hypothesis holds
    #[serde(default)]
    pub expected_behavior: String,
    /// Estimated wall-clock time of the test command in seconds
    pub estimated_duration_secs: f64,
}

impl Hypothesis {
    /// Create a hypothesis with an empty expected behavior.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        test_command: impl Into<String>,
        estimated_duration_secs: f64,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            test_command: test_command.into(),
            expected_behavior: String::new(),
            estimated_duration_secs,
        }
    }

    /// Set the expected behavior text.
    #[must_use]
    pub fn with_expected_behavior(mut self, expected: impl Into<String>) -> Self {
        self.expected_behavior = expected.into();
        self
    }

    /// Estimated duration, or zero when the estimate is not a finite positive number.
    #[must_use]
    pub fn estimated_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.estimated_duration_secs).unwrap_or(Duration::ZERO)
    }

    /// Check that the hypothesis can be leased and executed.
    ///
    /// # Errors
    /// Returns `Error::InvalidHypothesis` if the id is empty or contains characters
    /// outside `[A-Za-z0-9._-]`, if the command is blank, or if the estimate is not
    /// a positive finite number.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidHypothesis("missing id".to_owned()));
        }
        if !self
            .id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
            || self.id.starts_with('.')
        {
            return Err(Error::InvalidHypothesis(format!(
                "id '{}' must match [A-Za-z0-9._-] and not start with '.'",
                self.id
            )));
        }
        if self.test_command.trim().is_empty() {
            return Err(Error::InvalidHypothesis(format!(
                "{} has no test command",
                self.id
            )));
        }
        if !self.estimated_duration_secs.is_finite() || self.estimated_duration_secs <= 0.0 {
            return Err(Error::InvalidHypothesis(format!(
                "{} has invalid estimated duration: {}",
                self.id, self.estimated_duration_secs
            )));
        }
        Ok(())
    }
}

/// How the engine should invoke a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestCommand {
    /// Inline shell command, run with `sh -c`
    Shell(String),
    /// Script artifact; relative paths resolve against the snapshot
    Script(PathBuf),
}

impl TestCommand {
    /// Resolve a script path against the snapshot root.
    #[must_use]
    pub fn script_path(&self, workdir: &Path) -> Option<PathBuf> {
        match self {
            Self::Shell(_) => None,
            Self::Script(path) if path.is_absolute() => Some(path.clone()),
            Self::Script(path) => Some(workdir.join(path)),
        }
    }
}

impl fmt::Display for TestCommand {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(command) => write!(formatter, "sh -c {command:?}"),
            Self::Script(path) => write!(formatter, "{}", path.display()),
        }
    }
}

/// Classification of one test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Exit 0: hypothesis falsified, the bug still reproduces
    Pass,
    /// Nonzero exit: hypothesis supported, the condition suppressed the bug
    Fail,
    /// Killed after exceeding its timeout
    Timeout,
    /// Could not run: spawn failure, missing artifact, or pool failure
    Error,
}

impl Outcome {
    /// Classify a completed process by exit code.
    #[must_use]
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            Self::Pass
        } else {
            Self::Fail
        }
    }

    /// Confidence in this outcome.
    ///
    /// Completed runs faster than `fast_threshold` get a medium score since they
    /// often mean a skipped or no-op test.
    #[must_use]
    pub fn confidence(self, duration: Duration, fast_threshold: Duration) -> f64 {
        match self {
            Self::Timeout => TIMEOUT_CONFIDENCE,
            Self::Error => ERROR_CONFIDENCE,
            Self::Pass | Self::Fail if duration < fast_threshold => FAST_RUN_CONFIDENCE,
            Self::Pass | Self::Fail => COMPLETED_CONFIDENCE,
        }
    }

    /// What the outcome says about the hypothesis.
    #[must_use]
    pub fn verdict(self) -> Verdict {
        match self {
            Self::Pass => Verdict::Falsified,
            Self::Fail => Verdict::Supported,
            Self::Timeout | Self::Error => Verdict::Inconclusive,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
        };
        formatter.write_str(label)
    }
}

/// Hypothesis status derived from an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The bug reproduced with the condition applied
    Falsified,
    /// The condition suppressed the bug
    Supported,
    /// No usable signal
    Inconclusive,
}

/// Where the snapshot used for a run came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    /// Leased from the pool
    Pooled,
    /// Created outside the pool after exhaustion, removed afterwards
    Direct,
    /// No snapshot was obtained
    #[default]
    None,
}

/// Per-hypothesis pass state.
///
/// `Pending -> Leased -> Completed(outcome) -> Released`; `Released` is reached
/// from every state, including failures before a lease was held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    /// Waiting for a worker
    Pending,
    /// Holding a snapshot
    Leased,
    /// Test finished with the given classification
    Completed(Outcome),
    /// Snapshot returned, pass finished
    Released,
}

impl fmt::Display for PassState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => formatter.write_str("PENDING"),
            Self::Leased => formatter.write_str("LEASED"),
            Self::Completed(outcome) => write!(formatter, "{outcome}"),
            Self::Released => formatter.write_str("RELEASED"),
        }
    }
}

/// Outcome record for one hypothesis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Hypothesis this result belongs to
    pub hypothesis_id: String,
    /// Classification
    pub outcome: Outcome,
    /// Process exit code, 124 for timeouts
    pub exit_code: i32,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Captured stdout, truncated to the configured limit
    pub stdout: String,
    /// Captured stderr, truncated to the configured limit
    pub stderr: String,
    /// Failure description for TIMEOUT and ERROR results
    pub error_message: Option<String>,
    /// Derived confidence in `[0, 1]`
    pub confidence: f64,
    /// Snapshot the command ran in
    pub snapshot_path: Option<PathBuf>,
    /// How the snapshot was obtained
    pub source: SnapshotSource,
}

impl ExecutionResult {
    /// Result for a process that ran to completion.
    #[must_use]
    pub fn completed(
        hypothesis_id: impl Into<String>,
        exit_code: i32,
        duration: Duration,
        fast_threshold: Duration,
    ) -> Self {
        let outcome = Outcome::from_exit_code(exit_code);
        Self {
            hypothesis_id: hypothesis_id.into(),
            outcome,
            exit_code,
            duration_ms: duration_millis(duration),
            stdout: String::new(),
            stderr: String::new(),
            error_message: None,
            confidence: outcome.confidence(duration, fast_threshold),
            snapshot_path: None,
            source: SnapshotSource::None,
        }
    }

    /// Result for a process killed after `limit`.
    #[must_use]
    pub fn timeout(hypothesis_id: impl Into<String>, duration: Duration, limit: Duration) -> Self {
        Self {
            hypothesis_id: hypothesis_id.into(),
            outcome: Outcome::Timeout,
            exit_code: TIMEOUT_EXIT_CODE,
            duration_ms: duration_millis(duration),
            stdout: String::new(),
            stderr: String::new(),
            error_message: Some(Error::ExecutionTimeout(duration_millis(limit)).to_string()),
            confidence: TIMEOUT_CONFIDENCE,
            snapshot_path: None,
            source: SnapshotSource::None,
        }
    }

    /// Result for a run that could not happen or crashed.
    #[must_use]
    pub fn error(
        hypothesis_id: impl Into<String>,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            hypothesis_id: hypothesis_id.into(),
            outcome: Outcome::Error,
            exit_code: ERROR_EXIT_CODE,
            duration_ms: duration_millis(duration),
            stdout: String::new(),
            stderr: String::new(),
            error_message: Some(message.into()),
            confidence: ERROR_CONFIDENCE,
            snapshot_path: None,
            source: SnapshotSource::None,
        }
    }

    /// Attach captured output.
    #[must_use]
    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Attach the snapshot the run used.
    #[must_use]
    pub fn with_snapshot(mut self, path: PathBuf, source: SnapshotSource) -> Self {
        self.snapshot_path = Some(path);
        self.source = source;
        self
    }

    /// Wall-clock duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Verdict implied by the outcome.
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        self.outcome.verdict()
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::expect_used, reason = "Test code is allowed to use expect")]
mod tests {
    use super::*;

    const FAST: Duration = Duration::from_secs(5);

    #[test]
    fn test_exit_code_classification() {
        assert_eq!(Outcome::from_exit_code(0), Outcome::Pass);
        assert_eq!(Outcome::from_exit_code(1), Outcome::Fail);
        assert_eq!(Outcome::from_exit_code(-1), Outcome::Fail);
        assert_eq!(Outcome::from_exit_code(124), Outcome::Fail);
    }

    #[test]
    fn test_confidence_heuristic() {
        let quick = Duration::from_secs(1);
        let slow = Duration::from_secs(30);
        assert!((Outcome::Timeout.confidence(slow, FAST) - 0.3).abs() < f64::EPSILON);
        assert!((Outcome::Error.confidence(slow, FAST) - 0.2).abs() < f64::EPSILON);
        assert!((Outcome::Pass.confidence(quick, FAST) - 0.6).abs() < f64::EPSILON);
        assert!((Outcome::Fail.confidence(slow, FAST) - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn test_verdicts() {
        assert_eq!(Outcome::Pass.verdict(), Verdict::Falsified);
        assert_eq!(Outcome::Fail.verdict(), Verdict::Supported);
        assert_eq!(Outcome::Timeout.verdict(), Verdict::Inconclusive);
        assert_eq!(Outcome::Error.verdict(), Verdict::Inconclusive);
    }

    #[test]
    fn test_timeout_result_shape() {
        let limit = Duration::from_secs(1);
        let result = ExecutionResult::timeout("hyp-1", Duration::from_millis(1010), limit);
        assert_eq!(result.outcome, Outcome::Timeout);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.duration_ms, 1010);
        assert_eq!(
            result.error_message.as_deref(),
            Some("Execution timed out after 1000ms")
        );
    }

    #[test]
    fn test_hypothesis_validation() {
        let valid = Hypothesis::new("race-1", "lock ordering", "cargo test", 12.0);
        assert!(valid.validate().is_ok());

        let bad_id = Hypothesis::new("../etc", "escape", "true", 1.0);
        assert!(matches!(bad_id.validate(), Err(Error::InvalidHypothesis(_))));

        let hidden = Hypothesis::new(".git", "hidden", "true", 1.0);
        assert!(hidden.validate().is_err());

        let blank = Hypothesis::new("h", "blank", "   ", 1.0);
        assert!(blank.validate().is_err());

        let no_estimate = Hypothesis::new("h", "zero", "true", 0.0);
        assert!(no_estimate.validate().is_err());

        let nan = Hypothesis::new("h", "nan", "true", f64::NAN);
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_expected_behavior_builder() {
        let hypothesis = Hypothesis::new("h", "d", "true", 1.0)
            .with_expected_behavior("deadlock disappears");
        assert_eq!(hypothesis.expected_behavior, "deadlock disappears");
        assert!(hypothesis.validate().is_ok());
    }

    #[test]
    fn test_script_path_resolution() {
        let root = Path::new("/pool/pool-wt-000");
        let relative = TestCommand::Script(PathBuf::from(".falsification/test_h.sh"));
        assert_eq!(
            relative.script_path(root),
            Some(root.join(".falsification/test_h.sh"))
        );
        assert_eq!(TestCommand::Shell("true".to_owned()).script_path(root), None);
    }

    #[test]
    fn test_result_serialization() {
        let result = ExecutionResult::completed("h", 0, Duration::from_secs(6), FAST)
            .with_snapshot(PathBuf::from("/pool/pool-wt-000"), SnapshotSource::Pooled);
        let json = serde_json::to_string(&result).expect("serialize result");
        assert!(json.contains("\"outcome\":\"PASS\""));
        assert!(json.contains("\"source\":\"pooled\""));
        let decoded: ExecutionResult = serde_json::from_str(&json).expect("deserialize result");
        assert_eq!(decoded, result);
    }
}
