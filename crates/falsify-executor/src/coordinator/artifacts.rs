//! Per-hypothesis test script and config written into a snapshot before a run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use falsify_core::{Error, Hypothesis, Result, TestCommand};
use serde::Serialize;
use tracing::debug;

/// Directory inside a snapshot holding generated artifacts.
pub const ARTIFACT_DIR: &str = ".falsification";

#[derive(Serialize)]
struct RunConfig<'hyp> {
    hypothesis_id: &'hyp str,
    description: &'hyp str,
    expected_behavior: &'hyp str,
    test_command: &'hyp str,
    estimated_duration_secs: f64,
    timeout_secs: u64,
    snapshot: &'hyp Path,
}

/// Script path relative to the snapshot root.
pub fn script_relative_path(hypothesis_id: &str) -> PathBuf {
    Path::new(ARTIFACT_DIR).join(format!("test_{hypothesis_id}.sh"))
}

fn quote(text: &str) -> Result<String> {
    shlex::try_quote(text)
        .map(|quoted| quoted.into_owned())
        .map_err(|error| Error::InvalidHypothesis(format!("cannot quote {text:?}: {error}")))
}

fn render_script(hypothesis: &Hypothesis, snapshot: &Path) -> Result<String> {
    let banner = format!("Testing hypothesis {}: {}", hypothesis.id, hypothesis.description);
    Ok(format!(
        "#!/bin/sh\necho {}\nset -e\ncd {}\n{}\n",
        quote(&banner)?,
        quote(&snapshot.display().to_string())?,
        hypothesis.test_command.trim_end()
    ))
}

/// Write `test_<id>.sh` (mode 0755) and `config_<id>.json` into `snapshot`.
///
/// Returns the command that runs the script.
///
/// # Errors
/// Returns an error if the hypothesis text cannot be shell-quoted or a file
/// cannot be written.
pub fn materialize(hypothesis: &Hypothesis, snapshot: &Path, timeout: Duration) -> Result<TestCommand> {
    let dir = snapshot.join(ARTIFACT_DIR);
    fs::create_dir_all(&dir)?;

    let relative = script_relative_path(&hypothesis.id);
    let script_path = snapshot.join(&relative);
    fs::write(&script_path, render_script(hypothesis, snapshot)?)?;
    make_executable(&script_path)?;

    let config = RunConfig {
        hypothesis_id: &hypothesis.id,
        description: &hypothesis.description,
        expected_behavior: &hypothesis.expected_behavior,
        test_command: &hypothesis.test_command,
        estimated_duration_secs: hypothesis.estimated_duration_secs,
        timeout_secs: timeout.as_secs(),
        snapshot,
    };
    let config_path = dir.join(format!("config_{}.json", hypothesis.id));
    fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;

    debug!("Wrote test artifacts to {}", dir.display());
    Ok(TestCommand::Script(relative))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
