//! Configuration types for the snapshot pool, test execution, and the break-even model.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

const ENV_POOL_CAPACITY: &str = "FALSIFY_POOL_CAPACITY";
const ENV_MAX_CONCURRENT: &str = "FALSIFY_MAX_CONCURRENT";
const ENV_TEST_TIMEOUT: &str = "FALSIFY_TEST_TIMEOUT";

const MIN_OUTPUT_LIMIT_BYTES: usize = 1024;

/// Complete falsification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FalsifyConfig {
    /// Name prefix for snapshots created outside the pool
    pub direct_prefix: String,
    /// Snapshot pool configuration
    pub pool: PoolConfig,
    /// Test execution configuration
    pub execution: ExecutionConfig,
    /// Parallelization overhead estimates
    pub overhead: OverheadConfig,
    /// What to do when the pool is exhausted
    pub fallback: FallbackPolicy,
}

impl Default for FalsifyConfig {
    fn default() -> Self {
        Self {
            direct_prefix: "hyp".to_owned(),
            pool: PoolConfig::default(),
            execution: ExecutionConfig::default(),
            overhead: OverheadConfig::default(),
            fallback: FallbackPolicy::default(),
        }
    }
}

/// Snapshot pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Whether pooling is enabled; when disabled every pass uses a direct snapshot
    pub enabled: bool,
    /// Directory holding the pool (`<root>/pool`) and direct snapshots
    pub snapshot_root: PathBuf,
    /// Maximum number of pooled snapshots
    pub capacity: usize,
    /// Prefix for pooled snapshot names
    pub name_prefix: String,
    /// Load persisted state when the pool is opened
    pub auto_load: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_root: PathBuf::from(".falsify/worktrees"),
            capacity: 10,
            name_prefix: "pool-wt".to_owned(),
            auto_load: true,
        }
    }
}

impl PoolConfig {
    /// Directory the pooled snapshots and the state file for `repo` live in.
    #[must_use]
    pub fn pool_dir(&self, repo: &Path) -> PathBuf {
        self.resolved_root(repo).join("pool")
    }

    /// Snapshot root for `repo`; a relative root is taken to be inside the repository.
    #[must_use]
    pub fn resolved_root(&self, repo: &Path) -> PathBuf {
        if self.snapshot_root.is_absolute() {
            self.snapshot_root.clone()
        } else {
            repo.join(&self.snapshot_root)
        }
    }
}

/// Test execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-hypothesis timeout in seconds
    pub test_timeout_secs: u64,
    /// Maximum number of hypotheses run at once
    pub max_concurrent: usize,
    /// Captured bytes kept per output stream
    pub output_limit_bytes: usize,
    /// Completed runs shorter than this get a medium confidence
    pub fast_run_threshold_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            test_timeout_secs: 300,
            max_concurrent: 5,
            output_limit_bytes: 64 * 1024,
            fast_run_threshold_secs: 5,
        }
    }
}

impl ExecutionConfig {
    /// Per-hypothesis timeout.
    #[must_use]
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    /// Fast-run threshold.
    #[must_use]
    pub fn fast_run_threshold(&self) -> Duration {
        Duration::from_secs(self.fast_run_threshold_secs)
    }
}

/// Amortized cost of fanning out, used by the break-even analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverheadConfig {
    /// Fixed cost of a parallel batch in seconds
    pub base_secs: f64,
    /// Creation, reset, and bookkeeping per snapshot in seconds
    pub per_snapshot_secs: f64,
}

impl Default for OverheadConfig {
    fn default() -> Self {
        Self {
            base_secs: 7.0,
            per_snapshot_secs: 16.0,
        }
    }
}

/// Behavior when every pooled snapshot is leased and the pool is full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Create an unpooled snapshot for the pass and remove it afterwards
    #[default]
    Direct,
    /// Retry the pool, then classify the pass as ERROR
    Backoff {
        /// Extra acquire attempts after the first refusal
        attempts: u32,
        /// Delay between attempts in milliseconds
        delay_ms: u64,
    },
}

impl FalsifyConfig {
    /// Default config directory (`~/.falsify`).
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_dir() -> Result<PathBuf> {
        use dirs::home_dir;
        let home = home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_owned()))?;
        Ok(home.join(".falsify"))
    }

    /// Default config file path (`~/.falsify/config.toml`).
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the default location, writing defaults there if missing.
    ///
    /// # Errors
    /// Returns an error if the config cannot be read, parsed, or created
    pub fn load_or_create() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            let config = Self::default();
            config.save_to_file(&config_path)?;
            info!("Wrote default config to {}", config_path.display());
            Ok(config)
        }
    }

    /// Load config from a specific file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|error| {
            Error::Config(format!("Failed to read {}: {error}", path.display()))
        })?;
        debug!("Loading config from {}", path.display());
        Ok(toml::from_str(&contents)?)
    }

    /// Save config to a specific file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                Error::Config(format!("Failed to create config directory: {error}"))
            })?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|error| Error::Config(format!("Failed to serialize config: {error}")))?;

        let header = "# Falsify configuration\n\
                      # Generated on first run; edit to tune the pool and executor\n\n";

        fs::write(path, format!("{header}{contents}"))
            .map_err(|error| Error::Config(format!("Failed to write config: {error}")))?;

        Ok(())
    }

    /// Apply `FALSIFY_*` environment overrides.
    ///
    /// # Errors
    /// Returns an error if a set variable does not parse
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(capacity) = env_override(ENV_POOL_CAPACITY)? {
            self.pool.capacity = capacity;
        }
        if let Some(max_concurrent) = env_override(ENV_MAX_CONCURRENT)? {
            self.execution.max_concurrent = max_concurrent;
        }
        if let Some(timeout) = env_override(ENV_TEST_TIMEOUT)? {
            self.execution.test_timeout_secs = timeout;
        }
        Ok(())
    }

    /// Reject values the pool and engine cannot work with.
    ///
    /// # Errors
    /// Returns `Error::Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.pool.capacity == 0 {
            return Err(Error::Config("pool.capacity must be >= 1".to_owned()));
        }
        if self.pool.name_prefix.is_empty() || self.direct_prefix.is_empty() {
            return Err(Error::Config("snapshot name prefixes must not be empty".to_owned()));
        }
        if self.execution.max_concurrent == 0 {
            return Err(Error::Config(
                "execution.max_concurrent must be >= 1".to_owned(),
            ));
        }
        if self.execution.test_timeout_secs == 0 {
            return Err(Error::Config(
                "execution.test_timeout_secs must be >= 1".to_owned(),
            ));
        }
        if self.execution.output_limit_bytes < MIN_OUTPUT_LIMIT_BYTES {
            return Err(Error::Config(format!(
                "execution.output_limit_bytes must be >= {MIN_OUTPUT_LIMIT_BYTES}"
            )));
        }
        let overheads = [self.overhead.base_secs, self.overhead.per_snapshot_secs];
        if overheads.iter().any(|secs| !secs.is_finite() || *secs < 0.0) {
            return Err(Error::Config(
                "overhead values must be finite and non-negative".to_owned(),
            ));
        }
        Ok(())
    }
}

fn env_override<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => {
            debug!("Config override {name}={raw}");
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::Config(format!("{name} has invalid value '{raw}'")))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
#[allow(
    unsafe_code,
    clippy::expect_used,
    reason = "Test code is allowed to use expect and to mutate the process environment"
)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn set_env(name: &str, value: &str) {
        // SAFETY: every test touching FALSIFY_* variables runs under #[serial]
        unsafe {
            env::set_var(name, value);
        }
    }

    fn clear_env() {
        for name in [ENV_POOL_CAPACITY, ENV_MAX_CONCURRENT, ENV_TEST_TIMEOUT] {
            // SAFETY: every test touching FALSIFY_* variables runs under #[serial]
            unsafe {
                env::remove_var(name);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = FalsifyConfig::default();
        assert!(config.pool.enabled);
        assert_eq!(config.pool.capacity, 10);
        assert_eq!(config.execution.max_concurrent, 5);
        assert_eq!(config.execution.test_timeout(), Duration::from_secs(300));
        assert_eq!(config.fallback, FallbackPolicy::Direct);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_round_trip() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("nested").join("config.toml");

        let mut config = FalsifyConfig::default();
        config.pool.capacity = 3;
        config.fallback = FallbackPolicy::Backoff {
            attempts: 4,
            delay_ms: 250,
        };

        config.save_to_file(&path).expect("save config");
        let written = fs::read_to_string(&path).expect("read config");
        assert!(written.starts_with("# Falsify configuration"));
        let loaded = FalsifyConfig::load_from_file(&path).expect("load config");

        assert_eq!(loaded.pool.capacity, 3);
        assert_eq!(loaded.fallback, config.fallback);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: FalsifyConfig =
            toml::from_str("[pool]\ncapacity = 2\n").expect("parse partial config");
        assert_eq!(parsed.pool.capacity, 2);
        assert_eq!(parsed.pool.name_prefix, "pool-wt");
        assert_eq!(parsed.execution.max_concurrent, 5);
    }

    #[test]
    #[serial]
    fn test_env_overrides_replace_fields() {
        clear_env();
        set_env(ENV_POOL_CAPACITY, "7");
        set_env(ENV_MAX_CONCURRENT, " 3 ");
        set_env(ENV_TEST_TIMEOUT, "42");

        let mut config = FalsifyConfig::default();
        let applied = config.apply_env_overrides();
        clear_env();

        assert!(applied.is_ok());
        assert_eq!(config.pool.capacity, 7);
        assert_eq!(config.execution.max_concurrent, 3);
        assert_eq!(config.execution.test_timeout(), Duration::from_secs(42));
    }

    #[test]
    #[serial]
    fn test_env_overrides_leave_unset_fields() {
        clear_env();
        set_env(ENV_TEST_TIMEOUT, "9");

        let mut config = FalsifyConfig::default();
        let applied = config.apply_env_overrides();
        clear_env();

        assert!(applied.is_ok());
        assert_eq!(config.pool.capacity, 10);
        assert_eq!(config.execution.max_concurrent, 5);
        assert_eq!(config.execution.test_timeout_secs, 9);
    }

    #[test]
    #[serial]
    fn test_unparsable_env_override_is_config_error() {
        clear_env();
        set_env(ENV_POOL_CAPACITY, "abc");

        let mut config = FalsifyConfig::default();
        let applied = config.apply_env_overrides();
        clear_env();

        assert!(matches!(applied, Err(Error::Config(_))));
        assert_eq!(config.pool.capacity, 10);
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let mut config = FalsifyConfig::default();
        config.pool.capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = FalsifyConfig::default();
        config.overhead.per_snapshot_secs = -1.0;
        assert!(config.validate().is_err());

        let mut config = FalsifyConfig::default();
        config.execution.output_limit_bytes = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_dir_is_under_snapshot_root() {
        let config = PoolConfig {
            snapshot_root: PathBuf::from("/tmp/wt"),
            ..PoolConfig::default()
        };
        assert_eq!(config.pool_dir(Path::new("/repo")), PathBuf::from("/tmp/wt/pool"));
        assert_eq!(
            config.resolved_root(Path::new("/repo")),
            PathBuf::from("/tmp/wt")
        );

        let relative = PoolConfig::default();
        assert_eq!(
            relative.resolved_root(Path::new("/repo")),
            PathBuf::from("/repo/.falsify/worktrees")
        );
        assert_eq!(
            relative.pool_dir(Path::new("/repo")),
            PathBuf::from("/repo/.falsify/worktrees/pool")
        );
    }
}
