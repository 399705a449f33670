//! Shared fixtures for falsify-executor integration tests
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::tests_outside_test_module,
        reason = "Test allows"
    )
)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use falsify_core::{Error, PoolConfig, Result, VcsAdapter};
use falsify_executor::SnapshotPool;
use tempfile::TempDir;
use tracing_subscriber::{EnvFilter, fmt};

const README: &str = "README";

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests (idempotent).
/// Honors `RUST_LOG` if set, otherwise defaults to "debug".
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_owned());
        if fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_test_writer()
            .try_init()
            .is_err()
        {
            // tracing already initialized in this process
        }
    });
}

/// Directory-backed stand-in for git.
///
/// `create` makes a directory holding a tracked `README`; `reset` deletes
/// everything else. Failures can be queued per operation.
#[derive(Debug, Default)]
pub struct FakeVcs {
    pub creates: AtomicUsize,
    pub resets: AtomicUsize,
    pub removes: AtomicUsize,
    pub failing_creates: AtomicUsize,
    pub failing_resets: AtomicUsize,
}

impl FakeVcs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` reset calls fail.
    pub fn fail_resets(&self, count: usize) {
        self.failing_resets.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` create calls fail.
    pub fn fail_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl VcsAdapter for FakeVcs {
    fn current_branch(&self, _repo: &Path) -> Result<String> {
        Ok("main".to_owned())
    }

    fn create(&self, _repo: &Path, path: &Path, _branch: Option<&str>) -> Result<PathBuf> {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        if Self::take_failure(&self.failing_creates) {
            return Err(Error::Vcs {
                operation: "fake create",
                message: "injected failure".to_owned(),
            });
        }
        fs::create_dir_all(path)?;
        fs::write(path.join(README), "tracked\n")?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(path.to_path_buf())
    }

    fn reset(&self, path: &Path) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_resets) {
            return Err(Error::Vcs {
                operation: "fake reset",
                message: "injected failure".to_owned(),
            });
        }
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_name() == README {
                continue;
            }
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn remove(&self, _repo: &Path, path: &Path, _force: bool) {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if path.exists() && fs::remove_dir_all(path).is_err() {
            // best-effort, like the real adapter
        }
    }
}

/// Temporary repository plus a snapshot root outside it.
pub struct Fixture {
    pub temp: TempDir,
    pub repo: PathBuf,
    pub snapshot_root: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        let temp = TempDir::new().expect("temp dir");
        let repo = temp.path().join("repo");
        fs::create_dir_all(&repo).expect("create repo dir");
        let snapshot_root = temp.path().join("snapshots");
        Self {
            temp,
            repo,
            snapshot_root,
        }
    }

    pub fn pool_config(&self, capacity: usize) -> PoolConfig {
        PoolConfig {
            snapshot_root: self.snapshot_root.clone(),
            capacity,
            auto_load: false,
            ..PoolConfig::default()
        }
    }

    pub fn open_pool(&self, config: &PoolConfig, vcs: &Arc<FakeVcs>) -> Arc<SnapshotPool> {
        let vcs: Arc<dyn VcsAdapter> = Arc::<FakeVcs>::clone(vcs);
        SnapshotPool::open(&self.repo, config, vcs).expect("open pool")
    }
}
