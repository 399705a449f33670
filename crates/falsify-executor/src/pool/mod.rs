//! Bounded pool of reusable snapshots.
//!
//! Every state change happens under one mutex, including the synchronous
//! create and reset calls into the [`VcsAdapter`]. Async callers reach the pool
//! through `spawn_blocking`.

mod lease;
mod state;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use falsify_core::{Error, PoolConfig, Result, VcsAdapter};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub use lease::SnapshotLease;
pub use state::PoolState;

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Snapshots owned by the pool
    pub total: usize,
    /// Idle snapshots
    pub available: usize,
    /// Snapshots currently leased
    pub leased: usize,
    /// Maximum number of snapshots
    pub capacity: usize,
    /// `total / capacity` as a percentage
    pub utilization_percent: f64,
}

#[derive(Debug, Default)]
struct PoolInner {
    capacity: usize,
    available: BTreeSet<String>,
    leases: HashMap<String, String>,
}

impl PoolInner {
    fn total(&self) -> usize {
        self.available.len() + self.leases.len()
    }

    /// Lowest ordinal whose name is not owned by the pool.
    fn next_name(&self, prefix: &str) -> String {
        let owned: BTreeSet<&str> = self
            .available
            .iter()
            .chain(self.leases.values())
            .map(String::as_str)
            .collect();
        (0_usize..)
            .map(|ordinal| format!("{prefix}-{ordinal:03}"))
            .find(|name| !owned.contains(name.as_str()))
            .unwrap_or_else(|| format!("{prefix}-overflow"))
    }
}

/// Capacity-bounded collection of isolated working copies of one repository.
pub struct SnapshotPool {
    repo: PathBuf,
    identity: String,
    pool_dir: PathBuf,
    prefix: String,
    vcs: Arc<dyn VcsAdapter>,
    inner: Mutex<PoolInner>,
}

impl fmt::Debug for SnapshotPool {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SnapshotPool")
            .field("repo", &self.repo)
            .field("pool_dir", &self.pool_dir)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl SnapshotPool {
    /// Open a pool for `repo`, loading persisted state when `auto_load` is set.
    ///
    /// A relative `snapshot_root` is resolved against `repo`. Unusable persisted
    /// state is logged and discarded.
    ///
    /// # Errors
    /// Returns an error if the capacity is zero or the pool directory cannot be created.
    pub fn open(repo: &Path, config: &PoolConfig, vcs: Arc<dyn VcsAdapter>) -> Result<Arc<Self>> {
        if config.capacity == 0 {
            return Err(Error::Config("pool capacity must be >= 1".to_owned()));
        }

        let pool_dir = config.pool_dir(repo);
        fs::create_dir_all(&pool_dir)?;

        let identity = repo
            .canonicalize()
            .unwrap_or_else(|_| repo.to_path_buf())
            .display()
            .to_string();

        let pool = Arc::new(Self {
            repo: repo.to_path_buf(),
            identity,
            pool_dir,
            prefix: config.name_prefix.clone(),
            vcs,
            inner: Mutex::new(PoolInner {
                capacity: config.capacity,
                ..PoolInner::default()
            }),
        });

        if config.auto_load {
            match pool.load() {
                Ok(true) => info!("Loaded snapshot pool state: {:?}", pool.stats()),
                Ok(false) => debug!("Starting with an empty snapshot pool"),
                Err(error) => warn!("Ignoring unusable pool state: {error}"),
            }
        }

        Ok(pool)
    }

    /// Directory holding the pooled snapshots and the state file.
    #[must_use]
    pub fn pool_dir(&self) -> &Path {
        &self.pool_dir
    }

    /// Repository the snapshots are cut from.
    #[must_use]
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.pool_dir.join(name)
    }

    fn state_path(&self) -> PathBuf {
        PoolState::path_for(&self.pool_dir)
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease a clean snapshot to `hypothesis_id`.
    ///
    /// Calling again for a hypothesis that already holds a lease returns the same
    /// path without resetting it.
    ///
    /// # Errors
    /// Returns `Error::PoolExhausted` when every snapshot is leased and the pool is
    /// at capacity, or `Error::PoolOperation` when a snapshot could not be created
    /// or reset. Nothing is leased on error.
    pub fn acquire(&self, hypothesis_id: &str) -> Result<PathBuf> {
        let mut inner = self.lock();

        if let Some(name) = inner.leases.get(hypothesis_id).cloned() {
            let path = self.snapshot_path(&name);
            if path.is_dir() {
                debug!("{hypothesis_id} already holds {name}");
                return Ok(path);
            }
            warn!("Leased snapshot {name} is missing, recreating");
            return match self.create_snapshot(&name) {
                Ok(path) => Ok(path),
                Err(error) => {
                    inner.leases.remove(hypothesis_id);
                    Err(error)
                }
            };
        }

        let name = if let Some(name) = inner.available.pop_first() {
            debug!("Reusing snapshot {name}");
            name
        } else if inner.total() < inner.capacity {
            let name = inner.next_name(&self.prefix);
            self.create_snapshot(&name)?;
            info!(
                "Created snapshot {name} ({}/{})",
                inner.total() + 1,
                inner.capacity
            );
            name
        } else {
            return Err(Error::PoolExhausted {
                capacity: inner.capacity,
                leased: inner.leases.len(),
            });
        };

        let path = self.prepare(&name)?;
        inner
            .leases
            .insert(hypothesis_id.to_owned(), name.clone());
        info!("Leased {name} to {hypothesis_id}");
        Ok(path)
    }

    /// Lease a snapshot wrapped in a guard that releases it on drop.
    ///
    /// # Errors
    /// Same as [`SnapshotPool::acquire`].
    pub fn lease(self: &Arc<Self>, hypothesis_id: &str) -> Result<SnapshotLease> {
        let path = self.acquire(hypothesis_id)?;
        Ok(SnapshotLease::new(
            Arc::clone(self),
            hypothesis_id.to_owned(),
            path,
        ))
    }

    /// Return the snapshot leased to `hypothesis_id` to the free list.
    ///
    /// Returns `false` if the hypothesis held no lease.
    pub fn release(&self, hypothesis_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.leases.remove(hypothesis_id) {
            Some(name) => {
                info!("Released {name} from {hypothesis_id}");
                inner.available.insert(name);
                true
            }
            None => {
                warn!("No lease held by {hypothesis_id}");
                false
            }
        }
    }

    /// Create up to `count` idle snapshots without exceeding capacity.
    ///
    /// Returns how many were added.
    pub fn expand(&self, count: usize) -> usize {
        let mut inner = self.lock();
        let mut added = 0;
        for _ in 0..count {
            if inner.total() >= inner.capacity {
                warn!("Cannot expand pool: at capacity {}", inner.capacity);
                break;
            }
            let name = inner.next_name(&self.prefix);
            if let Err(error) = self.create_snapshot(&name) {
                error!("Failed to expand pool: {error}");
                break;
            }
            inner.available.insert(name);
            added += 1;
        }
        info!("Expanded pool by {added} (total: {})", inner.total());
        added
    }

    /// Remove up to `count` idle snapshots. Leased snapshots are never touched.
    ///
    /// Returns how many were removed.
    pub fn shrink(&self, count: usize) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;
        for _ in 0..count {
            let Some(name) = inner.available.pop_last() else {
                debug!("No idle snapshots left to remove");
                break;
            };
            let path = self.snapshot_path(&name);
            self.vcs.remove(&self.repo, &path, true);
            if path.exists() {
                warn!("Could not remove {name}, keeping it");
                inner.available.insert(name);
                break;
            }
            removed += 1;
        }
        info!("Shrunk pool by {removed} (total: {})", inner.total());
        removed
    }

    /// Write the current state to the state file.
    ///
    /// # Errors
    /// Returns `Error::Persistence` if the file cannot be written.
    pub fn persist(&self) -> Result<()> {
        let inner = self.lock();
        let state = PoolState {
            pool_dir: self.pool_dir.clone(),
            repo_identity: self.identity.clone(),
            capacity: inner.capacity,
            available: inner.available.iter().cloned().collect(),
            leases: inner
                .leases
                .iter()
                .map(|(id, name)| (id.clone(), name.clone()))
                .collect::<BTreeMap<_, _>>(),
            total: inner.total(),
        };
        state.write(&self.state_path())?;
        debug!("Persisted pool state ({} snapshots)", state.total);
        Ok(())
    }

    /// Replace in-memory state with the persisted one.
    ///
    /// Returns `Ok(false)` if there was no usable state: no file, a different
    /// owning repository, or inconsistent contents. Idle snapshots whose
    /// directories are gone are dropped; leases are kept and their snapshots are
    /// recreated on the next acquire.
    ///
    /// # Errors
    /// Returns `Error::Persistence` if the state file exists but cannot be parsed.
    pub fn load(&self) -> Result<bool> {
        let mut inner = self.lock();
        let Some(state) = PoolState::read(&self.state_path())? else {
            return Ok(false);
        };

        if state.repo_identity != self.identity {
            warn!(
                "Pool state belongs to {}, not {}; discarding it",
                state.repo_identity, self.identity
            );
            return Ok(false);
        }
        if let Err(error) = state.check_invariants() {
            warn!("Discarding inconsistent pool state: {error}");
            return Ok(false);
        }

        inner.capacity = inner.capacity.max(state.capacity);
        inner.available = state
            .available
            .into_iter()
            .filter(|name| {
                let exists = self.snapshot_path(name).is_dir();
                if !exists {
                    warn!("Snapshot {name} no longer exists, dropping it");
                }
                exists
            })
            .collect();
        inner.leases = state.leases.into_iter().collect();
        Ok(true)
    }

    /// Counters read under the pool lock.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        let total = inner.total();
        let utilization_percent = if inner.capacity == 0 {
            0.0
        } else {
            total as f64 / inner.capacity as f64 * 100.0
        };
        PoolStats {
            total,
            available: inner.available.len(),
            leased: inner.leases.len(),
            capacity: inner.capacity,
            utilization_percent,
        }
    }

    /// Remove every snapshot, forget all leases, and delete the state file.
    pub fn teardown(&self) {
        let mut inner = self.lock();
        let names: Vec<String> = inner
            .available
            .iter()
            .chain(inner.leases.values())
            .cloned()
            .collect();
        for name in &names {
            self.vcs.remove(&self.repo, &self.snapshot_path(name), true);
        }
        inner.available.clear();
        inner.leases.clear();

        match fs::remove_file(self.state_path()) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Failed to delete pool state: {error}"),
        }
        info!("Tore down pool ({} snapshots)", names.len());
    }

    /// Create a snapshot directory, retrying once after a forced removal.
    fn create_snapshot(&self, name: &str) -> Result<PathBuf> {
        let path = self.snapshot_path(name);
        match self.vcs.create(&self.repo, &path, None) {
            Ok(path) => Ok(path),
            Err(first) => {
                warn!("Creating {name} failed ({first}), retrying");
                self.vcs.remove(&self.repo, &path, true);
                self.vcs
                    .create(&self.repo, &path, None)
                    .map_err(|error| Error::PoolOperation(format!("create {name}: {error}")))
            }
        }
    }

    /// Reset a snapshot to clean HEAD, recreating it once if the reset fails.
    ///
    /// On failure the snapshot is removed and no longer owned by the pool.
    fn prepare(&self, name: &str) -> Result<PathBuf> {
        let path = self.snapshot_path(name);
        let Err(reset_error) = self.vcs.reset(&path) else {
            return Ok(path);
        };

        warn!("Reset of {name} failed ({reset_error}), recreating");
        self.vcs.remove(&self.repo, &path, true);
        let recreated = self
            .vcs
            .create(&self.repo, &path, None)
            .and_then(|path| self.vcs.reset(&path).map(|()| path));
        match recreated {
            Ok(path) => Ok(path),
            Err(error) => {
                error!("Dropping snapshot {name}: {error}");
                self.vcs.remove(&self.repo, &path, true);
                Err(Error::PoolOperation(format!("reset {name}: {error}")))
            }
        }
    }
}
