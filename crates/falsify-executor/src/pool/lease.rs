use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::SnapshotPool;
use crate::cleanup_blocking;

/// Exclusive hold on a pooled snapshot, returned to the pool on drop.
///
/// Dropping takes the pool lock, which an in-flight create or reset may hold
/// for seconds. Async callers should prefer [`SnapshotLease::release`] on a
/// blocking thread; a drop on a runtime worker is moved off it.
#[derive(Debug)]
pub struct SnapshotLease {
    pool: Arc<SnapshotPool>,
    hypothesis_id: String,
    path: PathBuf,
    released: bool,
}

impl SnapshotLease {
    pub(super) fn new(pool: Arc<SnapshotPool>, hypothesis_id: String, path: PathBuf) -> Self {
        Self {
            pool,
            hypothesis_id,
            path,
            released: false,
        }
    }

    /// Root of the leased snapshot.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hypothesis holding the lease.
    #[must_use]
    pub fn hypothesis_id(&self) -> &str {
        &self.hypothesis_id
    }

    /// Return the snapshot now. Returns whether a lease was still recorded.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.pool.release(&self.hypothesis_id)
    }
}

impl Drop for SnapshotLease {
    fn drop(&mut self) {
        if !self.released {
            let pool = &self.pool;
            let id = &self.hypothesis_id;
            cleanup_blocking(|| {
                pool.release(id);
            });
        }
    }
}
