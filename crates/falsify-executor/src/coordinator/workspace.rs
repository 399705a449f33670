use std::path::{Path, PathBuf};
use std::sync::Arc;

use falsify_core::{Error, Result, SnapshotSource, VcsAdapter};
use tracing::{info, warn};

use crate::cleanup_blocking;
use crate::pool::SnapshotLease;

/// Unpooled snapshot created when the pool is exhausted or disabled.
///
/// Removed when finished or dropped. Removal runs `git worktree remove`, so a
/// drop on a runtime worker is moved off it.
pub struct DirectSnapshot {
    repo: PathBuf,
    path: PathBuf,
    vcs: Arc<dyn VcsAdapter>,
    removed: bool,
}

impl DirectSnapshot {
    /// Create `<root>/<prefix>-<hypothesis_id>`, retrying once after a forced removal.
    pub fn create(
        repo: &Path,
        root: &Path,
        prefix: &str,
        hypothesis_id: &str,
        vcs: Arc<dyn VcsAdapter>,
    ) -> Result<Self> {
        let path = root.join(format!("{prefix}-{hypothesis_id}"));
        let attempt = |vcs: &dyn VcsAdapter| {
            vcs.create(repo, &path, None)
                .and_then(|created| vcs.reset(&created).map(|()| created))
        };

        let created = match attempt(vcs.as_ref()) {
            Ok(created) => created,
            Err(first) => {
                warn!("Direct snapshot {} failed ({first}), retrying", path.display());
                vcs.remove(repo, &path, true);
                attempt(vcs.as_ref()).map_err(|error| {
                    vcs.remove(repo, &path, true);
                    Error::PoolOperation(format!("direct snapshot {}: {error}", path.display()))
                })?
            }
        };

        info!("Created direct snapshot {}", created.display());
        Ok(Self {
            repo: repo.to_path_buf(),
            path: created,
            vcs,
            removed: false,
        })
    }

    fn remove(&mut self) {
        if !self.removed {
            self.removed = true;
            self.vcs.remove(&self.repo, &self.path, true);
        }
    }
}

impl Drop for DirectSnapshot {
    fn drop(&mut self) {
        if !self.removed {
            cleanup_blocking(|| self.remove());
        }
    }
}

/// Snapshot a pass runs in.
pub enum Workspace {
    /// Leased from the pool
    Pooled(SnapshotLease),
    /// Created for this pass only
    Direct(DirectSnapshot),
}

impl Workspace {
    pub fn path(&self) -> &Path {
        match self {
            Self::Pooled(lease) => lease.path(),
            Self::Direct(direct) => &direct.path,
        }
    }

    pub const fn source(&self) -> SnapshotSource {
        match self {
            Self::Pooled(_) => SnapshotSource::Pooled,
            Self::Direct(_) => SnapshotSource::Direct,
        }
    }

    /// Return a pooled snapshot or remove a direct one. Blocks on the VCS.
    pub fn finish(self) {
        match self {
            Self::Pooled(lease) => {
                let id = lease.hypothesis_id().to_owned();
                if !lease.release() {
                    warn!("Lease for {id} was already gone");
                }
            }
            Self::Direct(mut direct) => direct.remove(),
        }
    }
}
