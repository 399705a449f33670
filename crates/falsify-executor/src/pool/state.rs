//! On-disk pool bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

use falsify_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

/// Persisted snapshot pool state, stored as JSON inside the pool directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    /// Directory the snapshots live in
    pub pool_dir: PathBuf,
    /// Canonical path of the repository the snapshots were cut from
    pub repo_identity: String,
    /// Pool capacity at the time of writing
    pub capacity: usize,
    /// Names of idle snapshots
    pub available: Vec<String>,
    /// Hypothesis id to leased snapshot name
    pub leases: BTreeMap<String, String>,
    /// Number of snapshots the pool owned
    pub total: usize,
}

impl PoolState {
    /// State file name inside the pool directory.
    pub const FILE_NAME: &'static str = ".snapshot_pool.json";

    /// Location of the state file for `pool_dir`.
    #[must_use]
    pub fn path_for(pool_dir: &Path) -> PathBuf {
        pool_dir.join(Self::FILE_NAME)
    }

    /// Read the state file, returning `None` if it does not exist.
    ///
    /// # Errors
    /// Returns `Error::Persistence` if the file is unreadable or not valid state.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(Error::Persistence(format!(
                    "Failed to read {}: {error}",
                    path.display()
                )));
            }
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|error| Error::Persistence(format!("Corrupt pool state: {error}")))
    }

    /// Write the state file atomically by renaming a sibling temp file over it.
    ///
    /// # Errors
    /// Returns `Error::Persistence` if the file cannot be written.
    pub fn write(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| Error::Persistence(format!("{} has no parent", path.display())))?;
        fs::create_dir_all(dir)
            .map_err(|error| Error::Persistence(format!("Failed to create pool dir: {error}")))?;

        let json = serde_json::to_vec_pretty(self)?;
        let mut file = NamedTempFile::new_in(dir)
            .map_err(|error| Error::Persistence(format!("Failed to create temp file: {error}")))?;
        file.write_all(&json)
            .map_err(|error| Error::Persistence(format!("Failed to write pool state: {error}")))?;
        file.persist(path)
            .map_err(|error| Error::Persistence(format!("Failed to replace pool state: {error}")))?;
        Ok(())
    }

    /// Check that the recorded sets are consistent with each other.
    ///
    /// # Errors
    /// Returns `Error::Persistence` describing the first violation.
    pub fn check_invariants(&self) -> Result<()> {
        let available: BTreeSet<&String> = self.available.iter().collect();
        if available.len() != self.available.len() {
            return Err(Error::Persistence(
                "available list contains duplicates".to_owned(),
            ));
        }

        let leased: BTreeSet<&String> = self.leases.values().collect();
        if leased.len() != self.leases.len() {
            return Err(Error::Persistence(
                "one snapshot is leased to several hypotheses".to_owned(),
            ));
        }

        if let Some(name) = available.intersection(&leased).next() {
            return Err(Error::Persistence(format!(
                "{name} is both available and leased"
            )));
        }

        let owned = available.len() + leased.len();
        if owned > self.total || self.total > self.capacity {
            return Err(Error::Persistence(format!(
                "inconsistent counts: {owned} owned, total {}, capacity {}",
                self.total, self.capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, reason = "Test code is allowed to use expect")]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> PoolState {
        PoolState {
            pool_dir: PathBuf::from("/work/.falsify/worktrees/pool"),
            repo_identity: "/work".to_owned(),
            capacity: 3,
            available: vec!["pool-wt-001".to_owned()],
            leases: BTreeMap::from([("h1".to_owned(), "pool-wt-000".to_owned())]),
            total: 2,
        }
    }

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().expect("temp dir");
        let path = PoolState::path_for(&temp.path().join("pool"));
        let state = sample();

        state.write(&path).expect("write state");
        let loaded = PoolState::read(&path)
            .expect("read state")
            .expect("state file present after write");
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_missing_file_is_none() {
        let temp = TempDir::new().expect("temp dir");
        let result = PoolState::read(&temp.path().join(PoolState::FILE_NAME));
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_corrupt_file_is_persistence_error() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join(PoolState::FILE_NAME);
        fs::write(&path, "{ not json").expect("write junk");
        assert!(matches!(PoolState::read(&path), Err(Error::Persistence(_))));
    }

    #[test]
    fn test_invariants() {
        assert!(sample().check_invariants().is_ok());

        let mut overlapping = sample();
        overlapping.available.push("pool-wt-000".to_owned());
        assert!(overlapping.check_invariants().is_err());

        let mut over_capacity = sample();
        over_capacity.total = 4;
        assert!(over_capacity.check_invariants().is_err());

        let mut double_lease = sample();
        double_lease
            .leases
            .insert("h2".to_owned(), "pool-wt-000".to_owned());
        assert!(double_lease.check_invariants().is_err());
    }
}
