//! Snapshot pooling and parallel execution for hypothesis falsification.
//!
//! A [`SnapshotPool`] hands out isolated, reusable Git worktrees under a single
//! lock and persists its bookkeeping between runs. The [`ExecutionEngine`] runs
//! a test command inside a leased snapshot under a hard timeout and classifies
//! the outcome. The [`ParallelCoordinator`] decides whether a batch is worth
//! fanning out and returns one result per hypothesis.

pub mod coordinator;
pub mod engine;
pub mod git;
pub mod pool;

pub use coordinator::{BreakEvenModel, ParallelCoordinator, ParallelDecision};
pub use engine::ExecutionEngine;
pub use git::GitAdapter;
pub use pool::{PoolState, PoolStats, SnapshotLease, SnapshotPool};

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task;

/// Run blocking cleanup from a destructor.
///
/// On a multi-threaded runtime worker the cleanup goes through
/// `block_in_place`, so tasks queued on that worker move elsewhere while the
/// pool lock or a VCS call is awaited. Elsewhere it runs inline.
pub(crate) fn cleanup_blocking<F: FnOnce()>(cleanup: F) {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            task::block_in_place(cleanup);
        }
        _ => cleanup(),
    }
}
