use falsify_core::OverheadConfig;
use serde::{Deserialize, Serialize};

/// Fan-out cost model: `overhead(n) = base + per_snapshot * n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakEvenModel {
    /// Fixed cost of a parallel batch in seconds
    pub base_secs: f64,
    /// Per-snapshot creation, reset, and bookkeeping cost in seconds
    pub per_snapshot_secs: f64,
}

impl Default for BreakEvenModel {
    fn default() -> Self {
        Self::from(&OverheadConfig::default())
    }
}

impl From<&OverheadConfig> for BreakEvenModel {
    fn from(config: &OverheadConfig) -> Self {
        Self {
            base_secs: config.base_secs,
            per_snapshot_secs: config.per_snapshot_secs,
        }
    }
}

/// Outcome of the break-even analysis for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParallelDecision {
    /// Number of hypotheses in the batch
    pub batch_size: usize,
    /// Sum of estimated durations
    pub sequential_secs: f64,
    /// Longest estimated duration plus overhead
    pub parallel_secs: f64,
    /// `overhead(batch_size)`
    pub overhead_secs: f64,
    /// Whether fanning out is expected to be faster
    pub parallelize: bool,
}

impl ParallelDecision {
    /// Expected wall-clock saving of the chosen mode, zero when running sequentially.
    #[must_use]
    pub fn time_saved_secs(&self) -> f64 {
        if self.parallelize {
            self.sequential_secs - self.parallel_secs
        } else {
            0.0
        }
    }
}

impl BreakEvenModel {
    /// Estimated fan-out cost for `count` snapshots.
    #[must_use]
    pub fn overhead(&self, count: usize) -> f64 {
        let count = count as f64;
        self.per_snapshot_secs.mul_add(count, self.base_secs)
    }

    /// Compare sequential and parallel cost for the given estimated durations.
    ///
    /// Non-finite or negative estimates count as zero.
    #[must_use]
    pub fn decide(&self, durations: &[f64]) -> ParallelDecision {
        let clean = || {
            durations
                .iter()
                .map(|secs| if secs.is_finite() && *secs > 0.0 { *secs } else { 0.0 })
        };
        let sequential_secs: f64 = clean().sum();
        let longest = clean().fold(0.0, f64::max);
        let overhead_secs = self.overhead(durations.len());
        let parallel_secs = longest + overhead_secs;

        ParallelDecision {
            batch_size: durations.len(),
            sequential_secs,
            parallel_secs,
            overhead_secs,
            parallelize: durations.len() > 1 && parallel_secs < sequential_secs,
        }
    }
}
