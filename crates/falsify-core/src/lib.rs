//! Core types and traits for parallel hypothesis falsification.
//!
//! This crate holds the data model shared by the snapshot pool, the execution
//! engine and the coordinator, together with the error taxonomy, the TOML
//! configuration, and the two seams (`VcsAdapter`, `TestRunner`) the executor
//! crate plugs real implementations into.

/// Configuration sections and loading.
pub mod config;
/// Error types and result definitions.
pub mod error;
/// Seam traits for version control and test execution.
pub mod traits;
/// Hypotheses, outcomes, and execution records.
pub mod types;

pub use config::{
    ExecutionConfig, FallbackPolicy, FalsifyConfig, OverheadConfig, PoolConfig,
};
pub use error::{Error, Result};
pub use traits::{TestRunner, VcsAdapter};
pub use types::{
    ERROR_EXIT_CODE, ExecutionResult, Hypothesis, Outcome, PassState, SnapshotSource,
    TIMEOUT_EXIT_CODE, TestCommand, Verdict,
};
