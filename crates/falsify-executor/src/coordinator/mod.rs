//! Break-even analysis and bounded fan-out of hypothesis passes.
//!
//! Each pass goes `Pending -> Leased -> Completed(outcome) -> Released`. The
//! snapshot is returned on every exit path, including panics in the runner,
//! because the workspace guard releases on drop.

mod artifacts;
mod break_even;
mod workspace;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use falsify_core::{
    Error, ExecutionResult, FallbackPolicy, FalsifyConfig, Hypothesis, Outcome, PassState,
    Result, TestRunner, VcsAdapter,
};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio::time;
use tracing::{Instrument as _, debug, error, info, info_span, warn};

use crate::engine::ExecutionEngine;
use crate::pool::SnapshotPool;
use workspace::{DirectSnapshot, Workspace};

pub use artifacts::ARTIFACT_DIR;
pub use break_even::{BreakEvenModel, ParallelDecision};

/// Everything a single pass needs, shared by all workers of a batch.
struct PassContext {
    repo: PathBuf,
    snapshot_root: PathBuf,
    direct_prefix: String,
    pool: Option<Arc<SnapshotPool>>,
    vcs: Arc<dyn VcsAdapter>,
    runner: Arc<dyn TestRunner>,
    timeout: Duration,
    fallback: FallbackPolicy,
}

/// Decides whether a batch is worth fanning out and runs it.
pub struct ParallelCoordinator {
    context: Arc<PassContext>,
    max_concurrent: usize,
    break_even: BreakEvenModel,
}

impl ParallelCoordinator {
    /// Coordinator over explicit collaborators.
    ///
    /// Without a pool every pass runs in a direct snapshot.
    #[must_use]
    pub fn new(
        repo: &Path,
        config: &FalsifyConfig,
        pool: Option<Arc<SnapshotPool>>,
        vcs: Arc<dyn VcsAdapter>,
        runner: Arc<dyn TestRunner>,
    ) -> Self {
        Self {
            context: Arc::new(PassContext {
                repo: repo.to_path_buf(),
                snapshot_root: config.pool.resolved_root(repo),
                direct_prefix: config.direct_prefix.clone(),
                pool,
                vcs,
                runner,
                timeout: config.execution.test_timeout(),
                fallback: config.fallback.clone(),
            }),
            max_concurrent: config.execution.max_concurrent.max(1),
            break_even: BreakEvenModel::from(&config.overhead),
        }
    }

    /// Coordinator with a pool opened from `config` and an [`ExecutionEngine`].
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the pool cannot be opened.
    pub fn from_config(
        repo: &Path,
        config: &FalsifyConfig,
        vcs: Arc<dyn VcsAdapter>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = if config.pool.enabled {
            Some(SnapshotPool::open(repo, &config.pool, Arc::clone(&vcs))?)
        } else {
            info!("Snapshot pool disabled, every pass uses a direct snapshot");
            None
        };
        let runner = Arc::new(ExecutionEngine::new(&config.execution));
        Ok(Self::new(repo, config, pool, vcs, runner))
    }

    /// The pool passes lease from, if pooling is enabled.
    #[must_use]
    pub fn pool(&self) -> Option<&Arc<SnapshotPool>> {
        self.context.pool.as_ref()
    }

    /// Break-even analysis for a batch.
    #[must_use]
    pub fn plan(&self, hypotheses: &[Hypothesis]) -> ParallelDecision {
        let durations: Vec<f64> = hypotheses
            .iter()
            .map(|hypothesis| hypothesis.estimated_duration_secs)
            .collect();
        self.break_even.decide(&durations)
    }

    /// Whether running the batch concurrently is expected to be faster.
    #[must_use]
    pub fn should_parallelize(&self, hypotheses: &[Hypothesis]) -> bool {
        self.plan(hypotheses).parallelize
    }

    /// Run every hypothesis and return one result each, in completion order.
    ///
    /// Invalid and duplicate hypotheses are classified ERROR without touching the
    /// pool. Pool state is persisted once the batch is done.
    pub async fn dispatch(&self, hypotheses: Vec<Hypothesis>) -> Vec<ExecutionResult> {
        let decision = self.plan(&hypotheses);
        let workers = if decision.parallelize {
            self.max_concurrent.min(hypotheses.len())
        } else {
            1
        };
        info!(
            "Dispatching {} hypotheses with {workers} workers (sequential {:.0}s, parallel {:.0}s)",
            hypotheses.len(),
            decision.sequential_secs,
            decision.parallel_secs
        );

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut results = Vec::with_capacity(hypotheses.len());
        let mut tasks = JoinSet::new();
        let mut task_owners = HashMap::new();
        let mut seen = HashSet::new();

        for hypothesis in hypotheses {
            if let Err(error) = hypothesis.validate() {
                warn!("Rejecting hypothesis: {error}");
                results.push(ExecutionResult::error(
                    hypothesis.id,
                    error.to_string(),
                    Duration::ZERO,
                ));
                continue;
            }
            if !seen.insert(hypothesis.id.clone()) {
                warn!("Duplicate hypothesis id {}", hypothesis.id);
                let message = format!("Duplicate hypothesis id {} in batch", hypothesis.id);
                results.push(ExecutionResult::error(hypothesis.id, message, Duration::ZERO));
                continue;
            }

            let context = Arc::clone(&self.context);
            let semaphore = Arc::clone(&semaphore);
            let owner = hypothesis.id.clone();
            let handle = tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                run_pass(context, hypothesis).await
            });
            task_owners.insert(handle.id(), owner);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, result)) => results.push(result),
                Err(join_error) => {
                    let owner = task_owners.remove(&join_error.id()).unwrap_or_default();
                    error!("Pass for {owner} aborted: {join_error}");
                    results.push(ExecutionResult::error(
                        owner,
                        format!("Pass aborted: {join_error}"),
                        Duration::ZERO,
                    ));
                }
            }
        }

        self.persist_pool().await;
        results
    }

    async fn persist_pool(&self) {
        let Some(pool) = self.context.pool.clone() else {
            return;
        };
        match task::spawn_blocking(move || pool.persist()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!("Failed to persist pool state: {error}"),
            Err(error) => warn!("Pool persistence task failed: {error}"),
        }
    }
}

fn transition(state: PassState) {
    debug!("-> {state}");
}

async fn run_pass(context: Arc<PassContext>, hypothesis: Hypothesis) -> ExecutionResult {
    let span = info_span!("pass", hypothesis = %hypothesis.id);
    async move {
        let started = Instant::now();
        transition(PassState::Pending);

        let workspace = match obtain(&context, &hypothesis.id).await {
            Ok(workspace) => workspace,
            Err(error) => {
                error!("No snapshot: {error}");
                transition(PassState::Completed(Outcome::Error));
                transition(PassState::Released);
                return ExecutionResult::error(hypothesis.id, error.to_string(), started.elapsed());
            }
        };
        transition(PassState::Leased);

        let result = execute_in(&context, &hypothesis, workspace.path()).await;
        transition(PassState::Completed(result.outcome));

        let path = workspace.path().to_path_buf();
        let source = workspace.source();
        if let Err(error) = task::spawn_blocking(move || workspace.finish()).await {
            error!("Releasing snapshot failed: {error}");
        }
        transition(PassState::Released);

        result.with_snapshot(path, source)
    }
    .instrument(span)
    .await
}

async fn execute_in(context: &PassContext, hypothesis: &Hypothesis, path: &Path) -> ExecutionResult {
    match artifacts::materialize(hypothesis, path, context.timeout) {
        Ok(command) => {
            context
                .runner
                .run(&hypothesis.id, path, &command, context.timeout)
                .await
        }
        Err(error) => ExecutionResult::error(
            hypothesis.id.clone(),
            format!("Failed to write test artifacts: {error}"),
            Duration::ZERO,
        ),
    }
}

/// Lease from the pool, applying the fallback policy when it is exhausted.
async fn obtain(context: &Arc<PassContext>, hypothesis_id: &str) -> Result<Workspace> {
    let Some(pool) = context.pool.as_ref() else {
        return direct(context, hypothesis_id).await;
    };

    let mut retries = 0;
    loop {
        let pool = Arc::clone(pool);
        let id = hypothesis_id.to_owned();
        let leased = task::spawn_blocking(move || pool.lease(&id))
            .await
            .map_err(|error| Error::Other(format!("Lease task failed: {error}")))?;

        match leased {
            Ok(lease) => return Ok(Workspace::Pooled(lease)),
            Err(error) if error.is_pool_exhausted() => match context.fallback {
                FallbackPolicy::Direct => {
                    warn!("{error}, falling back to a direct snapshot");
                    return direct(context, hypothesis_id).await;
                }
                FallbackPolicy::Backoff { attempts, delay_ms } if retries < attempts => {
                    retries += 1;
                    debug!("{error}, retry {retries}/{attempts} in {delay_ms}ms");
                    time::sleep(Duration::from_millis(delay_ms)).await;
                }
                FallbackPolicy::Backoff { .. } => return Err(error),
            },
            Err(error) => return Err(error),
        }
    }
}

async fn direct(context: &Arc<PassContext>, hypothesis_id: &str) -> Result<Workspace> {
    let context = Arc::clone(context);
    let id = hypothesis_id.to_owned();
    task::spawn_blocking(move || {
        DirectSnapshot::create(
            &context.repo,
            &context.snapshot_root,
            &context.direct_prefix,
            &id,
            Arc::clone(&context.vcs),
        )
    })
    .await
    .map_err(|error| Error::Other(format!("Direct snapshot task failed: {error}")))?
    .map(Workspace::Direct)
}
