//! Topological execution of a task graph on a bounded worker pool.
//!
//! Each node runs through an up-to-date check first: incremental nodes whose
//! input fingerprint (which folds in upstream output fingerprints) matches the
//! cached entry and whose outputs still exist are skipped. A failed node marks
//! everything downstream `not-run`; independent branches keep going.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use barrage_core::{
    BuildError, BuildSummary, CacheEntry, ExecutionResult, Fingerprint, FingerprintCache,
    ReportSummary, Result, TaskFailure, TaskId, TaskStatus,
};
use tokio::sync::Semaphore;
use tokio::task::{Id as JoinId, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::graph::{TaskGraph, TaskNode};

/// Output fingerprints of a node's upstream tasks.
pub type UpstreamOutputs = BTreeMap<TaskId, Fingerprint>;

/// What a node sees while executing.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Output fingerprints of every upstream node
    pub upstream: UpstreamOutputs,
    /// Fires on build-wide cancellation or a fatal failure elsewhere
    pub cancel: CancellationToken,
}

/// What a successfully executed node produced.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    /// Fingerprint of the produced output, folded into downstream inputs
    pub fingerprint: Fingerprint,
    /// Report summaries, for report nodes
    pub reports: Vec<ReportSummary>,
    /// Files or directories produced
    pub artifacts: Vec<PathBuf>,
}

impl NodeOutput {
    /// Output with only a fingerprint.
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            reports: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    /// Attaches report summaries.
    #[must_use]
    pub fn with_reports(mut self, reports: Vec<ReportSummary>) -> Self {
        self.reports = reports;
        self
    }

    /// Attaches produced artifacts.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<PathBuf>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// Performs the action behind each kind of task node.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Fingerprint of the node's declared inputs, or `None` if the node must
    /// always execute.
    ///
    /// # Errors
    /// Returns an error if the inputs cannot be resolved; the node then fails.
    async fn input_fingerprint(
        &self,
        node: &TaskNode,
        upstream: &UpstreamOutputs,
    ) -> Result<Option<Fingerprint>>;

    /// Whether the node's declared outputs still exist on disk.
    fn outputs_exist(&self, node: &TaskNode) -> bool;

    /// Executes the node.
    ///
    /// # Errors
    /// Returns the error that failed the node.
    async fn execute(&self, node: &TaskNode, context: NodeContext) -> Result<NodeOutput>;

    /// Per-task log file, if the node writes one.
    fn log_path(&self, _node: &TaskNode) -> Option<PathBuf> {
        None
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Maximum nodes executing at once
    pub max_workers: usize,
    /// Stop scheduling after the first failure of any kind
    pub abort_on_failure: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_workers: 1,
            abort_on_failure: false,
        }
    }
}

struct Completion {
    result: ExecutionResult,
    output: Option<Fingerprint>,
    fatal: bool,
}

/// Executes task graphs.
pub struct Scheduler {
    executor: Arc<dyn NodeExecutor>,
    cache: FingerprintCache,
    options: SchedulerOptions,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Scheduler running nodes through `executor`.
    pub fn new(
        executor: Arc<dyn NodeExecutor>,
        cache: FingerprintCache,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            executor,
            cache,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels the build when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute task graph with parallel execution
    ///
    /// # Errors
    /// Returns an error if the graph has cycles or acquiring a worker permit
    /// fails. Node failures are reported in the summary, not as errors.
    pub async fn execute(&self, graph: &TaskGraph) -> Result<BuildSummary> {
        let order = graph.topological_order()?;
        let max_workers = self.options.max_workers.max(1);
        let abort = self.cancel.child_token();

        let mut done = HashSet::new();
        let mut in_flight = HashSet::new();
        let mut running = HashMap::<JoinId, TaskId>::new();
        let mut outputs = HashMap::<TaskId, Fingerprint>::new();
        let mut statuses = HashMap::<TaskId, TaskStatus>::new();
        let mut results = HashMap::<TaskId, ExecutionResult>::new();
        let mut join_set = JoinSet::new();
        let semaphore = Arc::new(Semaphore::new(max_workers));

        loop {
            if abort.is_cancelled() {
                for node in graph.tasks() {
                    if !done.contains(&node.id) && !in_flight.contains(&node.id) {
                        debug!(task = %node.id, "Not running after cancellation");
                        Self::mark_not_run(&node.id, &mut done, &mut statuses, &mut results);
                    }
                }
            }

            // Marking a blocked node not-run can block its own dependents, so
            // rescan until nothing changes.
            loop {
                let mut changed = false;
                for node in graph.ready_tasks(&done) {
                    if in_flight.contains(&node.id) {
                        continue;
                    }

                    let blocked = node.upstream.iter().any(|upstream| {
                        !statuses
                            .get(upstream)
                            .is_some_and(|status| status.is_success())
                    });
                    if blocked {
                        debug!(task = %node.id, "Upstream did not succeed, marking not-run");
                        Self::mark_not_run(&node.id, &mut done, &mut statuses, &mut results);
                        changed = true;
                        continue;
                    }

                    if join_set.len() >= max_workers {
                        continue;
                    }

                    let upstream: UpstreamOutputs = node
                        .upstream
                        .iter()
                        .filter_map(|id| outputs.get(id).map(|output| (id.clone(), output.clone())))
                        .collect();
                    let context = NodeContext {
                        upstream,
                        cancel: abort.clone(),
                    };
                    let executor = Arc::clone(&self.executor);
                    let cache = self.cache.clone();
                    let permit = Arc::clone(&semaphore)
                        .acquire_owned()
                        .await
                        .map_err(|err| BuildError::Internal(err.to_string()))?;

                    info!(task = %node.id, kind = %node.id.kind, "Starting task");
                    statuses.insert(node.id.clone(), TaskStatus::Running);
                    in_flight.insert(node.id.clone());
                    let id = node.id.clone();
                    let handle = join_set.spawn(async move {
                        let completion =
                            Self::run_node(executor.as_ref(), &cache, &node, context).await;
                        drop(permit);
                        completion
                    });
                    running.insert(handle.id(), id);
                }
                if !changed {
                    break;
                }
            }

            if join_set.is_empty() {
                break;
            }

            let Some(joined) = join_set.join_next_with_id().await else {
                break;
            };
            let completion = match joined {
                Ok((join_id, completion)) => {
                    running.remove(&join_id);
                    completion
                }
                Err(join_error) => {
                    let Some(id) = running.remove(&join_error.id()) else {
                        return Err(BuildError::Internal(join_error.to_string()));
                    };
                    error!(task = %id, "Task worker ended abnormally: {join_error}");
                    let error = BuildError::Internal(join_error.to_string());
                    let mut result = ExecutionResult::with_status(
                        id.clone(),
                        TaskStatus::Failed(error.failure_cause()),
                    );
                    result.failure = Some(TaskFailure::new(id, error));
                    Completion {
                        result,
                        output: None,
                        fatal: true,
                    }
                }
            };

            let id = completion.result.task.clone();
            let status = completion.result.status;
            if let Some(output) = completion.output {
                outputs.insert(id.clone(), output);
            }
            if matches!(status, TaskStatus::Failed(_))
                && (completion.fatal || self.options.abort_on_failure)
                && !abort.is_cancelled()
            {
                warn!(task = %id, "Aborting build after failure");
                abort.cancel();
            }
            in_flight.remove(&id);
            done.insert(id.clone());
            statuses.insert(id.clone(), status);
            results.insert(id, completion.result);
        }

        let summary = BuildSummary {
            results: order
                .into_iter()
                .map(|id| results.remove(&id).unwrap_or_else(|| ExecutionResult::not_run(id)))
                .collect(),
        };
        info!(
            tasks = summary.results.len(),
            failed = summary.failures().count(),
            "Build finished"
        );
        Ok(summary)
    }

    fn mark_not_run(
        id: &TaskId,
        done: &mut HashSet<TaskId>,
        statuses: &mut HashMap<TaskId, TaskStatus>,
        results: &mut HashMap<TaskId, ExecutionResult>,
    ) {
        done.insert(id.clone());
        statuses.insert(id.clone(), TaskStatus::NotRun);
        results.insert(id.clone(), ExecutionResult::not_run(id.clone()));
    }

    async fn run_node(
        executor: &dyn NodeExecutor,
        cache: &FingerprintCache,
        node: &TaskNode,
        context: NodeContext,
    ) -> Completion {
        let start = Instant::now();
        let id = node.id.clone();

        let input = match executor.input_fingerprint(node, &context.upstream).await {
            Ok(input) => input.filter(|_| id.kind.is_incremental()),
            Err(error) => return Self::failed(executor, node, start, error),
        };

        if let Some(input) = &input {
            match cache.get(&id) {
                Ok(Some(entry)) if &entry.input == input && executor.outputs_exist(node) => {
                    info!(task = %id, kind = %id.kind, "Up to date");
                    return Completion {
                        result: ExecutionResult::with_status(id, TaskStatus::SkippedUpToDate),
                        output: Some(entry.output),
                        fatal: false,
                    };
                }
                Ok(_) => {}
                Err(error) => warn!(task = %id, "Cannot read fingerprint entry: {error}"),
            }
        }

        match executor.execute(node, context).await {
            Ok(output) => {
                if let Some(input) = input {
                    let entry = CacheEntry::new(input, output.fingerprint.clone());
                    if let Err(error) = cache.put(&id, &entry) {
                        warn!(task = %id, "Cannot record fingerprint: {error}");
                    }
                }
                let duration = start.elapsed();
                info!(task = %id, kind = %id.kind, "Task succeeded in {duration:?}");
                let mut result = ExecutionResult::with_status(id, TaskStatus::Succeeded);
                result.duration = duration;
                result.log = executor.log_path(node);
                result.reports = output.reports;
                result.artifacts = output.artifacts;
                Completion {
                    result,
                    output: Some(output.fingerprint),
                    fatal: false,
                }
            }
            Err(error) => {
                if id.kind.is_incremental() {
                    if let Err(cache_error) = cache.invalidate(&id) {
                        warn!(task = %id, "Cannot invalidate fingerprint: {cache_error}");
                    }
                }
                Self::failed(executor, node, start, error)
            }
        }
    }

    fn failed(
        executor: &dyn NodeExecutor,
        node: &TaskNode,
        start: Instant,
        error: BuildError,
    ) -> Completion {
        let id = node.id.clone();
        let cause = error.failure_cause();
        let fatal = error.is_fatal();
        if cause.is_cancellation() {
            warn!(task = %id, kind = %id.kind, "Task {cause}");
        } else {
            error!(task = %id, kind = %id.kind, "Task failed: {error}");
        }
        let mut result = ExecutionResult::with_status(id.clone(), TaskStatus::Failed(cause));
        result.duration = start.elapsed();
        result.log = executor.log_path(node);
        result.failure = Some(TaskFailure::new(id, error));
        Completion {
            result,
            output: None,
            fatal,
        }
    }
}
