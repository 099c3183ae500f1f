//! Scheduler behaviour against a scripted node executor.
#![allow(clippy::expect_used, clippy::panic, reason = "Allow for tests")]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use barrage_build::SourceSets;
use barrage_core::{
    BuildConfig, BuildError, FailureCause, Fingerprint, FingerprintAlgorithm, FingerprintCache,
    Fingerprinter, Result, SourceGroupConfig, TaskId, TaskKind, TaskStatus,
};
use barrage_graph::{
    GraphBuilder, NodeContext, NodeExecutor, NodeOutput, Scheduler, SchedulerOptions, TaskGraph,
    TaskNode, UpstreamOutputs, Verb,
};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::timeout;

#[derive(Clone, Copy)]
enum Behaviour {
    FailCompilation,
    FailFatally,
    WaitForCancel,
}

#[derive(Default)]
struct ScriptedExecutor {
    inputs: Mutex<HashMap<TaskId, String>>,
    behaviours: HashMap<TaskId, Behaviour>,
    executed: Mutex<Vec<TaskId>>,
    waiting: Notify,
}

impl ScriptedExecutor {
    fn with(mut self, id: TaskId, behaviour: Behaviour) -> Self {
        self.behaviours.insert(id, behaviour);
        self
    }

    fn set_input(&self, id: TaskId, value: &str) {
        self.inputs
            .lock()
            .expect("inputs lock")
            .insert(id, value.to_owned());
    }

    fn executed(&self) -> HashSet<TaskId> {
        self.executed
            .lock()
            .expect("executed lock")
            .iter()
            .cloned()
            .collect()
    }

    fn own_value(&self, id: &TaskId) -> String {
        self.inputs
            .lock()
            .expect("inputs lock")
            .get(id)
            .cloned()
            .unwrap_or_else(|| "initial".to_owned())
    }
}

fn fingerprint(value: &str) -> Fingerprint {
    let mut fingerprinter = Fingerprinter::new(FingerprintAlgorithm::Sha256);
    fingerprinter.str("value", value);
    fingerprinter.finish()
}

#[async_trait]
impl NodeExecutor for ScriptedExecutor {
    async fn input_fingerprint(
        &self,
        node: &TaskNode,
        upstream: &UpstreamOutputs,
    ) -> Result<Option<Fingerprint>> {
        if !node.id.kind.is_incremental() {
            return Ok(None);
        }
        let mut fingerprinter = Fingerprinter::new(FingerprintAlgorithm::Sha256);
        fingerprinter.str("own", &self.own_value(&node.id));
        for (id, output) in upstream {
            fingerprinter.fingerprint(&id.cache_key(), output);
        }
        Ok(Some(fingerprinter.finish()))
    }

    fn outputs_exist(&self, _node: &TaskNode) -> bool {
        true
    }

    async fn execute(&self, node: &TaskNode, context: NodeContext) -> Result<NodeOutput> {
        self.executed
            .lock()
            .expect("executed lock")
            .push(node.id.clone());
        match self.behaviours.get(&node.id) {
            Some(Behaviour::FailCompilation) => Err(BuildError::Compilation {
                group: node.id.group.clone().unwrap_or_default(),
                diagnostics: "error: cannot find symbol".to_owned(),
            }),
            Some(Behaviour::FailFatally) => {
                Err(BuildError::Configuration("broken settings".to_owned()))
            }
            Some(Behaviour::WaitForCancel) => {
                self.waiting.notify_one();
                context.cancel.cancelled().await;
                Err(BuildError::Cancelled)
            }
            None => Ok(NodeOutput::new(fingerprint(&format!(
                "{}:{}",
                node.id,
                self.own_value(&node.id)
            )))),
        }
    }
}

fn two_groups(dir: &TempDir) -> SourceSets {
    let mut config = BuildConfig::default();
    config.project.root = dir.path().to_path_buf();
    config.source_groups = vec![SourceGroupConfig::named("a"), SourceGroupConfig::named("b")];
    SourceSets::resolve(&config).expect("resolve")
}

fn run_graph(dir: &TempDir) -> TaskGraph {
    GraphBuilder::new(&two_groups(dir))
        .build(Verb::Run, &[])
        .expect("graph")
}

fn scheduler(executor: &Arc<ScriptedExecutor>, cache_dir: &TempDir, workers: usize) -> Scheduler {
    Scheduler::new(
        Arc::clone(executor) as Arc<dyn NodeExecutor>,
        FingerprintCache::open(cache_dir.path()).expect("open cache"),
        SchedulerOptions {
            max_workers: workers,
            abort_on_failure: false,
        },
    )
}

fn id(group: &str, kind: TaskKind) -> TaskId {
    TaskId::new(group, kind)
}

#[tokio::test]
async fn test_failed_branch_does_not_stop_independent_branch() {
    let dir = TempDir::new().expect("create temp dir");
    let cache_dir = TempDir::new().expect("create cache dir");
    let executor = Arc::new(
        ScriptedExecutor::default().with(id("a", TaskKind::Compile), Behaviour::FailCompilation),
    );

    let summary = scheduler(&executor, &cache_dir, 2)
        .execute(&run_graph(&dir))
        .await
        .expect("execute");

    assert_eq!(
        summary.status(&id("a", TaskKind::Compile)),
        Some(TaskStatus::Failed(FailureCause::Error))
    );
    for kind in [TaskKind::AssembleClasspath, TaskKind::Run, TaskKind::Report] {
        assert_eq!(summary.status(&id("a", kind)), Some(TaskStatus::NotRun));
        assert_eq!(summary.status(&id("b", kind)), Some(TaskStatus::Succeeded));
    }
    assert!(!summary.is_success());
    assert_eq!(summary.exit_code(), 1);

    let failure = summary
        .get(&id("a", TaskKind::Compile))
        .and_then(|result| result.failure.as_ref())
        .expect("failure recorded");
    let message = failure.to_string();
    assert!(message.contains("compile(a)"), "{message}");
    assert!(message.contains("cannot find symbol"), "{message}");
}

#[tokio::test]
async fn test_unchanged_rerun_skips_incremental_nodes() {
    let dir = TempDir::new().expect("create temp dir");
    let cache_dir = TempDir::new().expect("create cache dir");
    let graph = run_graph(&dir);

    let first = scheduler(&Arc::new(ScriptedExecutor::default()), &cache_dir, 2)
        .execute(&graph)
        .await
        .expect("first build");
    assert!(first.is_success());

    let executor = Arc::new(ScriptedExecutor::default());
    let second = scheduler(&executor, &cache_dir, 2)
        .execute(&graph)
        .await
        .expect("second build");
    assert!(second.is_success());
    assert_eq!(second.exit_code(), 0);
    assert_eq!(
        second.status(&TaskId::shared(TaskKind::ResolveEngine)),
        Some(TaskStatus::SkippedUpToDate)
    );
    for group in ["a", "b"] {
        assert_eq!(
            second.status(&id(group, TaskKind::Compile)),
            Some(TaskStatus::SkippedUpToDate)
        );
        assert_eq!(
            second.status(&id(group, TaskKind::AssembleClasspath)),
            Some(TaskStatus::SkippedUpToDate)
        );
        assert_eq!(
            second.status(&id(group, TaskKind::Run)),
            Some(TaskStatus::Succeeded)
        );
    }

    // Changing group a's sources re-executes a's chain only.
    let executor = Arc::new(ScriptedExecutor::default());
    executor.set_input(id("a", TaskKind::Compile), "edited");
    let third = scheduler(&executor, &cache_dir, 2)
        .execute(&graph)
        .await
        .expect("third build");
    assert_eq!(
        third.status(&id("a", TaskKind::Compile)),
        Some(TaskStatus::Succeeded)
    );
    assert_eq!(
        third.status(&id("a", TaskKind::AssembleClasspath)),
        Some(TaskStatus::Succeeded)
    );
    assert_eq!(
        third.status(&id("b", TaskKind::Compile)),
        Some(TaskStatus::SkippedUpToDate)
    );
    assert_eq!(
        third.status(&id("b", TaskKind::AssembleClasspath)),
        Some(TaskStatus::SkippedUpToDate)
    );
    let executed = executor.executed();
    assert!(!executed.contains(&id("b", TaskKind::Compile)));
    assert!(executed.contains(&id("a", TaskKind::AssembleClasspath)));
}

#[tokio::test]
async fn test_cancellation_marks_downstream_not_run() {
    let dir = TempDir::new().expect("create temp dir");
    let cache_dir = TempDir::new().expect("create cache dir");
    let executor = Arc::new(
        ScriptedExecutor::default().with(id("a", TaskKind::Run), Behaviour::WaitForCancel),
    );
    let scheduler = scheduler(&executor, &cache_dir, 4);
    let cancel = scheduler.cancellation_token();
    let graph = run_graph(&dir);

    let waiter = Arc::clone(&executor);
    let canceller = tokio::spawn(async move {
        waiter.waiting.notified().await;
        cancel.cancel();
    });

    let summary = timeout(Duration::from_secs(10), scheduler.execute(&graph))
        .await
        .expect("build finishes after cancellation")
        .expect("execute");
    canceller.await.expect("canceller task");

    assert_eq!(
        summary.status(&id("a", TaskKind::Run)),
        Some(TaskStatus::Failed(FailureCause::Cancelled))
    );
    assert_eq!(
        summary.status(&id("a", TaskKind::Report)),
        Some(TaskStatus::NotRun)
    );
    assert_eq!(
        summary.status(&id("a", TaskKind::Compile)),
        Some(TaskStatus::Succeeded)
    );
    assert!(
        summary
            .results
            .iter()
            .all(|result| result.status.is_terminal())
    );
    assert!(!summary.is_success());
}

#[tokio::test]
async fn test_fatal_failure_aborts_other_branches() {
    let dir = TempDir::new().expect("create temp dir");
    let cache_dir = TempDir::new().expect("create cache dir");
    let executor = Arc::new(
        ScriptedExecutor::default()
            .with(id("a", TaskKind::Compile), Behaviour::FailFatally)
            .with(id("b", TaskKind::Compile), Behaviour::WaitForCancel),
    );

    let summary = timeout(
        Duration::from_secs(10),
        scheduler(&executor, &cache_dir, 2).execute(&run_graph(&dir)),
    )
    .await
    .expect("fatal failure aborts the build")
    .expect("execute");

    assert_eq!(
        summary.status(&id("b", TaskKind::Compile)),
        Some(TaskStatus::Failed(FailureCause::Cancelled))
    );
    assert_eq!(
        summary.status(&id("b", TaskKind::Run)),
        Some(TaskStatus::NotRun)
    );
    assert!(!executor.executed().contains(&id("b", TaskKind::Run)));
}

#[tokio::test]
async fn test_worker_limit_of_one_still_completes() {
    let dir = TempDir::new().expect("create temp dir");
    let cache_dir = TempDir::new().expect("create cache dir");
    let executor = Arc::new(ScriptedExecutor::default());
    let graph = run_graph(&dir);

    let summary = scheduler(&executor, &cache_dir, 1)
        .execute(&graph)
        .await
        .expect("execute");
    assert_eq!(summary.results.len(), graph.len());
    assert!(summary.is_success());
    assert_eq!(executor.executed().len(), graph.len());
}
