//! Task identities, terminal states and execution results.

use core::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TaskFailure;
use crate::report::ReportSummary;

/// Kind of build action a task node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Shared resolution of the engine classpath, performed once per build
    ResolveEngine,
    /// Compile a source group
    Compile,
    /// Assemble the ordered runtime classpath of a source group
    AssembleClasspath,
    /// Launch the simulations of a source group
    Run,
    /// Locate and summarise run output
    Report,
    /// Package and submit to the remote execution service
    Upload,
}

impl TaskKind {
    /// Stable name used in task ids, cache keys and log files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResolveEngine => "resolve-engine",
            Self::Compile => "compile",
            Self::AssembleClasspath => "assemble-classpath",
            Self::Run => "run",
            Self::Report => "report",
            Self::Upload => "upload",
        }
    }

    /// Whether nodes of this kind take part in up-to-date checks.
    ///
    /// Runs, reports and uploads always execute.
    pub fn is_incremental(self) -> bool {
        matches!(
            self,
            Self::ResolveEngine | Self::Compile | Self::AssembleClasspath
        )
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Identity of a task node: its kind plus the source group it belongs to.
///
/// Shared nodes (engine resolution) carry no group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// Owning source group, `None` for build-wide shared nodes
    pub group: Option<String>,
    /// Action performed by the node
    pub kind: TaskKind,
}

impl TaskId {
    /// Task belonging to a source group.
    pub fn new(group: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            group: Some(group.into()),
            kind,
        }
    }

    /// Build-wide shared task.
    pub fn shared(kind: TaskKind) -> Self {
        Self { group: None, kind }
    }

    /// Key under which the fingerprint cache stores this task's entry.
    pub fn cache_key(&self) -> String {
        match &self.group {
            Some(group) => format!("{group}.{}", self.kind),
            None => format!("_shared.{}", self.kind),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(formatter, "{}({group})", self.kind),
            None => formatter.write_str(self.kind.as_str()),
        }
    }
}

/// Why a task ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    /// Child process exited with a non-zero code
    ExitCode(i32),
    /// Child process was terminated by a signal
    Signal(i32),
    /// Build-wide cancellation reached the task while it was running
    Cancelled,
    /// The task's own wall-clock timeout expired
    TimedOut,
    /// The action failed without a process status (compiler, resolution, remote)
    Error,
}

impl FailureCause {
    /// Timeouts are reported the same way as cancellations.
    pub fn is_cancellation(self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut)
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExitCode(code) => write!(formatter, "exited with code {code}"),
            Self::Signal(signal) => write!(formatter, "was killed by signal {signal}"),
            Self::Cancelled => formatter.write_str("was cancelled"),
            Self::TimedOut => formatter.write_str("timed out"),
            Self::Error => formatter.write_str("failed"),
        }
    }
}

/// Lifecycle state of a task node within one build invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting for upstream nodes
    #[default]
    Pending,
    /// Currently executing on a worker
    Running,
    /// Executed and succeeded
    Succeeded,
    /// Skipped because inputs and upstream outputs are unchanged
    SkippedUpToDate,
    /// Executed and failed
    Failed(FailureCause),
    /// Never executed because an upstream node failed or the build was cancelled
    NotRun,
}

impl TaskStatus {
    /// Terminal states are the only ones a finished build reports.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Downstream nodes may proceed after these states.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::SkippedUpToDate)
    }

    /// Short label used in summaries.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::SkippedUpToDate => "up-to-date",
            Self::Failed(FailureCause::ExitCode(_)) => "failed-with-code",
            Self::Failed(FailureCause::Signal(_)) => "failed-with-signal",
            Self::Failed(FailureCause::Cancelled | FailureCause::TimedOut) => "failed-cancelled",
            Self::Failed(FailureCause::Error) => "failed",
            Self::NotRun => "not-run",
        }
    }
}

/// Outcome of a single task node.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Task the result belongs to
    pub task: TaskId,
    /// Terminal state
    pub status: TaskStatus,
    /// Per-task log file holding captured stdout/stderr, when the task produced output
    pub log: Option<PathBuf>,
    /// Wall-clock time spent executing (zero for skipped and not-run nodes)
    pub duration: Duration,
    /// Failure details for failed nodes
    pub failure: Option<TaskFailure>,
    /// Report summaries surfaced by report nodes
    pub reports: Vec<ReportSummary>,
    /// Files or directories produced for downstream consumption
    pub artifacts: Vec<PathBuf>,
}

impl ExecutionResult {
    /// Result for a node that never executed.
    pub fn not_run(task: TaskId) -> Self {
        Self::with_status(task, TaskStatus::NotRun)
    }

    /// Bare result with the given status and no details.
    pub fn with_status(task: TaskId, status: TaskStatus) -> Self {
        Self {
            task,
            status,
            log: None,
            duration: Duration::ZERO,
            failure: None,
            reports: Vec::new(),
            artifacts: Vec::new(),
        }
    }
}

/// Aggregate of all node results of one invocation.
#[derive(Debug, Default)]
pub struct BuildSummary {
    /// Results in topological order
    pub results: Vec<ExecutionResult>,
}

impl BuildSummary {
    /// A build succeeds when no node failed or was left unexecuted.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|result| result.status.is_success())
    }

    /// Process exit status for the invoking surface.
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }

    /// Result for a given task, if it was part of the graph.
    pub fn get(&self, task: &TaskId) -> Option<&ExecutionResult> {
        self.results.iter().find(|result| &result.task == task)
    }

    /// Status for a given task, if it was part of the graph.
    pub fn status(&self, task: &TaskId) -> Option<TaskStatus> {
        self.get(task).map(|result| result.status)
    }

    /// Failed results only.
    pub fn failures(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results
            .iter()
            .filter(|result| matches!(result.status, TaskStatus::Failed(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_display_and_key() {
        let compile = TaskId::new("web", TaskKind::Compile);
        assert_eq!(compile.to_string(), "compile(web)");
        assert_eq!(compile.cache_key(), "web.compile");

        let engine = TaskId::shared(TaskKind::ResolveEngine);
        assert_eq!(engine.to_string(), "resolve-engine");
        assert_eq!(engine.cache_key(), "_shared.resolve-engine");
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(
            TaskStatus::Failed(FailureCause::TimedOut).label(),
            "failed-cancelled"
        );
        assert_eq!(TaskStatus::SkippedUpToDate.label(), "up-to-date");
        assert!(TaskStatus::SkippedUpToDate.is_success());
        assert!(!TaskStatus::NotRun.is_success());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_summary_exit_code() {
        let mut summary = BuildSummary::default();
        summary.results.push(ExecutionResult::with_status(
            TaskId::new("web", TaskKind::Compile),
            TaskStatus::SkippedUpToDate,
        ));
        assert_eq!(summary.exit_code(), 0);

        summary.results.push(ExecutionResult::with_status(
            TaskId::new("web", TaskKind::Run),
            TaskStatus::Failed(FailureCause::ExitCode(2)),
        ));
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.failures().count(), 1);
    }
}
