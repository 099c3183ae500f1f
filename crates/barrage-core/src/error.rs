use core::fmt;
use core::result::Result as CoreResult;
use std::io::Error as IoError;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Error as ReqwestError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;
use toml::de::Error as TomlError;

use crate::task::{FailureCause, TaskId, TaskKind};

/// Result type for build operations.
pub type Result<T> = CoreResult<T, BuildError>;

/// Errors raised while resolving, compiling, launching or reporting.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Bad or missing configuration, surfaced before any task executes.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A dependency or classpath entry could not be located.
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// The compiler rejected a source group; diagnostics are kept verbatim.
    #[error("Compilation failed for source group '{group}':\n{diagnostics}")]
    Compilation {
        /// Source group that failed to compile
        group: String,
        /// Compiler output
        diagnostics: String,
    },

    /// A simulation child process did not exit cleanly.
    #[error("Simulation '{simulation}' {cause}{}", excerpt_suffix(.excerpt))]
    Execution {
        /// Fully-qualified simulation name
        simulation: String,
        /// How the process ended
        cause: FailureCause,
        /// Tail of the process output
        excerpt: String,
    },

    /// The engine reported failing assertions for a simulation.
    #[error("Simulation '{simulation}' failed {failed} of {total} assertions{}", messages_suffix(.messages))]
    AssertionsFailed {
        /// Fully-qualified simulation name
        simulation: String,
        /// Number of failed assertions
        failed: usize,
        /// Number of evaluated assertions
        total: usize,
        /// Engine messages of the failed assertions
        messages: Vec<String>,
    },

    /// A run reported success but left no output directory behind.
    #[error("No report found for simulation '{simulation}' under {}", .dir.display())]
    ReportNotFound {
        /// Fully-qualified simulation name
        simulation: String,
        /// Directory that was searched
        dir: PathBuf,
    },

    /// The remote execution service rejected or failed a submission.
    #[error("Remote submission failed: {0}")]
    RemoteSubmission(#[from] RemoteSubmissionError),

    /// The build was cancelled while the task was in flight.
    #[error("Cancelled")]
    Cancelled,

    /// The task's wall-clock timeout expired.
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    /// A worker task ended abnormally; indicates a bug.
    #[error("Internal error: {0}")]
    Internal(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] SerdeJsonError),

    /// TOML deserialization failed.
    #[error("TOML error: {0}")]
    Toml(#[from] TomlError),

    /// An HTTP request could not be built or sent.
    #[error("HTTP request failed: {0}")]
    Http(#[from] ReqwestError),
}

impl BuildError {
    /// Maps the error to the node failure cause recorded in the task graph.
    pub fn failure_cause(&self) -> FailureCause {
        match self {
            Self::Execution { cause, .. } => *cause,
            Self::Cancelled => FailureCause::Cancelled,
            Self::TimedOut(_) => FailureCause::TimedOut,
            _ => FailureCause::Error,
        }
    }

    /// Configuration errors and internal consistency faults abort the whole build.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::ReportNotFound { .. } | Self::Internal(_)
        )
    }

    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RemoteSubmission(remote) => remote.is_retryable(),
            _ => false,
        }
    }

    /// Whether a failed remote request never reached the service.
    pub fn is_unsent(&self) -> bool {
        match self {
            Self::RemoteSubmission(remote) => remote.is_unsent(),
            _ => false,
        }
    }
}

fn messages_suffix(messages: &[String]) -> String {
    excerpt_suffix(&messages.join("\n"))
}

fn excerpt_suffix(excerpt: &str) -> String {
    if excerpt.trim().is_empty() {
        String::new()
    } else {
        format!(":\n{excerpt}")
    }
}

/// Classified failure of a remote submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteSubmissionError {
    /// The service rejected the package or run configuration.
    #[error("rejected invalid configuration: {0}")]
    InvalidConfig(String),

    /// The account has no capacity left for the request.
    #[error("rejected by quota: {0}")]
    Quota(String),

    /// Transient transport failure; eligible for retry.
    #[error("network failure: {0}")]
    Network(String),

    /// No connection could be established, so the request never reached the service.
    #[error("service unreachable: {0}")]
    Unreachable(String),

    /// The service no longer accepts requests from this client version.
    #[error(
        "Please update barrage to the latest version for compatibility with the remote execution service ({0})"
    )]
    UnsupportedClient(String),

    /// The service failed in a way a retry will not fix.
    #[error("remote failure: {0}")]
    Remote(String),
}

impl RemoteSubmissionError {
    /// Only network failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Unreachable(_))
    }

    /// Whether the request certainly never reached the service, so even a
    /// non-idempotent call may be sent again.
    pub fn is_unsent(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// A build error attributed to the task that raised it.
#[derive(Debug)]
pub struct TaskFailure {
    /// Failing task
    pub task: TaskId,
    /// Kind of the failing task
    pub kind: TaskKind,
    /// Underlying error
    pub error: BuildError,
}

impl TaskFailure {
    /// Attributes `error` to `task`.
    pub fn new(task: TaskId, error: BuildError) -> Self {
        let kind = task.kind;
        Self { task, kind, error }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "Task {} [{}] failed: {}", self.task, self.kind, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let error = BuildError::Configuration("no source groups".to_owned());
        assert_eq!(error.to_string(), "Configuration error: no source groups");

        let error = BuildError::Compilation {
            group: "web".to_owned(),
            diagnostics: "Foo.java:3: error: ';' expected".to_owned(),
        };
        assert_eq!(
            error.to_string(),
            "Compilation failed for source group 'web':\nFoo.java:3: error: ';' expected"
        );

        let error = BuildError::Execution {
            simulation: "computerdatabase.BasicSimulation".to_owned(),
            cause: FailureCause::ExitCode(1),
            excerpt: String::new(),
        };
        assert_eq!(
            error.to_string(),
            "Simulation 'computerdatabase.BasicSimulation' exited with code 1"
        );
    }

    #[test]
    fn test_task_failure_names_task_and_kind() {
        let failure = TaskFailure::new(
            TaskId::new("web", TaskKind::Run),
            BuildError::Execution {
                simulation: "example.Sim".to_owned(),
                cause: FailureCause::Signal(9),
                excerpt: "OutOfMemoryError".to_owned(),
            },
        );
        let message = failure.to_string();
        assert!(message.starts_with("Task run(web) [run] failed"));
        assert!(message.contains("killed by signal 9"));
        assert!(message.contains("OutOfMemoryError"));
    }

    #[test]
    fn test_failure_cause_mapping() {
        assert_eq!(BuildError::Cancelled.failure_cause(), FailureCause::Cancelled);
        assert_eq!(
            BuildError::TimedOut(Duration::from_secs(5)).failure_cause(),
            FailureCause::TimedOut
        );
        assert_eq!(
            BuildError::Resolution("missing".to_owned()).failure_cause(),
            FailureCause::Error
        );
    }

    #[test]
    fn test_retryable() {
        assert!(BuildError::from(RemoteSubmissionError::Network("reset".to_owned())).is_retryable());
        assert!(!BuildError::from(RemoteSubmissionError::Quota("full".to_owned())).is_retryable());
        assert!(!BuildError::Configuration("bad".to_owned()).is_retryable());

        let unreachable = BuildError::from(RemoteSubmissionError::Unreachable("refused".to_owned()));
        assert!(unreachable.is_retryable());
        assert!(unreachable.is_unsent());
        assert!(!BuildError::from(RemoteSubmissionError::Network("reset".to_owned())).is_unsent());

        let outdated = RemoteSubmissionError::UnsupportedClient("426 Upgrade Required".to_owned());
        assert!(!outdated.is_retryable());
        assert!(outdated.to_string().starts_with("Please update barrage to the latest version"));
    }

    #[test]
    fn test_error_from_io() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: BuildError = io_error.into();
        assert!(matches!(error, BuildError::Io(_)));
    }
}
