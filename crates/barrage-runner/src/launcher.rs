//! Simulation process launcher.
//!
//! Each simulation runs in its own child process. Output is read line by line
//! into a bounded channel; one task drains that channel into the per-task log
//! file, the `barrage::simulation` tracing target and an optional subscriber,
//! while the launching task waits for exit, cancellation or timeout.

use core::future::pending;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use barrage_core::{BuildError, FailureCause, Result, SimulationRunSpec};
use chrono::{DateTime, Utc};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWriteExt as _, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of output kept for error excerpts.
const EXCERPT_LINES: usize = 40;
/// How long to wait for output readers after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// One line of simulation output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Simulation that printed the line
    pub simulation: String,
    /// Source pipe
    pub stream: OutputStream,
    /// Line text without the trailing newline
    pub line: String,
}

/// A simulation process that ended with an accepted exit code.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    /// Simulation that ran
    pub simulation: String,
    /// Exit code: `0`, or the engine's assertion-failure code
    pub exit_code: i32,
    /// When the process was started
    pub started_at: DateTime<Utc>,
    /// Wall-clock run time
    pub duration: Duration,
    /// File holding the captured output
    pub log: PathBuf,
}

impl LaunchOutcome {
    /// Whether the engine signalled failing assertions through its exit code.
    pub fn assertions_failed(&self, assertion_exit_code: i32) -> bool {
        self.exit_code != 0 && self.exit_code == assertion_exit_code
    }
}

/// Launches simulation processes.
pub struct SimulationLauncher {
    output_buffer: usize,
    assertion_exit_code: i32,
    sink: Option<mpsc::Sender<OutputLine>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SimulationLauncher {
    /// Launcher with a bounded output channel of `output_buffer` lines.
    pub fn new(output_buffer: usize, assertion_exit_code: i32) -> Self {
        Self {
            output_buffer: output_buffer.max(1),
            assertion_exit_code,
            sink: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Forwards every output line to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: mpsc::Sender<OutputLine>) -> Self {
        self.sink = Some(sink);
        self
    }

    async fn simulation_lock(&self, simulation: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(simulation.to_owned()).or_default())
    }

    /// Runs `spec` to completion, appending its output to `log`.
    ///
    /// Only one process per simulation name runs at a time; others wait.
    ///
    /// # Errors
    /// Returns [`BuildError::Execution`] for an unexpected exit code, a signal
    /// or a spawn failure, [`BuildError::Cancelled`] when `cancel` fires and
    /// [`BuildError::TimedOut`] when the run timeout expires.
    pub async fn launch(
        &self,
        spec: &SimulationRunSpec,
        log: &Path,
        cancel: &CancellationToken,
    ) -> Result<LaunchOutcome> {
        let lock = self.simulation_lock(&spec.simulation).await;
        let _guard = tokio::select! {
            guard = lock.lock() => guard,
            () = cancel.cancelled() => return Err(BuildError::Cancelled),
        };

        fs::create_dir_all(&spec.results_dir).await?;
        if let Some(parent) = log.parent() {
            fs::create_dir_all(parent).await?;
        }
        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .await?;

        let mut command = Command::new(&spec.java);
        command
            .args(spec.command_args())
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(simulation = %spec.simulation, "Command: {} {:?}", spec.java.display(), spec.command_args());

        let started_at = Utc::now();
        let start = Instant::now();
        let mut child = command.spawn().map_err(|error| BuildError::Execution {
            simulation: spec.simulation.clone(),
            cause: FailureCause::Error,
            excerpt: format!("failed to start {}: {error}", spec.java.display()),
        })?;

        let (sender, receiver) = mpsc::channel(self.output_buffer);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputStream::Stdout, &spec.simulation, sender.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, OutputStream::Stderr, &spec.simulation, sender.clone()));
        }
        drop(sender);
        let drain = tokio::spawn(drain_output(receiver, log_file, self.sink.clone()));

        let ending = wait_for_exit(&mut child, cancel, spec.timeout).await;

        let excerpt = match timeout(DRAIN_GRACE, drain).await {
            Ok(Ok(Ok(tail))) => tail.into_iter().collect::<Vec<_>>().join("\n"),
            Ok(Ok(Err(error))) => {
                warn!(simulation = %spec.simulation, "Failed to write simulation log: {error}");
                String::new()
            }
            Ok(Err(join_error)) => {
                warn!(simulation = %spec.simulation, "Output drain ended abnormally: {join_error}");
                String::new()
            }
            Err(_) => {
                // A grandchild may still hold the pipes open.
                for reader in &readers {
                    reader.abort();
                }
                String::new()
            }
        };

        let duration = start.elapsed();
        let status = match ending {
            Ending::Exited(status) => status,
            Ending::Cancelled => {
                warn!(simulation = %spec.simulation, "Simulation cancelled after {duration:?}");
                return Err(BuildError::Cancelled);
            }
            Ending::TimedOut(limit) => {
                warn!(simulation = %spec.simulation, "Simulation timed out after {limit:?}");
                return Err(BuildError::TimedOut(limit));
            }
            Ending::WaitFailed(error) => return Err(error.into()),
        };

        match classify_exit(status) {
            FailureCause::ExitCode(0) => {
                info!(simulation = %spec.simulation, "Simulation finished in {duration:?}");
            }
            FailureCause::ExitCode(code) if code == self.assertion_exit_code => {
                warn!(simulation = %spec.simulation, "Simulation reported failing assertions (exit code {code})");
            }
            cause => {
                return Err(BuildError::Execution {
                    simulation: spec.simulation.clone(),
                    cause,
                    excerpt,
                });
            }
        }

        Ok(LaunchOutcome {
            simulation: spec.simulation.clone(),
            exit_code: status.code().unwrap_or_default(),
            started_at,
            duration,
            log: log.to_path_buf(),
        })
    }
}

enum Ending {
    Exited(ExitStatus),
    Cancelled,
    TimedOut(Duration),
    WaitFailed(io::Error),
}

async fn wait_for_exit(
    child: &mut Child,
    cancel: &CancellationToken,
    limit: Option<Duration>,
) -> Ending {
    let expiry = async {
        match limit {
            Some(limit) => sleep(limit).await,
            None => pending::<()>().await,
        }
    };

    let ending = tokio::select! {
        status = child.wait() => {
            return match status {
                Ok(status) => Ending::Exited(status),
                Err(error) => Ending::WaitFailed(error),
            };
        }
        () = cancel.cancelled() => Ending::Cancelled,
        () = expiry => Ending::TimedOut(limit.unwrap_or_default()),
    };

    if let Err(error) = child.kill().await {
        warn!("Failed to kill simulation process: {error}");
    }
    ending
}

/// Maps a process status to a failure cause; `ExitCode(0)` means success.
fn classify_exit(status: ExitStatus) -> FailureCause {
    if let Some(code) = status.code() {
        return FailureCause::ExitCode(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return FailureCause::Signal(signal);
        }
    }
    FailureCause::Error
}

fn spawn_reader<R>(
    pipe: R,
    stream: OutputStream,
    simulation: &str,
    sender: mpsc::Sender<OutputLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let simulation = simulation.to_owned();
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = OutputLine {
                        simulation: simulation.clone(),
                        stream,
                        line,
                    };
                    if sender.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    debug!(simulation = %simulation, "Stopped reading output: {error}");
                    break;
                }
            }
        }
    })
}

async fn drain_output(
    mut receiver: mpsc::Receiver<OutputLine>,
    log_file: File,
    sink: Option<mpsc::Sender<OutputLine>>,
) -> io::Result<VecDeque<String>> {
    let mut writer = BufWriter::new(log_file);
    let mut tail = VecDeque::with_capacity(EXCERPT_LINES);
    while let Some(line) = receiver.recv().await {
        writer.write_all(line.line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        match line.stream {
            OutputStream::Stdout => {
                info!(target: "barrage::simulation", simulation = %line.simulation, "{}", line.line);
            }
            OutputStream::Stderr => {
                warn!(target: "barrage::simulation", simulation = %line.simulation, "{}", line.line);
            }
        }
        if tail.len() == EXCERPT_LINES {
            tail.pop_front();
        }
        tail.push_back(line.line.clone());
        if let Some(sink) = &sink {
            // A subscriber that went away does not stop the run.
            let _ignored = sink.send(line).await;
        }
    }
    writer.flush().await?;
    Ok(tail)
}
