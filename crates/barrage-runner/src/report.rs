//! Report aggregation.
//!
//! Every simulation gets its own results folder,
//! `<results>/<group>/<fully.qualified.Name>/`, in which the engine writes
//! each run as `<simplename>-<timestamp>/` and records its assertion verdicts
//! in `js/assertions.json`. Run nodes leave a manifest of what they launched
//! so report nodes can find the matching directories without guessing.

use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use barrage_core::run_spec::run_directory_prefix;
use barrage_core::{BuildError, ReportSummary, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Relative location of the engine's assertion results inside a run directory.
pub const ASSERTIONS_FILE: &str = "js/assertions.json";

/// Filesystem timestamps may be coarser than the recorded start time.
const MTIME_SLACK: Duration = Duration::from_secs(2);

/// One launched simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Fully-qualified simulation name
    pub simulation: String,
    /// Results folder the engine was pointed at for this simulation
    pub results_dir: PathBuf,
    /// Process start time
    pub started_at: DateTime<Utc>,
    /// Accepted exit code (`0` or the assertion-failure code)
    pub exit_code: i32,
}

/// Simulations launched by the latest run of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Source group
    pub group: String,
    /// Parent of the per-simulation results folders
    pub results_dir: PathBuf,
    /// Launches in execution order
    pub runs: Vec<RunRecord>,
}

impl RunManifest {
    /// Empty manifest for `group`.
    pub fn new(group: impl Into<String>, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            group: group.into(),
            results_dir: results_dir.into(),
            runs: Vec::new(),
        }
    }

    /// Reads the manifest at `path`, `None` if there is none.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Atomically writes the manifest to `path`.
    ///
    /// # Errors
    /// Returns an error if the manifest cannot be written.
    pub fn store(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        temp.persist(path).map_err(|error| error.error)?;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AssertionFile {
    assertions: Vec<AssertionEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AssertionEntry {
    result: bool,
    message: String,
}

/// Newest run directory of `simulation` under `results_dir`.
///
/// With `since`, directories last modified before that instant are ignored.
///
/// # Errors
/// Returns [`BuildError::ReportNotFound`] when no directory qualifies.
pub fn locate_run_directory(
    results_dir: &Path,
    simulation: &str,
    since: Option<SystemTime>,
) -> Result<PathBuf> {
    let prefix = format!("{}-", run_directory_prefix(simulation));
    let not_found = || BuildError::ReportNotFound {
        simulation: simulation.to_owned(),
        dir: results_dir.to_path_buf(),
    };

    let entries = match fs::read_dir(results_dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Err(not_found()),
        Err(error) => return Err(error.into()),
    };

    let threshold = since.map(|since| since.checked_sub(MTIME_SLACK).unwrap_or(since));
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) || !entry.file_type()?.is_dir() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if threshold.is_some_and(|threshold| modified < threshold) {
            continue;
        }
        let candidate = (modified, entry.path());
        if newest.as_ref().is_none_or(|current| candidate > *current) {
            newest = Some(candidate);
        }
    }

    newest.map(|(_, path)| path).ok_or_else(not_found)
}

/// Engine verdict recorded in a run directory.
///
/// A directory without an assertion file had no assertions and passes.
///
/// # Errors
/// Returns an error if the assertion file exists but cannot be parsed.
pub fn summarize(simulation: &str, directory: &Path) -> Result<ReportSummary> {
    let path = directory.join(ASSERTIONS_FILE);
    let file = match fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str::<AssertionFile>(&contents)?,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            debug!(simulation, "No assertion results in {}", directory.display());
            AssertionFile::default()
        }
        Err(error) => return Err(error.into()),
    };

    Ok(ReportSummary {
        simulation: simulation.to_owned(),
        directory: directory.to_path_buf(),
        assertions_total: file.assertions.len(),
        failed_assertions: file
            .assertions
            .into_iter()
            .filter(|assertion| !assertion.result)
            .map(|assertion| assertion.message)
            .collect(),
    })
}

/// Locates and summarises every run in `manifest`.
///
/// With `latest_only`, start times are ignored and the newest directory of
/// each simulation is used.
///
/// # Errors
/// Returns [`BuildError::ReportNotFound`] if a run left no directory and
/// [`BuildError::AssertionsFailed`] for the first simulation whose engine
/// verdict is a failure.
pub fn aggregate(
    manifest: &RunManifest,
    assertion_exit_code: i32,
    latest_only: bool,
) -> Result<Vec<ReportSummary>> {
    let mut summaries = Vec::with_capacity(manifest.runs.len());
    for run in &manifest.runs {
        let since = (!latest_only).then(|| SystemTime::from(run.started_at));
        let directory = locate_run_directory(&run.results_dir, &run.simulation, since)?;
        let summary = summarize(&run.simulation, &directory)?;
        info!(
            simulation = %run.simulation,
            passed = summary.passed(),
            "Report at {}",
            directory.display()
        );
        summaries.push((summary, run.exit_code));
    }

    for (summary, exit_code) in &summaries {
        let flagged_by_engine = *exit_code != 0 && *exit_code == assertion_exit_code;
        if !summary.passed() || flagged_by_engine {
            return Err(BuildError::AssertionsFailed {
                simulation: summary.simulation.clone(),
                failed: summary.failed_assertions.len().max(1),
                total: summary.assertions_total.max(1),
                messages: summary.failed_assertions.clone(),
            });
        }
    }

    Ok(summaries.into_iter().map(|(summary, _)| summary).collect())
}

/// Manifest reconstructed from the per-simulation folders in `results_dir`.
///
/// Used when a group has no recorded run. A folder counts when it holds at
/// least one run directory of the simulation it is named after.
///
/// # Errors
/// Returns an error if a directory cannot be read.
pub fn discover_runs(group: &str, results_dir: &Path) -> Result<RunManifest> {
    let mut manifest = RunManifest::new(group, results_dir);
    let entries = match fs::read_dir(results_dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(manifest),
        Err(error) => return Err(error.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let simulation = entry.file_name().to_string_lossy().into_owned();
        if has_run_directory(&entry.path(), &simulation)? {
            manifest.runs.push(RunRecord {
                simulation,
                results_dir: entry.path(),
                started_at: DateTime::<Utc>::UNIX_EPOCH,
                exit_code: 0,
            });
        }
    }
    manifest.runs.sort_by(|left, right| left.simulation.cmp(&right.simulation));
    Ok(manifest)
}

fn has_run_directory(folder: &Path, simulation: &str) -> Result<bool> {
    let prefix = format!("{}-", run_directory_prefix(simulation));
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stamp) = name.strip_prefix(&prefix) else {
            continue;
        };
        let numbered = !stamp.is_empty() && stamp.chars().all(|character| character.is_ascii_digit());
        if numbered && entry.file_type()?.is_dir() {
            return Ok(true);
        }
    }
    Ok(false)
}
