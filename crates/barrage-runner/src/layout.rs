//! Directory layout under the build directory.

use std::path::{Path, PathBuf};

use barrage_core::{BuildConfig, TaskId};

/// Locations of everything a build writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayout {
    root: PathBuf,
}

impl BuildLayout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout of the configured build directory.
    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(config.build_dir())
    }

    /// Build directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fingerprint cache.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Cached simulation lists.
    pub fn discovery_dir(&self) -> PathBuf {
        self.root.join("discovery")
    }

    /// Per-task log of `task`.
    pub fn log_file(&self, task: &TaskId) -> PathBuf {
        self.root.join("logs").join(format!("{}.log", task.cache_key()))
    }

    /// Assembled runtime classpath of `group`, one entry per line.
    pub fn classpath_file(&self, group: &str) -> PathBuf {
        self.root.join("classpath").join(format!("{group}.txt"))
    }

    /// Results of every simulation of `group`.
    pub fn results_dir(&self, group: &str) -> PathBuf {
        self.root.join("results").join(group)
    }

    /// Folder the engine writes run directories of one simulation into.
    ///
    /// Keyed by the fully-qualified name so simulations sharing a simple
    /// name never see each other's runs.
    pub fn simulation_results_dir(&self, group: &str, simulation: &str) -> PathBuf {
        self.results_dir(group).join(simulation)
    }

    /// Manifest of the latest run of `group`.
    pub fn run_manifest(&self, group: &str) -> PathBuf {
        self.root.join("runs").join(format!("{group}.json"))
    }

    /// Packages built for remote submission.
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }
}

/// Program paths with a directory part are resolved against the project
/// root; bare names are left for `PATH` lookup.
pub fn resolve_program(config: &BuildConfig, program: &Path) -> PathBuf {
    if program.components().count() > 1 {
        config.resolve_path(program)
    } else {
        program.to_path_buf()
    }
}
