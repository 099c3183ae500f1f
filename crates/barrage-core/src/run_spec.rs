//! Fully-resolved launch descriptor for one simulation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::source_group::ResolvedClasspath;

/// Everything the launcher needs to fork a simulation process.
///
/// Built once per simulation by the run task and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationRunSpec {
    /// Fully-qualified simulation name passed to the engine
    pub simulation: String,
    /// Runtime classpath including the engine
    pub classpath: ResolvedClasspath,
    /// Program used to start the engine (a `java` executable)
    pub java: PathBuf,
    /// Engine entry point
    pub main_class: String,
    /// Heap, GC and other process-level flags
    pub jvm_options: Vec<String>,
    /// Passed as `-Dkey=value`; sorted for reproducible command lines
    pub system_properties: BTreeMap<String, String>,
    /// Working directory of the child process
    pub working_dir: PathBuf,
    /// Per-simulation folder in which the engine creates run-scoped output directories
    pub results_dir: PathBuf,
    /// Optional wall-clock limit
    pub timeout: Option<Duration>,
}

impl SimulationRunSpec {
    /// Arguments following the program name, in launch order.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.jvm_options.clone();
        args.extend(
            self.system_properties
                .iter()
                .map(|(key, value)| format!("-D{key}={value}")),
        );
        args.push("-cp".to_owned());
        args.push(self.classpath.to_classpath_string());
        args.push(self.main_class.clone());
        args.push("--simulation".to_owned());
        args.push(self.simulation.clone());
        args.push("--results-folder".to_owned());
        args.push(self.results_dir.display().to_string());
        args
    }

    /// Lowercased simple class name the engine uses to prefix run directories.
    pub fn run_directory_prefix(&self) -> String {
        run_directory_prefix(&self.simulation)
    }
}

/// Lowercased simple class name of a fully-qualified simulation.
pub fn run_directory_prefix(simulation: &str) -> String {
    simulation
        .rsplit('.')
        .next()
        .unwrap_or(simulation)
        .to_lowercase()
}
