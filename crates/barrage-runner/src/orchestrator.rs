//! Entry point tying configuration, graph construction and scheduling together.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use barrage_build::{Compiler, ProcessCompiler, SourceSets};
use barrage_core::{BuildConfig, BuildError, BuildSummary, FingerprintCache, Result};
use barrage_graph::{
    CancellationToken, GraphBuilder, NodeExecutor, Scheduler, SchedulerOptions, Verb,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::actions::BuildActions;
use crate::enterprise::EnterpriseClient;
use crate::launcher::{OutputLine, SimulationLauncher};
use crate::layout::{BuildLayout, resolve_program};

/// Invocation-level settings that take precedence over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct BuildOverrides {
    /// Worker pool size
    pub max_workers: Option<usize>,
    /// Per-simulation wall-clock limit
    pub run_timeout: Option<Duration>,
    /// Run only this simulation (fully-qualified or simple name)
    pub simulation: Option<String>,
    /// Extra system properties; replace configured ones with the same key
    pub system_properties: BTreeMap<String, String>,
    /// Cancel the whole build on the first failure
    pub abort_on_failure: bool,
}

impl BuildOverrides {
    /// Writes the overrides into `config`.
    pub fn apply(&self, config: &mut BuildConfig) {
        if let Some(workers) = self.max_workers {
            config.execution.max_workers = workers;
        }
        if let Some(limit) = self.run_timeout {
            config.execution.run_timeout_secs = Some(limit.as_secs().max(1));
        }
        if self.abort_on_failure {
            config.execution.abort_on_failure = true;
        }
        config.system_properties.extend(
            self.system_properties
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
    }
}

/// Runs build verbs over one project.
pub struct Orchestrator {
    config: Arc<BuildConfig>,
    sets: Arc<SourceSets>,
    layout: BuildLayout,
    compiler: Arc<dyn Compiler>,
    enterprise: Option<Arc<dyn EnterpriseClient>>,
    sink: Option<mpsc::Sender<OutputLine>>,
    simulation: Option<String>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Resolves the source groups of `config`.
    ///
    /// # Errors
    /// Returns a configuration error if the configuration is invalid or the
    /// source groups cannot be resolved.
    pub fn new(config: BuildConfig) -> Result<Self> {
        Self::with_overrides(config, &BuildOverrides::default())
    }

    /// Applies `overrides` to `config`, then resolves its source groups.
    ///
    /// # Errors
    /// Returns a configuration error if the resulting configuration is invalid.
    pub fn with_overrides(mut config: BuildConfig, overrides: &BuildOverrides) -> Result<Self> {
        overrides.apply(&mut config);
        config.validate()?;
        let sets = SourceSets::resolve(&config)?;
        let compiler = ProcessCompiler::new(resolve_program(&config, &config.compiler.program));
        debug!(
            groups = sets.groups().len(),
            workers = config.execution.max_workers,
            "Project resolved"
        );
        Ok(Self {
            layout: BuildLayout::from_config(&config),
            config: Arc::new(config),
            sets: Arc::new(sets),
            compiler: Arc::new(compiler),
            enterprise: None,
            sink: None,
            simulation: overrides.simulation.clone(),
            cancel: CancellationToken::new(),
        })
    }

    /// Compiles with `compiler` instead of the configured program.
    #[must_use]
    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = compiler;
        self
    }

    /// Submits uploads through `client`.
    #[must_use]
    pub fn with_enterprise_client(mut self, client: Arc<dyn EnterpriseClient>) -> Self {
        self.enterprise = Some(client);
        self
    }

    /// Forwards simulation output lines to `sink`.
    #[must_use]
    pub fn with_output_sink(mut self, sink: mpsc::Sender<OutputLine>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Token that cancels running builds when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Effective configuration.
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Resolved source groups.
    pub fn source_sets(&self) -> &SourceSets {
        &self.sets
    }

    /// Build directory layout.
    pub fn layout(&self) -> &BuildLayout {
        &self.layout
    }

    /// Runs `verb` for the `groups` named (all groups when empty).
    ///
    /// Node failures are reported in the summary.
    ///
    /// # Errors
    /// Returns a configuration error for unknown groups or an upload without
    /// enterprise settings, and I/O errors opening the fingerprint cache.
    pub async fn execute(&self, verb: Verb, groups: &[String]) -> Result<BuildSummary> {
        if verb == Verb::Upload && self.config.enterprise.is_none() {
            return Err(BuildError::Configuration(
                "upload requires an [enterprise] section".to_owned(),
            ));
        }
        let graph = GraphBuilder::new(&self.sets).build(verb, groups)?;
        info!(%verb, tasks = graph.len(), "Executing build");

        let mut launcher = SimulationLauncher::new(
            self.config.execution.output_buffer,
            self.config.engine.assertion_failure_exit_code,
        );
        if let Some(sink) = &self.sink {
            launcher = launcher.with_sink(sink.clone());
        }
        let mut actions = BuildActions::new(
            Arc::clone(&self.config),
            Arc::clone(&self.sets),
            Arc::clone(&self.compiler),
            Arc::new(launcher),
        )
        .with_simulation(self.simulation.clone());
        if let Some(client) = &self.enterprise {
            actions = actions.with_enterprise_client(Arc::clone(client));
        }

        let scheduler = Scheduler::new(
            Arc::new(actions) as Arc<dyn NodeExecutor>,
            FingerprintCache::open(self.layout.cache_dir())?,
            SchedulerOptions {
                max_workers: self.config.execution.max_workers,
                abort_on_failure: self.config.execution.abort_on_failure,
            },
        )
        .with_cancellation(self.cancel.child_token());
        scheduler.execute(&graph).await
    }

    /// Compiles the selected groups and their dependencies.
    ///
    /// # Errors
    /// See [`Self::execute`].
    pub async fn compile(&self, groups: &[String]) -> Result<BuildSummary> {
        self.execute(Verb::Compile, groups).await
    }

    /// Compiles and runs the selected groups, then aggregates their reports.
    ///
    /// # Errors
    /// See [`Self::execute`].
    pub async fn run(&self, groups: &[String]) -> Result<BuildSummary> {
        self.execute(Verb::Run, groups).await
    }

    /// Aggregates the newest existing reports without running anything.
    ///
    /// # Errors
    /// See [`Self::execute`].
    pub async fn report(&self, groups: &[String]) -> Result<BuildSummary> {
        self.execute(Verb::Report, groups).await
    }

    /// Compiles, packages and submits the selected groups.
    ///
    /// # Errors
    /// See [`Self::execute`].
    pub async fn upload(&self, groups: &[String]) -> Result<BuildSummary> {
        self.execute(Verb::Upload, groups).await
    }

    /// Deletes the build directory, fingerprint cache included.
    ///
    /// Returns whether anything was removed.
    ///
    /// # Errors
    /// Returns an error if the directory exists but cannot be removed.
    pub fn clean(&self) -> Result<bool> {
        let root = self.layout.root();
        match fs::remove_dir_all(root) {
            Ok(()) => {
                info!("Removed {}", root.display());
                Ok(true)
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barrage_core::SourceGroupConfig;
    use tempfile::TempDir;

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = BuildConfig::default();
        config.execution.max_workers = 4;
        config
            .system_properties
            .insert("users".to_owned(), "10".to_owned());

        let mut overrides = BuildOverrides {
            max_workers: Some(1),
            run_timeout: Some(Duration::from_secs(90)),
            ..BuildOverrides::default()
        };
        overrides
            .system_properties
            .insert("users".to_owned(), "50".to_owned());
        overrides.apply(&mut config);

        assert_eq!(config.execution.max_workers, 1);
        assert_eq!(config.execution.run_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(config.system_properties["users"], "50");
    }

    #[test]
    fn test_zero_workers_rejected() {
        let dir = TempDir::new().expect("create temp dir");
        let mut config = BuildConfig::default();
        config.project.root = dir.path().to_path_buf();
        let overrides = BuildOverrides {
            max_workers: Some(0),
            ..BuildOverrides::default()
        };
        let error = Orchestrator::with_overrides(config, &overrides)
            .err()
            .expect("zero workers is invalid");
        assert!(matches!(error, BuildError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_upload_without_enterprise_is_a_configuration_error() {
        let dir = TempDir::new().expect("create temp dir");
        let mut config = BuildConfig::default();
        config.project.root = dir.path().to_path_buf();
        config.source_groups = vec![SourceGroupConfig::named("web")];
        let orchestrator = Orchestrator::new(config).expect("orchestrator");

        let error = orchestrator.upload(&[]).await.expect_err("no enterprise");
        assert!(matches!(error, BuildError::Configuration(_)));
    }

    #[test]
    fn test_clean_removes_build_directory() {
        let dir = TempDir::new().expect("create temp dir");
        let mut config = BuildConfig::default();
        config.project.root = dir.path().to_path_buf();
        let orchestrator = Orchestrator::new(config).expect("orchestrator");

        assert!(!orchestrator.clean().expect("clean"));
        fs::create_dir_all(orchestrator.layout().cache_dir()).expect("create cache");
        assert!(orchestrator.clean().expect("clean"));
        assert!(!orchestrator.layout().root().exists());
    }
}
