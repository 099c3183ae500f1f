//! The action behind every kind of task node.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use barrage_build::{
    ClasspathAssembler, CompileRequest, Compiler, DiscoveryCache, SimulationFilter, SourceFile,
    SourceSets, collect_sources, compile_fingerprint, engine_fingerprint, output_fingerprint,
    resolve_engine_classpath,
};
use barrage_core::{
    BuildConfig, BuildError, Fingerprint, FingerprintAlgorithm, Fingerprinter, ResolvedClasspath,
    Result, SimulationRunSpec, SourceGroup, TaskId, TaskKind,
};
use barrage_graph::{NodeContext, NodeExecutor, NodeOutput, TaskNode, UpstreamOutputs};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::enterprise::{EnterpriseClient, HttpEnterpriseClient, RemoteSubmitter, create_package};
use crate::launcher::SimulationLauncher;
use crate::layout::{BuildLayout, resolve_program};
use crate::report::{RunManifest, RunRecord, aggregate, discover_runs};

/// Executes compile, classpath, run, report and upload nodes.
pub struct BuildActions {
    config: Arc<BuildConfig>,
    sets: Arc<SourceSets>,
    layout: BuildLayout,
    compiler: Arc<dyn Compiler>,
    launcher: Arc<SimulationLauncher>,
    enterprise: Option<Arc<dyn EnterpriseClient>>,
    discovery: DiscoveryCache,
    only: Option<String>,
}

impl BuildActions {
    /// Actions over the resolved `sets` of `config`.
    pub fn new(
        config: Arc<BuildConfig>,
        sets: Arc<SourceSets>,
        compiler: Arc<dyn Compiler>,
        launcher: Arc<SimulationLauncher>,
    ) -> Self {
        let layout = BuildLayout::from_config(&config);
        let discovery = DiscoveryCache::new(layout.discovery_dir());
        Self {
            config,
            sets,
            layout,
            compiler,
            launcher,
            enterprise: None,
            discovery,
            only: None,
        }
    }

    /// Submits uploads through `client` instead of the HTTP API.
    #[must_use]
    pub fn with_enterprise_client(mut self, client: Arc<dyn EnterpriseClient>) -> Self {
        self.enterprise = Some(client);
        self
    }

    /// Runs only the named simulation.
    #[must_use]
    pub fn with_simulation(mut self, simulation: Option<String>) -> Self {
        self.only = simulation;
        self
    }

    fn algorithm(&self) -> FingerprintAlgorithm {
        self.config.fingerprint.algorithm
    }

    fn group(&self, node: &TaskNode) -> Result<&SourceGroup> {
        let name = node.id.group.as_deref().ok_or_else(|| {
            BuildError::Internal(format!("task {} has no source group", node.id))
        })?;
        self.sets
            .get(name)
            .ok_or_else(|| BuildError::Internal(format!("unknown source group '{name}'")))
    }

    fn assembler(&self) -> ClasspathAssembler<'_> {
        ClasspathAssembler::new(&self.sets, &self.config)
    }

    fn compile_request(&self, group: &SourceGroup) -> Result<CompileRequest> {
        let engine = resolve_engine_classpath(&self.config)?;
        Ok(CompileRequest {
            group: group.name.clone(),
            sources: collect_sources(group, &self.config.compiler.extensions)?,
            classpath: self.assembler().compile_classpath(&group.name, &engine)?,
            output_dir: group.output_dir.clone(),
            options: self.config.compiler.options.clone(),
            working_dir: self.config.project.root.clone(),
        })
    }

    fn runtime_classpath(&self, group: &SourceGroup) -> Result<ResolvedClasspath> {
        let engine = resolve_engine_classpath(&self.config)?;
        self.assembler().runtime_classpath(&group.name, &engine)
    }

    /// Folds upstream output fingerprints into `own`.
    fn with_upstream(&self, own: &Fingerprint, upstream: &UpstreamOutputs) -> Fingerprint {
        let mut fingerprinter = Fingerprinter::new(self.algorithm());
        fingerprinter.fingerprint("own", own);
        for (id, output) in upstream {
            fingerprinter.fingerprint(&id.cache_key(), output);
        }
        fingerprinter.finish()
    }

    fn classpath_fingerprint(&self, classpath: &ResolvedClasspath) -> Fingerprint {
        let mut fingerprinter = Fingerprinter::new(self.algorithm());
        fingerprinter.str("classpath", &classpath.to_classpath_string());
        fingerprinter.finish()
    }

    async fn compile(&self, node: &TaskNode, context: &NodeContext) -> Result<NodeOutput> {
        let group = self.group(node)?;
        let request = self.compile_request(group)?;
        let log = self.layout.log_file(&node.id);

        let output = tokio::select! {
            output = self.compiler.compile(&request) => output,
            () = context.cancel.cancelled() => return Err(BuildError::Cancelled),
        };
        let output = match output {
            Ok(output) => output,
            Err(error) => {
                if let BuildError::Compilation { diagnostics, .. } = &error {
                    write_log(&log, diagnostics);
                }
                return Err(error);
            }
        };
        write_log(&log, &output.diagnostics);
        info!(
            group = %group.name,
            files = output.compiled,
            "Compiled in {:?}",
            output.duration
        );

        let fingerprint = output_fingerprint(self.algorithm(), &group.output_dir)?;
        Ok(NodeOutput::new(fingerprint).with_artifacts(vec![group.output_dir.clone()]))
    }

    fn assemble_classpath(&self, node: &TaskNode, context: &NodeContext) -> Result<NodeOutput> {
        let group = self.group(node)?;
        let classpath = self.runtime_classpath(group)?;
        if let Some(missing) = classpath.entries().iter().find(|entry| !entry.exists()) {
            return Err(BuildError::Resolution(format!(
                "classpath entry {} of source group '{}' does not exist",
                missing.display(),
                group.name
            )));
        }

        let file = self.layout.classpath_file(&group.name);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        let listing: Vec<String> = classpath
            .entries()
            .iter()
            .map(|entry| entry.display().to_string())
            .collect();
        fs::write(&file, listing.join("\n"))?;
        debug!(group = %group.name, entries = classpath.len(), "Assembled runtime classpath");

        let fingerprint = self.with_upstream(&self.classpath_fingerprint(&classpath), &context.upstream);
        Ok(NodeOutput::new(fingerprint).with_artifacts(vec![file]))
    }

    async fn run(&self, node: &TaskNode, context: &NodeContext) -> Result<NodeOutput> {
        let group = self.group(node)?;
        let sources = collect_sources(group, &self.config.compiler.extensions)?;
        let key = match context
            .upstream
            .get(&TaskId::new(group.name.clone(), TaskKind::AssembleClasspath))
        {
            Some(fingerprint) => fingerprint.clone(),
            None => sources_fingerprint(self.algorithm(), &sources)?,
        };
        let discovered = self.discovery.discover(&group.name, &key, &sources)?;
        let selected = SimulationFilter::from_config(&self.config)?
            .with_only(self.only.clone())
            .apply(&discovered);
        if selected.is_empty() {
            warn!(
                group = %group.name,
                discovered = discovered.len(),
                "No simulation selected to run"
            );
        }

        let classpath = self.runtime_classpath(group)?;
        let results_dir = self.layout.results_dir(&group.name);
        let log = self.layout.log_file(&node.id);
        write_log(&log, "");

        let manifest_path = self.layout.run_manifest(&group.name);
        let mut manifest = RunManifest::new(group.name.clone(), results_dir.clone());
        let mut fingerprinter = Fingerprinter::new(self.algorithm());
        for simulation in selected {
            let simulation_results = self.layout.simulation_results_dir(&group.name, &simulation);
            let spec = SimulationRunSpec {
                simulation: simulation.clone(),
                classpath: classpath.clone(),
                java: resolve_program(&self.config, &self.config.engine.java),
                main_class: self.config.engine.main_class.clone(),
                jvm_options: self.config.jvm_options.clone(),
                system_properties: self.config.system_properties.clone(),
                working_dir: self.config.project.root.clone(),
                results_dir: simulation_results.clone(),
                timeout: self.config.execution.run_timeout(),
            };
            info!(group = %group.name, simulation, "Launching simulation");
            let outcome = match self.launcher.launch(&spec, &log, &context.cancel).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    manifest.store(&manifest_path)?;
                    return Err(error);
                }
            };
            fingerprinter
                .str("simulation", &outcome.simulation)
                .str("started", &outcome.started_at.to_rfc3339());
            manifest.runs.push(RunRecord {
                simulation: outcome.simulation,
                results_dir: simulation_results,
                started_at: outcome.started_at,
                exit_code: outcome.exit_code,
            });
        }
        fingerprinter.str("finished", &Utc::now().to_rfc3339());
        manifest.store(&manifest_path)?;

        Ok(NodeOutput::new(fingerprinter.finish()).with_artifacts(vec![manifest_path, log]))
    }

    fn report(&self, node: &TaskNode) -> Result<NodeOutput> {
        let group = self.group(node)?;
        let after_run = node
            .upstream
            .iter()
            .any(|id| id.kind == TaskKind::Run);
        let results_dir = self.layout.results_dir(&group.name);

        let (manifest, latest_only) = match RunManifest::load(&self.layout.run_manifest(&group.name))? {
            Some(manifest) => (manifest, !after_run),
            None if after_run => {
                return Err(BuildError::ReportNotFound {
                    simulation: format!("<any simulation of '{}'>", group.name),
                    dir: results_dir,
                });
            }
            None => (discover_runs(&group.name, &results_dir)?, true),
        };
        if manifest.runs.is_empty() && !after_run {
            return Err(BuildError::ReportNotFound {
                simulation: format!("<any simulation of '{}'>", group.name),
                dir: results_dir,
            });
        }

        let reports = aggregate(
            &manifest,
            self.config.engine.assertion_failure_exit_code,
            latest_only,
        )?;
        let mut fingerprinter = Fingerprinter::new(self.algorithm());
        for report in &reports {
            fingerprinter.str("report", &report.directory.to_string_lossy());
        }
        let artifacts = reports.iter().map(|report| report.directory.clone()).collect();
        Ok(NodeOutput::new(fingerprinter.finish())
            .with_reports(reports)
            .with_artifacts(artifacts))
    }

    async fn upload(&self, node: &TaskNode, context: &NodeContext) -> Result<NodeOutput> {
        let group = self.group(node)?;
        let Some(enterprise) = self.config.enterprise.clone() else {
            return Err(BuildError::Configuration(
                "upload requires an [enterprise] section".to_owned(),
            ));
        };
        let client = match &self.enterprise {
            Some(client) => Arc::clone(client),
            None => Arc::new(HttpEnterpriseClient::new(&enterprise)?) as Arc<dyn EnterpriseClient>,
        };

        let classpath = self.assembler().group_classpath(&group.name)?;
        let package = create_package(group, &classpath, &self.layout.packages_dir()).await?;
        let outcome = RemoteSubmitter::new(client, enterprise)
            .submit(&package, &context.cancel)
            .await?;
        info!(
            group = %group.name,
            package = outcome.package_id,
            run = outcome.run_id.as_deref().unwrap_or("-"),
            "Submitted to remote execution"
        );

        let mut fingerprinter = Fingerprinter::new(self.algorithm());
        fingerprinter.str("package", &outcome.package_id);
        if let Some(run_id) = &outcome.run_id {
            fingerprinter.str("run", run_id);
        }
        Ok(NodeOutput::new(fingerprinter.finish()).with_artifacts(vec![package]))
    }
}

#[async_trait]
impl NodeExecutor for BuildActions {
    async fn input_fingerprint(
        &self,
        node: &TaskNode,
        upstream: &UpstreamOutputs,
    ) -> Result<Option<Fingerprint>> {
        let own = match node.id.kind {
            TaskKind::ResolveEngine => engine_fingerprint(&self.config, self.algorithm())?,
            TaskKind::Compile => {
                let request = self.compile_request(self.group(node)?)?;
                compile_fingerprint(self.algorithm(), self.compiler.as_ref(), &request)?
            }
            TaskKind::AssembleClasspath => {
                self.classpath_fingerprint(&self.runtime_classpath(self.group(node)?)?)
            }
            TaskKind::Run | TaskKind::Report | TaskKind::Upload => return Ok(None),
        };
        Ok(Some(self.with_upstream(&own, upstream)))
    }

    fn outputs_exist(&self, node: &TaskNode) -> bool {
        match node.id.kind {
            TaskKind::Compile => self.group(node).is_ok_and(|group| group.output_dir.is_dir()),
            TaskKind::AssembleClasspath => node
                .id
                .group
                .as_deref()
                .is_some_and(|group| self.layout.classpath_file(group).is_file()),
            _ => true,
        }
    }

    async fn execute(&self, node: &TaskNode, context: NodeContext) -> Result<NodeOutput> {
        if context.cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        match node.id.kind {
            TaskKind::ResolveEngine => {
                let classpath = resolve_engine_classpath(&self.config)?;
                debug!(entries = classpath.len(), "Engine classpath ready");
                Ok(NodeOutput::new(engine_fingerprint(&self.config, self.algorithm())?)
                    .with_artifacts(classpath.entries().to_vec()))
            }
            TaskKind::Compile => self.compile(node, &context).await,
            TaskKind::AssembleClasspath => self.assemble_classpath(node, &context),
            TaskKind::Run => self.run(node, &context).await,
            TaskKind::Report => self.report(node),
            TaskKind::Upload => self.upload(node, &context).await,
        }
    }

    fn log_path(&self, node: &TaskNode) -> Option<PathBuf> {
        matches!(node.id.kind, TaskKind::Compile | TaskKind::Run)
            .then(|| self.layout.log_file(&node.id))
    }
}

fn sources_fingerprint(
    algorithm: FingerprintAlgorithm,
    sources: &[SourceFile],
) -> Result<Fingerprint> {
    let mut fingerprinter = Fingerprinter::new(algorithm);
    for source in sources {
        fingerprinter.file_contents(&source.root, &source.path)?;
    }
    Ok(fingerprinter.finish())
}

fn write_log(path: &Path, contents: &str) {
    let result = path
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| fs::write(path, contents));
    if let Err(error) = result {
        warn!("Cannot write task log {}: {error}", path.display());
    }
}
