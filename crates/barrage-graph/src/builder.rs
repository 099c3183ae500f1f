//! Task graph construction per verb.
//!
//! Shape for a group `g`:
//!
//! ```text
//! resolve-engine ──┬──> compile(g) ──> assemble-classpath(g) ──┬──> run(g) ──> report(g)
//! compile(dep) ────┘                                           └──> upload(g)
//! ```

use core::fmt;

use barrage_build::SourceSets;
use barrage_core::{BuildError, Result, TaskId, TaskKind};
use tracing::debug;

use crate::graph::TaskGraph;

/// User-facing build verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Compile the selected groups and the groups they depend on
    Compile,
    /// Compile, assemble, run and report the selected groups
    Run,
    /// Report on the latest existing runs without running anything
    Report,
    /// Compile, assemble and submit the selected groups remotely
    Upload,
}

impl Verb {
    /// Lowercase verb name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Run => "run",
            Self::Report => "report",
            Self::Upload => "upload",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Builds the task graph for a verb over resolved source groups.
pub struct GraphBuilder<'sets> {
    sets: &'sets SourceSets,
}

impl<'sets> GraphBuilder<'sets> {
    /// Builder over already-resolved groups.
    pub fn new(sets: &'sets SourceSets) -> Self {
        Self { sets }
    }

    /// Graph for `verb`, restricted to `filter` when it is non-empty.
    ///
    /// Groups the selected groups depend on are compiled too, but only the
    /// selected groups are assembled, run, reported or uploaded.
    ///
    /// # Errors
    /// Returns a configuration error for an unknown group name or if the
    /// resulting graph is cyclic.
    pub fn build(&self, verb: Verb, filter: &[String]) -> Result<TaskGraph> {
        let selected: Vec<String> = if filter.is_empty() {
            self.sets
                .topological()
                .map(|group| group.name.clone())
                .collect()
        } else {
            for name in filter {
                if !self.sets.contains(name) {
                    return Err(BuildError::Configuration(format!(
                        "unknown source group '{name}'"
                    )));
                }
            }
            self.sets
                .topological()
                .filter(|group| filter.contains(&group.name))
                .map(|group| group.name.clone())
                .collect()
        };

        let mut graph = TaskGraph::new();
        if verb == Verb::Report {
            for group in &selected {
                graph.add_task(TaskId::new(group.as_str(), TaskKind::Report));
            }
            return Ok(graph);
        }

        let engine = TaskId::shared(TaskKind::ResolveEngine);
        graph.add_task(engine.clone());
        for group in self.sets.closure(&selected)? {
            self.add_compile(&mut graph, &engine, &group)?;
        }

        if verb != Verb::Compile {
            for group in &selected {
                let compile = TaskId::new(group.as_str(), TaskKind::Compile);
                let classpath = TaskId::new(group.as_str(), TaskKind::AssembleClasspath);
                graph.add_task(classpath.clone());
                graph.add_dependency(&compile, &classpath)?;
                graph.add_dependency(&engine, &classpath)?;

                let leaves: &[TaskKind] = match verb {
                    Verb::Run => &[TaskKind::Run, TaskKind::Report],
                    _ => &[TaskKind::Upload],
                };
                let mut previous = classpath;
                for &kind in leaves {
                    let id = TaskId::new(group.as_str(), kind);
                    graph.add_task(id.clone());
                    graph.add_dependency(&previous, &id)?;
                    previous = id;
                }
            }
        }

        if graph.has_cycles() {
            return Err(BuildError::Configuration(format!(
                "task graph for '{verb}' contains a cycle"
            )));
        }
        debug!(verb = %verb, tasks = graph.len(), "Built task graph");
        Ok(graph)
    }

    fn add_compile(&self, graph: &mut TaskGraph, engine: &TaskId, group: &str) -> Result<()> {
        let compile = TaskId::new(group, TaskKind::Compile);
        graph.add_task(compile.clone());
        graph.add_dependency(engine, &compile)?;
        if let Some(source_group) = self.sets.get(group) {
            for dependency in &source_group.depends_on {
                let upstream = TaskId::new(dependency.as_str(), TaskKind::Compile);
                graph.add_task(upstream.clone());
                graph.add_dependency(&upstream, &compile)?;
            }
        }
        Ok(())
    }
}
