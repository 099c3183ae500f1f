//! Source set resolution.
//!
//! Turns the configured source groups into [`SourceGroup`]s whose roots are
//! known to exist, stored in an arena indexed by position. Dependency cycles
//! between groups are rejected here, before any task is created.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use barrage_core::config::CONVENTION_LANGUAGES;
use barrage_core::{
    BuildConfig, BuildError, DependencyRef, Result, SourceGroup, SourceGroupConfig,
};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, warn};

/// Resolved source groups of one build invocation.
#[derive(Debug, Clone)]
pub struct SourceSets {
    groups: Vec<SourceGroup>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
}

impl SourceSets {
    /// Resolves every configured group against the filesystem.
    ///
    /// # Errors
    /// Returns a configuration error if the configuration is invalid, if the
    /// groups' `depends_on` declarations form a cycle, or if a declared root of
    /// a required group does not exist.
    pub fn resolve(config: &BuildConfig) -> Result<Self> {
        config.validate()?;

        let index: HashMap<String, usize> = config
            .source_groups
            .iter()
            .enumerate()
            .map(|(position, group)| (group.name.clone(), position))
            .collect();
        let order = dependency_order(&config.source_groups, &index)?;

        let build_dir = config.build_dir();
        let groups = config
            .source_groups
            .iter()
            .map(|group| resolve_group(config, &build_dir, group))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            groups,
            index,
            order,
        })
    }

    /// Groups in declaration order.
    pub fn groups(&self) -> &[SourceGroup] {
        &self.groups
    }

    /// Looks a group up by name.
    pub fn get(&self, name: &str) -> Option<&SourceGroup> {
        self.index.get(name).map(|&position| &self.groups[position])
    }

    /// Whether a group with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Groups ordered so that every group follows the groups it depends on.
    pub fn topological(&self) -> impl Iterator<Item = &SourceGroup> {
        self.order.iter().map(|&position| &self.groups[position])
    }

    /// Every group `name` depends on, directly or not.
    ///
    /// Depth-first in declaration order, each group listed once before the
    /// groups that depend on it.
    pub fn transitive_dependencies(&self, name: &str) -> Vec<&SourceGroup> {
        let mut visited = HashSet::new();
        let mut ordered = Vec::new();
        if let Some(group) = self.get(name) {
            for dependency in &group.depends_on {
                self.collect_dependencies(dependency, &mut visited, &mut ordered);
            }
        }
        ordered
    }

    fn collect_dependencies<'sets>(
        &'sets self,
        name: &str,
        visited: &mut HashSet<String>,
        ordered: &mut Vec<&'sets SourceGroup>,
    ) {
        if !visited.insert(name.to_owned()) {
            return;
        }
        let Some(group) = self.get(name) else {
            return;
        };
        for dependency in &group.depends_on {
            self.collect_dependencies(dependency, visited, ordered);
        }
        ordered.push(group);
    }

    /// Names in `selected` plus every group they depend on, in topological
    /// order.
    ///
    /// # Errors
    /// Returns a configuration error for an unknown group name.
    pub fn closure(&self, selected: &[String]) -> Result<Vec<String>> {
        let mut wanted = HashSet::new();
        for name in selected {
            if !self.contains(name) {
                return Err(BuildError::Configuration(format!(
                    "unknown source group '{name}'"
                )));
            }
            wanted.insert(name.clone());
            wanted.extend(
                self.transitive_dependencies(name)
                    .into_iter()
                    .map(|group| group.name.clone()),
            );
        }
        Ok(self
            .topological()
            .filter(|group| wanted.contains(&group.name))
            .map(|group| group.name.clone())
            .collect())
    }
}

fn dependency_order(
    groups: &[SourceGroupConfig],
    index: &HashMap<String, usize>,
) -> Result<Vec<usize>> {
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<NodeIndex> = (0..groups.len()).map(|position| graph.add_node(position)).collect();

    for (position, group) in groups.iter().enumerate() {
        for dependency in &group.depends_on {
            let Some(&upstream) = index.get(dependency) else {
                return Err(BuildError::Configuration(format!(
                    "source group '{}' depends on unknown group '{dependency}'",
                    group.name
                )));
            };
            graph.add_edge(nodes[upstream], nodes[position], ());
        }
    }

    toposort(&graph, None)
        .map(|sorted| sorted.into_iter().map(|node| graph[node]).collect())
        .map_err(|cycle| {
            let name = &groups[graph[cycle.node_id()]].name;
            BuildError::Configuration(format!(
                "dependency cycle between source groups involving '{name}'"
            ))
        })
}

fn resolve_group(
    config: &BuildConfig,
    build_dir: &Path,
    group: &SourceGroupConfig,
) -> Result<SourceGroup> {
    let source_roots = match &group.source_roots {
        Some(roots) => declared_roots(config, group, roots, "source")?,
        None => CONVENTION_LANGUAGES
            .iter()
            .map(|language| convention_root(config, &group.name, language))
            .filter(|root| root.is_dir())
            .collect(),
    };
    let resource_roots = match &group.resource_roots {
        Some(roots) => declared_roots(config, group, roots, "resource")?,
        None => {
            let root = convention_root(config, &group.name, "resources");
            if root.is_dir() { vec![root] } else { Vec::new() }
        }
    };

    if source_roots.is_empty() {
        debug!(group = %group.name, "Source group has no source roots");
    }

    Ok(SourceGroup {
        name: group.name.clone(),
        source_roots,
        resource_roots,
        depends_on: group.depends_on.clone(),
        dependencies: group
            .dependencies
            .iter()
            .map(|dependency| DependencyRef::parse(dependency))
            .collect(),
        output_dir: build_dir.join("classes").join(&group.name),
    })
}

fn convention_root(config: &BuildConfig, group: &str, leaf: &str) -> PathBuf {
    config.project.root.join("src").join(group).join(leaf)
}

fn declared_roots(
    config: &BuildConfig,
    group: &SourceGroupConfig,
    roots: &[PathBuf],
    kind: &str,
) -> Result<Vec<PathBuf>> {
    let mut resolved = Vec::with_capacity(roots.len());
    for root in roots {
        let path = config.resolve_path(root);
        if path.is_dir() {
            resolved.push(path);
        } else if group.required {
            return Err(BuildError::Configuration(format!(
                "{kind} root {} of source group '{}' does not exist",
                path.display(),
                group.name
            )));
        } else {
            warn!(group = %group.name, "Skipping missing {kind} root {}", path.display());
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir, groups: Vec<SourceGroupConfig>) -> BuildConfig {
        let mut config = BuildConfig::default();
        config.project.root = dir.path().to_path_buf();
        config.source_groups = groups;
        config
    }

    #[test]
    fn test_convention_roots_skip_missing_languages() {
        let dir = TempDir::new().expect("create temp dir");
        fs::create_dir_all(dir.path().join("src/web/java")).expect("create java root");
        fs::create_dir_all(dir.path().join("src/web/resources")).expect("create resources");

        let config = config_in(&dir, vec![SourceGroupConfig::named("web")]);
        let sets = SourceSets::resolve(&config).expect("resolve");
        let web = sets.get("web").expect("web group");

        assert_eq!(web.source_roots, vec![dir.path().join("src/web/java")]);
        assert_eq!(web.resource_roots, vec![dir.path().join("src/web/resources")]);
        assert_eq!(
            web.output_dir,
            dir.path().join("build/barrage/classes/web")
        );
    }

    #[test]
    fn test_missing_declared_root_of_required_group_fails() {
        let dir = TempDir::new().expect("create temp dir");
        let group =
            SourceGroupConfig::named("web").with_source_roots(vec![PathBuf::from("missing")]);
        let error = SourceSets::resolve(&config_in(&dir, vec![group])).expect_err("must fail");
        assert!(matches!(error, BuildError::Configuration(_)), "{error}");
        assert!(error.to_string().contains("missing"));
    }

    #[test]
    fn test_missing_declared_root_of_optional_group_is_skipped() {
        let dir = TempDir::new().expect("create temp dir");
        let mut group =
            SourceGroupConfig::named("web").with_source_roots(vec![PathBuf::from("missing")]);
        group.required = false;
        let sets = SourceSets::resolve(&config_in(&dir, vec![group])).expect("resolve");
        assert!(sets.get("web").expect("web group").source_roots.is_empty());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let dir = TempDir::new().expect("create temp dir");
        let groups = vec![
            SourceGroupConfig::named("a").depends_on("c"),
            SourceGroupConfig::named("b").depends_on("a"),
            SourceGroupConfig::named("c").depends_on("b"),
        ];
        let error = SourceSets::resolve(&config_in(&dir, groups)).expect_err("must fail");
        assert!(matches!(error, BuildError::Configuration(_)));
        assert!(error.to_string().contains("cycle"), "{error}");
    }

    #[test]
    fn test_topological_order_and_closure() {
        let dir = TempDir::new().expect("create temp dir");
        let groups = vec![
            SourceGroupConfig::named("web-extra").depends_on("web"),
            SourceGroupConfig::named("web").depends_on("shared"),
            SourceGroupConfig::named("shared"),
            SourceGroupConfig::named("api"),
        ];
        let sets = SourceSets::resolve(&config_in(&dir, groups)).expect("resolve");

        let order: Vec<&str> = sets.topological().map(|group| group.name.as_str()).collect();
        let position = |name: &str| order.iter().position(|entry| *entry == name).expect(name);
        assert!(position("shared") < position("web"));
        assert!(position("web") < position("web-extra"));

        let transitive: Vec<&str> = sets
            .transitive_dependencies("web-extra")
            .into_iter()
            .map(|group| group.name.as_str())
            .collect();
        assert_eq!(transitive, vec!["shared", "web"]);

        let closure = sets.closure(&["web-extra".to_owned()]).expect("closure");
        assert_eq!(closure.len(), 3);
        assert!(!closure.contains(&"api".to_owned()));
        assert!(sets.closure(&["nope".to_owned()]).is_err());
    }
}
