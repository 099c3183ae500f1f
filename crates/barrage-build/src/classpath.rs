//! Classpath assembly.
//!
//! Ordering for a group `g`:
//!
//! 1. `g`'s compiled output and resource roots (runtime only)
//! 2. for each group `g` depends on, in declaration order, that group's
//!    runtime classpath without the engine
//! 3. `g`'s declared external dependencies in declaration order
//! 4. their transitive artifact dependencies in breadth-first order
//! 5. the engine classpath
//!
//! Duplicates keep their first position.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use barrage_core::{
    ArtifactMetadata, BuildConfig, BuildError, DependencyRef, ResolvedClasspath, Result,
    SourceGroup,
};
use glob::glob;

use crate::resolver::SourceSets;

/// Builds deterministic classpaths for resolved source groups.
pub struct ClasspathAssembler<'build> {
    sets: &'build SourceSets,
    artifacts: &'build BTreeMap<String, ArtifactMetadata>,
    root: &'build Path,
}

impl<'build> ClasspathAssembler<'build> {
    /// Assembler over the given groups and artifact metadata.
    pub fn new(sets: &'build SourceSets, config: &'build BuildConfig) -> Self {
        Self {
            sets,
            artifacts: &config.artifacts,
            root: &config.project.root,
        }
    }

    /// Classpath used to compile `group`.
    ///
    /// # Errors
    /// Returns a resolution error if a dependency cannot be located.
    pub fn compile_classpath(
        &self,
        group: &str,
        engine: &ResolvedClasspath,
    ) -> Result<ResolvedClasspath> {
        let group = self.group(group)?;
        let mut classpath = ResolvedClasspath::new();
        self.push_group_dependencies(group, &mut classpath, &mut HashSet::new())?;
        classpath.extend(self.external_dependencies(group)?);
        classpath.extend(engine.entries().iter().cloned());
        Ok(classpath)
    }

    /// Classpath used to run simulations of `group`, engine last.
    ///
    /// # Errors
    /// Returns a resolution error if a dependency cannot be located.
    pub fn runtime_classpath(
        &self,
        group: &str,
        engine: &ResolvedClasspath,
    ) -> Result<ResolvedClasspath> {
        let mut classpath = self.group_classpath(group)?;
        classpath.extend(engine.entries().iter().cloned());
        Ok(classpath)
    }

    /// Runtime classpath of `group` without the engine.
    ///
    /// # Errors
    /// Returns a resolution error if a dependency cannot be located.
    pub fn group_classpath(&self, group: &str) -> Result<ResolvedClasspath> {
        let group = self.group(group)?;
        let mut classpath = ResolvedClasspath::new();
        self.push_group(group, &mut classpath, &mut HashSet::new())?;
        Ok(classpath)
    }

    fn group(&self, name: &str) -> Result<&'build SourceGroup> {
        self.sets
            .get(name)
            .ok_or_else(|| BuildError::Resolution(format!("unknown source group '{name}'")))
    }

    fn push_group(
        &self,
        group: &SourceGroup,
        classpath: &mut ResolvedClasspath,
        visited: &mut HashSet<String>,
    ) -> Result<()> {
        if !visited.insert(group.name.clone()) {
            return Ok(());
        }
        classpath.push(group.output_dir.clone());
        classpath.extend(group.resource_roots.iter().cloned());
        self.push_group_dependencies(group, classpath, visited)?;
        classpath.extend(self.external_dependencies(group)?);
        Ok(())
    }

    fn push_group_dependencies(
        &self,
        group: &SourceGroup,
        classpath: &mut ResolvedClasspath,
        visited: &mut HashSet<String>,
    ) -> Result<()> {
        for dependency in &group.depends_on {
            let upstream = self.group(dependency)?;
            self.push_group(upstream, classpath, visited)?;
        }
        Ok(())
    }

    /// Locations of `group`'s external dependencies, declared first, then
    /// transitive artifacts breadth-first.
    ///
    /// # Errors
    /// Returns a resolution error if a path matches nothing or an artifact
    /// coordinate is missing from the metadata.
    pub fn external_dependencies(&self, group: &SourceGroup) -> Result<Vec<PathBuf>> {
        let mut locations = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = VecDeque::new();

        for dependency in &group.dependencies {
            match dependency {
                DependencyRef::Path(path) => {
                    locations.extend(expand_path_pattern(self.root, path).map_err(|error| {
                        in_context(
                            error,
                            &format!("dependency '{dependency}' of source group '{}'", group.name),
                        )
                    })?);
                }
                DependencyRef::Artifact(coordinate) => {
                    if !seen.insert(coordinate.clone()) {
                        continue;
                    }
                    let metadata = self.artifact(coordinate, &group.name)?;
                    locations.push(self.locate(&metadata.path));
                    pending.extend(metadata.dependencies.iter().cloned());
                }
            }
        }

        while let Some(coordinate) = pending.pop_front() {
            if !seen.insert(coordinate.clone()) {
                continue;
            }
            let metadata = self.artifact(&coordinate, &group.name)?;
            locations.push(self.locate(&metadata.path));
            pending.extend(metadata.dependencies.iter().cloned());
        }

        Ok(locations)
    }

    fn artifact(&self, coordinate: &str, group: &str) -> Result<&'build ArtifactMetadata> {
        self.artifacts.get(coordinate).ok_or_else(|| {
            BuildError::Resolution(format!(
                "dependency '{coordinate}' of source group '{group}' is not present in the artifact metadata"
            ))
        })
    }

    fn locate(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Expands a path that may contain glob wildcards, relative to `root`.
///
/// Plain paths must exist. Patterns must match at least one entry and their
/// matches are returned sorted.
///
/// # Errors
/// Returns a resolution error when nothing is found or the pattern is invalid.
pub fn expand_path_pattern(root: &Path, path: &Path) -> Result<Vec<PathBuf>> {
    let full = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let text = full.to_string_lossy();
    if !text.contains(['*', '?', '[']) {
        return if full.exists() {
            Ok(vec![full])
        } else {
            Err(BuildError::Resolution(format!(
                "{} does not exist",
                full.display()
            )))
        };
    }

    let mut matches = glob(&text)
        .map_err(|error| BuildError::Resolution(format!("invalid pattern '{text}': {error}")))?
        .map(|entry| {
            entry.map_err(|error| BuildError::Resolution(format!("cannot expand '{text}': {error}")))
        })
        .collect::<Result<Vec<_>>>()?;
    if matches.is_empty() {
        return Err(BuildError::Resolution(format!(
            "pattern '{text}' matched nothing"
        )));
    }
    matches.sort();
    Ok(matches)
}

/// Prefixes a resolution error's message with `context`.
pub(crate) fn in_context(error: BuildError, context: &str) -> BuildError {
    match error {
        BuildError::Resolution(message) => BuildError::Resolution(format!("{context}: {message}")),
        other => other,
    }
}
