//! Source groups and resolved classpaths.

use core::fmt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A declared dependency of a source group.
///
/// Strings of the form `group:name:version` are artifact coordinates resolved
/// through the artifact metadata; everything else is a filesystem path that may
/// contain glob wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencyRef {
    /// Coordinate looked up in already-resolved artifact metadata
    Artifact(String),
    /// File or directory, optionally a glob pattern, relative to the project root
    Path(PathBuf),
}

impl DependencyRef {
    /// Parses a dependency declaration.
    pub fn parse(declaration: &str) -> Self {
        let looks_like_coordinate = declaration.split(':').count() == 3
            && !declaration.contains(['/', '\\', '*'])
            && declaration.split(':').all(|part| !part.is_empty());
        if looks_like_coordinate {
            Self::Artifact(declaration.to_owned())
        } else {
            Self::Path(PathBuf::from(declaration))
        }
    }
}

impl fmt::Display for DependencyRef {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Artifact(coordinate) => formatter.write_str(coordinate),
            Self::Path(path) => write!(formatter, "{}", path.display()),
        }
    }
}

/// A source group with its roots checked against the filesystem.
///
/// Immutable once produced by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceGroup {
    /// Group identifier
    pub name: String,
    /// Existing source root directories
    pub source_roots: Vec<PathBuf>,
    /// Existing resource root directories
    pub resource_roots: Vec<PathBuf>,
    /// Groups whose compiled output this group consumes, in declaration order
    pub depends_on: Vec<String>,
    /// External dependencies in declaration order
    pub dependencies: Vec<DependencyRef>,
    /// Directory receiving compiled output
    pub output_dir: PathBuf,
}

/// Ordered sequence of classpath entries without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedClasspath {
    entries: Vec<PathBuf>,
}

impl ResolvedClasspath {
    /// Empty classpath.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry unless it is already present; first occurrence wins.
    pub fn push(&mut self, entry: impl Into<PathBuf>) {
        let entry = entry.into();
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    /// Appends every entry of `other` in order.
    pub fn extend<I, P>(&mut self, entries: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for entry in entries {
            self.push(entry);
        }
    }

    /// Entries in classpath order.
    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the classpath has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `path` is on the classpath.
    pub fn contains(&self, path: &Path) -> bool {
        self.entries.iter().any(|entry| entry == path)
    }

    /// Platform classpath string (`:` on unix, `;` on windows).
    pub fn to_classpath_string(&self) -> String {
        let separator = if cfg!(windows) { ";" } else { ":" };
        self.entries
            .iter()
            .map(|entry| entry.display().to_string())
            .collect::<Vec<_>>()
            .join(separator)
    }

    /// Verifies the no-duplicates invariant.
    pub fn is_distinct(&self) -> bool {
        let mut seen = HashSet::new();
        self.entries.iter().all(|entry| seen.insert(entry))
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for ResolvedClasspath {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        let mut classpath = Self::new();
        classpath.extend(iter);
        classpath
    }
}
