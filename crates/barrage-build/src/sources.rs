//! Source file enumeration.

use std::path::{Path, PathBuf};

use barrage_core::{BuildError, Result, SourceGroup};
use walkdir::WalkDir;

/// A source file together with the root it was found under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Source root containing the file
    pub root: PathBuf,
    /// Absolute file path
    pub path: PathBuf,
}

impl SourceFile {
    /// Path relative to its source root.
    pub fn relative(&self) -> &Path {
        self.path.strip_prefix(&self.root).unwrap_or(&self.path)
    }
}

/// Every file under the group's source roots with one of `extensions`.
///
/// Roots are visited in declaration order and files sorted by name within a
/// root, so the result is stable across invocations.
///
/// # Errors
/// Returns an error if a source root cannot be walked.
pub fn collect_sources(group: &SourceGroup, extensions: &[String]) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    for root in &group.source_roots {
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|error| BuildError::Io(error.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let matches = entry
                .path()
                .extension()
                .and_then(|extension| extension.to_str())
                .is_some_and(|extension| extensions.iter().any(|wanted| wanted == extension));
            if matches {
                files.push(SourceFile {
                    root: root.clone(),
                    path: entry.into_path(),
                });
            }
        }
    }
    Ok(files)
}
