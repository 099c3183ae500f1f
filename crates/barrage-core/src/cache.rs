//! Durable fingerprint cache.
//!
//! One JSON file per task under the cache directory. Each node only ever
//! writes its own entry, and writes go through a temp file in the same
//! directory followed by a rename, so no further locking is needed.

use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::task::TaskId;

/// Fingerprints recorded after a task's last successful execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint of the task's declared inputs
    pub input: Fingerprint,
    /// Fingerprint of what the task produced, consumed by downstream checks
    pub output: Fingerprint,
    /// When the entry was written
    pub recorded_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Entry stamped with the current time.
    pub fn new(input: Fingerprint, output: Fingerprint) -> Self {
        Self {
            input,
            output,
            recorded_at: Utc::now(),
        }
    }
}

/// Key to fingerprint store on durable storage.
#[derive(Debug, Clone)]
pub struct FingerprintCache {
    dir: PathBuf,
}

impl FingerprintCache {
    /// Opens (and creates if needed) a cache rooted at `dir`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, task: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", task.cache_key()))
    }

    /// Reads the entry for `task`.
    ///
    /// Unreadable or corrupt entries are treated as absent so the task simply
    /// re-executes.
    ///
    /// # Errors
    /// Returns an error only for I/O failures other than a missing file.
    pub fn get(&self, task: &TaskId) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(task);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        match serde_json::from_str(&contents) {
            Ok(entry) => Ok(Some(entry)),
            Err(error) => {
                warn!(task = %task, "Ignoring corrupt fingerprint entry {}: {error}", path.display());
                Ok(None)
            }
        }
    }

    /// Atomically replaces the entry for `task`.
    ///
    /// # Errors
    /// Returns an error if the entry cannot be serialized or written.
    pub fn put(&self, task: &TaskId, entry: &CacheEntry) -> Result<()> {
        let json = serde_json::to_string_pretty(entry)?;
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(self.entry_path(task))
            .map_err(|error| error.error)?;
        Ok(())
    }

    /// Drops the entry for `task`, forcing re-execution next time.
    ///
    /// # Errors
    /// Returns an error if the entry exists but cannot be removed.
    pub fn invalidate(&self, task: &TaskId) -> Result<()> {
        match fs::remove_file(self.entry_path(task)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{FingerprintAlgorithm, Fingerprinter};
    use crate::task::TaskKind;
    use tempfile::TempDir;

    fn fingerprint(value: &str) -> Fingerprint {
        let mut fingerprinter = Fingerprinter::new(FingerprintAlgorithm::Sha256);
        fingerprinter.str("value", value);
        fingerprinter.finish()
    }

    #[test]
    fn test_round_trip_across_reopen() {
        let dir = TempDir::new().expect("create temp dir");
        let task = TaskId::new("web", TaskKind::Compile);
        let entry = CacheEntry::new(fingerprint("in"), fingerprint("out"));

        FingerprintCache::open(dir.path())
            .expect("open cache")
            .put(&task, &entry)
            .expect("put");

        let reopened = FingerprintCache::open(dir.path()).expect("reopen cache");
        assert_eq!(reopened.get(&task).expect("get"), Some(entry));
        assert_eq!(
            reopened
                .get(&TaskId::new("web-extra", TaskKind::Compile))
                .expect("get"),
            None
        );
    }

    #[test]
    fn test_put_replaces_entry() {
        let dir = TempDir::new().expect("create temp dir");
        let cache = FingerprintCache::open(dir.path()).expect("open cache");
        let task = TaskId::shared(TaskKind::ResolveEngine);

        cache
            .put(&task, &CacheEntry::new(fingerprint("a"), fingerprint("a")))
            .expect("first put");
        cache
            .put(&task, &CacheEntry::new(fingerprint("b"), fingerprint("b")))
            .expect("second put");

        let entry = cache.get(&task).expect("get").expect("entry present");
        assert_eq!(entry.input, fingerprint("b"));
        let files = fs::read_dir(dir.path()).expect("read dir").count();
        assert_eq!(files, 1, "temp files must not be left behind");
    }

    #[test]
    fn test_corrupt_entry_reads_as_absent() {
        let dir = TempDir::new().expect("create temp dir");
        let cache = FingerprintCache::open(dir.path()).expect("open cache");
        let task = TaskId::new("web", TaskKind::AssembleClasspath);
        fs::write(dir.path().join("web.assemble-classpath.json"), "{not json").expect("write");

        assert_eq!(cache.get(&task).expect("get"), None);
        cache.invalidate(&task).expect("invalidate");
        cache.invalidate(&task).expect("invalidate twice");
    }
}
