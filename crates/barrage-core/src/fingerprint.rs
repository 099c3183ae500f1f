//! Content fingerprints for up-to-date checks.
//!
//! A fingerprint is a digest over a stream of labelled, length-prefixed fields.
//! Length prefixes keep `("ab", "c")` and `("a", "bc")` from colliding.

use core::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use walkdir::WalkDir;

/// Digest used for fingerprints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintAlgorithm {
    /// SHA-256
    #[default]
    Sha256,
    /// SHA-512
    Sha512,
}

/// Hex-encoded digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hex digest text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(bytes),
            Self::Sha512(hasher) => hasher.update(bytes),
        }
    }
}

/// Incremental fingerprint builder.
pub struct Fingerprinter {
    hasher: Hasher,
}

impl Fingerprinter {
    /// Starts a fingerprint with the given algorithm.
    pub fn new(algorithm: FingerprintAlgorithm) -> Self {
        let hasher = match algorithm {
            FingerprintAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            FingerprintAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        Self { hasher }
    }

    fn write_len_prefixed(&mut self, bytes: &[u8]) {
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    /// Adds a labelled byte field.
    pub fn bytes(&mut self, label: &str, value: &[u8]) -> &mut Self {
        self.write_len_prefixed(label.as_bytes());
        self.write_len_prefixed(value);
        self
    }

    /// Adds a labelled string field.
    pub fn str(&mut self, label: &str, value: &str) -> &mut Self {
        self.bytes(label, value.as_bytes())
    }

    /// Adds another fingerprint, e.g. an upstream node's output.
    pub fn fingerprint(&mut self, label: &str, value: &Fingerprint) -> &mut Self {
        self.str(label, value.as_str())
    }

    /// Adds a file's path relative to `root` and its full contents.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn file_contents(&mut self, root: &Path, file: &Path) -> io::Result<&mut Self> {
        let relative = file.strip_prefix(root).unwrap_or(file);
        let contents = fs::read(file)?;
        self.str("file", &relative.to_string_lossy());
        self.bytes("contents", &contents);
        Ok(self)
    }

    /// Adds every file under `dir` in sorted order, or an absence marker.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be walked or a file cannot be read.
    pub fn directory_contents(&mut self, label: &str, dir: &Path) -> io::Result<&mut Self> {
        self.str("directory", label);
        if !dir.exists() {
            self.str("absent", &dir.to_string_lossy());
            return Ok(self);
        }
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if entry.file_type().is_file() {
                self.file_contents(dir, entry.path())?;
            }
        }
        Ok(self)
    }

    /// Adds a path together with its size and modification time.
    ///
    /// Used for prebuilt artifacts where hashing full contents every build is
    /// wasteful. Directories are hashed by content instead.
    ///
    /// # Errors
    /// Returns an error if the path's metadata cannot be read.
    pub fn artifact_identity(&mut self, path: &Path) -> io::Result<&mut Self> {
        let metadata = fs::metadata(path)?;
        if metadata.is_dir() {
            return self.directory_contents(&path.to_string_lossy(), path);
        }
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |elapsed| elapsed.as_nanos());
        self.str("artifact", &path.to_string_lossy());
        self.bytes("size", &metadata.len().to_le_bytes());
        self.bytes("modified", &modified.to_le_bytes());
        Ok(self)
    }

    /// Finishes the digest.
    pub fn finish(self) -> Fingerprint {
        let digest = match self.hasher {
            Hasher::Sha256(hasher) => hex::encode(hasher.finalize()),
            Hasher::Sha512(hasher) => hex::encode(hasher.finalize()),
        };
        Fingerprint(digest)
    }
}
