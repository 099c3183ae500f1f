//! Compilation stage.
//!
//! The [`Compiler`] trait is the seam between the build and the external
//! compiler toolchain. [`ProcessCompiler`] drives any `javac`-compatible
//! program (`javac`, `kotlinc`, `scalac` all accept `-d` and `-cp`).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use barrage_core::{
    BuildError, Fingerprint, FingerprintAlgorithm, Fingerprinter, ResolvedClasspath, Result,
};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use crate::sources::SourceFile;

/// Everything needed to compile one source group.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Source group being compiled
    pub group: String,
    /// Files to compile, in stable order
    pub sources: Vec<SourceFile>,
    /// Compile classpath
    pub classpath: ResolvedClasspath,
    /// Directory receiving compiled output
    pub output_dir: PathBuf,
    /// Extra compiler flags
    pub options: Vec<String>,
    /// Working directory for the compiler process
    pub working_dir: PathBuf,
}

/// Outcome of a successful compilation.
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    /// Warnings or other output printed by the compiler
    pub diagnostics: String,
    /// Number of source files compiled
    pub compiled: usize,
    /// Wall-clock time spent
    pub duration: Duration,
}

/// Compiles a source group into its output directory.
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Compile `request.sources` into `request.output_dir`.
    ///
    /// # Errors
    /// Returns [`BuildError::Compilation`] with the compiler's diagnostics when
    /// the sources do not compile.
    async fn compile(&self, request: &CompileRequest) -> Result<CompileOutput>;

    /// Identifies the toolchain in fingerprints.
    fn identity(&self) -> String;
}

/// Runs an external compiler process.
#[derive(Debug, Clone)]
pub struct ProcessCompiler {
    program: PathBuf,
}

impl ProcessCompiler {
    /// Compiler invoking `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ProcessCompiler {
    fn default() -> Self {
        Self::new("javac")
    }
}

#[async_trait]
impl Compiler for ProcessCompiler {
    async fn compile(&self, request: &CompileRequest) -> Result<CompileOutput> {
        let start = Instant::now();

        // Stale classes from deleted sources must not survive a rebuild.
        if fs::try_exists(&request.output_dir).await? {
            fs::remove_dir_all(&request.output_dir).await?;
        }
        fs::create_dir_all(&request.output_dir).await?;

        if request.sources.is_empty() {
            debug!(group = %request.group, "No sources to compile");
            return Ok(CompileOutput::default());
        }

        let mut command = Command::new(&self.program);
        command
            .args(&request.options)
            .arg("-d")
            .arg(&request.output_dir);
        if !request.classpath.is_empty() {
            command
                .arg("-cp")
                .arg(request.classpath.to_classpath_string());
        }
        command
            .args(request.sources.iter().map(|source| &source.path))
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(
            group = %request.group,
            "Running {} on {} source files",
            self.program.display(),
            request.sources.len()
        );

        let output = command.output().await.map_err(|error| BuildError::Compilation {
            group: request.group.clone(),
            diagnostics: format!("failed to start {}: {error}", self.program.display()),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let diagnostics = if stderr.is_empty() {
            stdout.into_owned()
        } else if stdout.is_empty() {
            stderr.into_owned()
        } else {
            format!("{stderr}\n{stdout}")
        };

        if !output.status.success() {
            return Err(BuildError::Compilation {
                group: request.group.clone(),
                diagnostics,
            });
        }

        let duration = start.elapsed();
        info!(
            group = %request.group,
            "Compiled {} source files in {duration:?}",
            request.sources.len()
        );
        Ok(CompileOutput {
            diagnostics,
            compiled: request.sources.len(),
            duration,
        })
    }

    fn identity(&self) -> String {
        self.program.display().to_string()
    }
}

/// Fingerprint over source contents, classpath identity and compiler options.
///
/// # Errors
/// Returns an error if a source file or classpath entry cannot be read.
pub fn compile_fingerprint(
    algorithm: FingerprintAlgorithm,
    compiler: &dyn Compiler,
    request: &CompileRequest,
) -> Result<Fingerprint> {
    let mut fingerprinter = Fingerprinter::new(algorithm);
    fingerprinter
        .str("group", &request.group)
        .str("compiler", &compiler.identity());
    for option in &request.options {
        fingerprinter.str("option", option);
    }
    for source in &request.sources {
        fingerprinter.file_contents(&source.root, &source.path)?;
    }
    for entry in request.classpath.entries() {
        if entry.exists() {
            fingerprinter.artifact_identity(entry)?;
        } else {
            fingerprinter.str("missing", &entry.to_string_lossy());
        }
    }
    fingerprinter.str("output", &request.output_dir.to_string_lossy());
    Ok(fingerprinter.finish())
}

/// Fingerprint of a compiled output directory.
///
/// # Errors
/// Returns an error if the directory cannot be read.
pub fn output_fingerprint(algorithm: FingerprintAlgorithm, output_dir: &Path) -> Result<Fingerprint> {
    let mut fingerprinter = Fingerprinter::new(algorithm);
    fingerprinter.directory_contents("output", output_dir)?;
    Ok(fingerprinter.finish())
}
