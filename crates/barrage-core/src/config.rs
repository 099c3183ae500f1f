//! Project configuration loaded from `barrage.toml`.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{BuildError, Result};
use crate::fingerprint::FingerprintAlgorithm;

/// Name of the project configuration file.
pub const CONFIG_FILE_NAME: &str = "barrage.toml";
/// Source group used when the configuration declares none.
pub const DEFAULT_GROUP_NAME: &str = "gatling";
/// Environment variable holding the enterprise API token by default.
pub const DEFAULT_CREDENTIALS_ENV: &str = "GATLING_ENTERPRISE_API_TOKEN";
/// Language directories checked under `src/<group>/` when no roots are declared.
pub const CONVENTION_LANGUAGES: [&str; 3] = ["java", "kotlin", "scala"];

/// Complete build configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Process-level flags for simulation runs
    pub jvm_options: Vec<String>,
    /// Glob over fully-qualified simulation names restricting what runs
    pub simulation_filter: Option<String>,
    /// Globs over fully-qualified simulation names excluded from runs
    pub simulation_excludes: Vec<String>,
    /// System properties passed to every simulation run
    pub system_properties: BTreeMap<String, String>,
    /// Project location and output layout
    pub project: ProjectConfig,
    /// Logical simulation source groups
    pub source_groups: Vec<SourceGroupConfig>,
    /// Load-testing engine settings
    pub engine: EngineConfig,
    /// Compiler invocation
    pub compiler: CompilerConfig,
    /// Already-resolved artifact metadata keyed by `group:name:version`
    pub artifacts: BTreeMap<String, ArtifactMetadata>,
    /// Scheduling settings
    pub execution: ExecutionConfig,
    /// Up-to-date check settings
    pub fingerprint: FingerprintConfig,
    /// Remote execution service, when submissions are enabled
    pub enterprise: Option<EnterpriseConfig>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            jvm_options: default_jvm_options(),
            simulation_filter: None,
            simulation_excludes: Vec::new(),
            system_properties: BTreeMap::new(),
            project: ProjectConfig::default(),
            source_groups: vec![SourceGroupConfig::named(DEFAULT_GROUP_NAME)],
            engine: EngineConfig::default(),
            compiler: CompilerConfig::default(),
            artifacts: BTreeMap::new(),
            execution: ExecutionConfig::default(),
            fingerprint: FingerprintConfig::default(),
            enterprise: None,
        }
    }
}

fn default_jvm_options() -> Vec<String> {
    [
        "-server",
        "-Xms512M",
        "-Xmx1G",
        "-XX:+HeapDumpOnOutOfMemoryError",
        "-XX:+UseG1GC",
        "-XX:+ParallelRefProcEnabled",
        "-XX:MaxInlineLevel=20",
        "-XX:MaxTrivialSize=12",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

/// Project location and output layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project root; relative paths elsewhere are resolved against it
    pub root: PathBuf,
    /// Build output directory, relative to the root
    pub build_dir: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            build_dir: PathBuf::from("build/barrage"),
        }
    }
}

/// One logical group of simulation sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceGroupConfig {
    /// Group identifier (`[A-Za-z0-9_-]+`)
    pub name: String,
    /// Source roots; `None` means the `src/<name>/<language>` convention
    pub source_roots: Option<Vec<PathBuf>>,
    /// Resource roots; `None` means `src/<name>/resources`
    pub resource_roots: Option<Vec<PathBuf>>,
    /// Groups whose compiled output this group builds against
    pub depends_on: Vec<String>,
    /// External dependencies: coordinates, paths or glob patterns
    pub dependencies: Vec<String>,
    /// Whether missing declared roots are a configuration error
    pub required: bool,
}

impl Default for SourceGroupConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            source_roots: None,
            resource_roots: None,
            depends_on: Vec::new(),
            dependencies: Vec::new(),
            required: true,
        }
    }
}

impl SourceGroupConfig {
    /// Group with conventional roots and no dependencies.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a dependency on another group.
    #[must_use]
    pub fn depends_on(mut self, group: impl Into<String>) -> Self {
        self.depends_on.push(group.into());
        self
    }

    /// Declares explicit source roots.
    #[must_use]
    pub fn with_source_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.source_roots = Some(roots);
        self
    }

    /// Declares explicit resource roots.
    #[must_use]
    pub fn with_resource_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.resource_roots = Some(roots);
        self
    }

    /// Adds an external dependency declaration.
    #[must_use]
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}

/// Load-testing engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine jars or directories; glob patterns allowed
    pub classpath: Vec<String>,
    /// Program used to start simulations
    pub java: PathBuf,
    /// Engine entry point
    pub main_class: String,
    /// Exit code the engine uses when assertions fail
    pub assertion_failure_exit_code: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            classpath: Vec::new(),
            java: PathBuf::from("java"),
            main_class: "io.gatling.app.Gatling".to_owned(),
            assertion_failure_exit_code: 2,
        }
    }
}

/// Compiler invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Compiler program
    pub program: PathBuf,
    /// Extra options placed before the output and classpath flags
    pub options: Vec<String>,
    /// File extensions treated as sources
    pub extensions: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("javac"),
            options: Vec::new(),
            extensions: vec!["java".to_owned(), "kt".to_owned(), "scala".to_owned()],
        }
    }
}

/// Already-resolved metadata for one artifact coordinate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactMetadata {
    /// Location of the artifact, relative to the project root
    pub path: PathBuf,
    /// Direct dependencies, as coordinates
    pub dependencies: Vec<String>,
}

/// Scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Size of the worker pool
    pub max_workers: usize,
    /// Wall-clock limit for each simulation process
    pub run_timeout_secs: Option<u64>,
    /// Cancel the whole build on the first failure instead of finishing independent branches
    pub abort_on_failure: bool,
    /// Capacity of the bounded channel forwarding child output
    pub output_buffer: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_workers: default_worker_count(),
            run_timeout_secs: None,
            abort_on_failure: false,
            output_buffer: 256,
        }
    }
}

impl ExecutionConfig {
    /// Per-run timeout, if configured.
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

/// Half the available processing units, minimum 1.
pub fn default_worker_count() -> usize {
    (num_cpus::get() / 2).max(1)
}

/// Up-to-date check settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Digest algorithm
    pub algorithm: FingerprintAlgorithm,
}

/// Remote execution service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnterpriseConfig {
    /// Base URL of the service
    pub endpoint: String,
    /// Environment variable holding the API token
    pub credentials_ref: String,
    /// Package the compiled artifacts are uploaded to
    pub package_id: String,
    /// Remote simulation started after the upload, if any
    pub simulation_id: Option<String>,
    /// Poll the started run until it reaches a terminal state
    pub wait_for_completion: bool,
    /// Delay between status polls
    pub poll_interval_secs: u64,
    /// Wall-clock limit for the whole submission
    pub timeout_secs: Option<u64>,
    /// Retries after the first attempt for network failures
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff_ms: u64,
    /// Growth factor between retries
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay
    pub max_backoff_ms: u64,
}

impl Default for EnterpriseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            credentials_ref: DEFAULT_CREDENTIALS_ENV.to_owned(),
            package_id: String::new(),
            simulation_id: None,
            wait_for_completion: false,
            poll_interval_secs: 5,
            timeout_secs: None,
            max_retries: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl EnterpriseConfig {
    /// Retry schedule for transient failures.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    /// Wall-clock limit, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Reads the API token from the configured environment variable.
    ///
    /// # Errors
    /// Returns a configuration error if the variable is unset or empty.
    pub fn credentials(&self) -> Result<String> {
        match env::var(&self.credentials_ref) {
            Ok(token) if !token.trim().is_empty() => Ok(token),
            _ => Err(BuildError::Configuration(format!(
                "enterprise credentials not found in environment variable {}",
                self.credentials_ref
            ))),
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Growth factor between retries
    pub multiplier: f64,
    /// Upper bound for a single delay
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl BuildConfig {
    /// Loads and validates a configuration file.
    ///
    /// A relative `project.root` is resolved against the file's directory.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|error| {
            BuildError::Configuration(format!("Failed to read {}: {error}", path.display()))
        })?;
        let mut config: Self = toml::from_str(&contents)?;

        if config.project.root.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.project.root = base.join(&config.project.root);
        }

        debug!(
            "Loaded config from {}: {} source group(s), enterprise={}",
            path.display(),
            config.source_groups.len(),
            if config.enterprise.is_some() {
                "configured"
            } else {
                "disabled"
            }
        );

        config.validate()?;
        Ok(config)
    }

    /// Loads `barrage.toml` from `dir`, or the defaults rooted at `dir` when absent.
    ///
    /// # Errors
    /// Returns an error if an existing file cannot be loaded.
    pub fn discover(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            return Self::load_from_file(&path);
        }
        debug!("No {CONFIG_FILE_NAME} in {}, using defaults", dir.display());
        let mut config = Self::default();
        config.project.root = dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as TOML.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let contents = toml::to_string_pretty(self).map_err(|error| {
            BuildError::Configuration(format!("Failed to serialize config: {error}"))
        })?;
        let header = "# Barrage build configuration\n\
                      # Source groups, engine and execution settings for simulation builds\n\n";
        // Readers never observe a half-written file.
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(header.as_bytes())?;
        temp.write_all(contents.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|error| error.error)?;
        Ok(())
    }

    /// Absolute build output directory.
    pub fn build_dir(&self) -> PathBuf {
        self.project.root.join(&self.project.build_dir)
    }

    /// Resolves `path` against the project root.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project.root.join(path)
        }
    }

    /// Checks everything that can be checked without touching the filesystem.
    ///
    /// Dependency cycles are detected by the source set resolver.
    ///
    /// # Errors
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.source_groups.is_empty() {
            return Err(BuildError::Configuration(
                "at least one source group is required".to_owned(),
            ));
        }

        let mut names = HashSet::new();
        for group in &self.source_groups {
            if !is_valid_group_name(&group.name) {
                return Err(BuildError::Configuration(format!(
                    "invalid source group name '{}': use letters, digits, '-' or '_'",
                    group.name
                )));
            }
            if !names.insert(group.name.as_str()) {
                return Err(BuildError::Configuration(format!(
                    "duplicate source group '{}'",
                    group.name
                )));
            }
        }

        for group in &self.source_groups {
            for dependency in &group.depends_on {
                if !names.contains(dependency.as_str()) {
                    return Err(BuildError::Configuration(format!(
                        "source group '{}' depends on unknown group '{dependency}'",
                        group.name
                    )));
                }
            }
        }

        if self.execution.max_workers == 0 {
            return Err(BuildError::Configuration(
                "execution.max_workers must be at least 1".to_owned(),
            ));
        }
        if self.execution.output_buffer == 0 {
            return Err(BuildError::Configuration(
                "execution.output_buffer must be at least 1".to_owned(),
            ));
        }

        for pattern in self.simulation_filter.iter().chain(&self.simulation_excludes) {
            Pattern::new(pattern).map_err(|error| {
                BuildError::Configuration(format!("invalid simulation pattern '{pattern}': {error}"))
            })?;
        }

        if let Some(enterprise) = &self.enterprise {
            if enterprise.endpoint.trim().is_empty() {
                return Err(BuildError::Configuration(
                    "enterprise.endpoint must be set".to_owned(),
                ));
            }
            if enterprise.package_id.trim().is_empty() {
                return Err(BuildError::Configuration(
                    "enterprise.package_id must be set".to_owned(),
                ));
            }
        }

        Ok(())
    }

    /// Configured group by name.
    pub fn group(&self, name: &str) -> Option<&SourceGroupConfig> {
        self.source_groups.iter().find(|group| group.name == name)
    }
}

fn is_valid_group_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || matches!(character, '-' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = BuildConfig::default();
        assert_eq!(config.source_groups.len(), 1);
        assert_eq!(config.source_groups[0].name, DEFAULT_GROUP_NAME);
        assert!(config.jvm_options.contains(&"-Xmx1G".to_owned()));
        assert!(config.execution.max_workers >= 1);
        config.validate().expect("default config is valid");
    }

    #[test]
    fn test_load_from_toml() {
        let toml_content = r#"
jvm_options = ["-Xmx2G"]
simulation_filter = "computerdatabase.*"

[system_properties]
vu = "10"

[project]
build_dir = "out"

[[source_groups]]
name = "web"
source_roots = ["sims/web"]

[[source_groups]]
name = "web-extra"
depends_on = ["web"]
dependencies = ["org.apache.commons:commons-lang3:3.12.0", "lib/*.jar"]

[engine]
classpath = ["engine/*.jar"]

[artifacts."org.apache.commons:commons-lang3:3.12.0"]
path = "repo/commons-lang3-3.12.0.jar"

[execution]
max_workers = 3
run_timeout_secs = 600

[enterprise]
endpoint = "https://cloud.example.com"
package_id = "pkg-1"
max_retries = 5
"#;
        let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
        temp_file
            .write_all(toml_content.as_bytes())
            .expect("Failed to write to temp file");

        let config = BuildConfig::load_from_file(temp_file.path()).expect("load config");
        assert_eq!(config.jvm_options, vec!["-Xmx2G".to_owned()]);
        assert_eq!(config.system_properties.get("vu"), Some(&"10".to_owned()));
        assert_eq!(config.source_groups.len(), 2);
        assert_eq!(config.source_groups[1].depends_on, vec!["web".to_owned()]);
        assert!(config.source_groups[1].required);
        assert!(config.source_groups[1].source_roots.is_none());
        assert_eq!(config.execution.max_workers, 3);
        assert_eq!(config.execution.run_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.engine.main_class, "io.gatling.app.Gatling");

        let enterprise = config.enterprise.expect("enterprise section");
        assert_eq!(enterprise.max_retries, 5);
        assert_eq!(enterprise.credentials_ref, DEFAULT_CREDENTIALS_ENV);
        assert!(config.project.root.is_absolute());
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let mut config = BuildConfig::default();
        config.source_groups = vec![SourceGroupConfig::named("web").depends_on("missing")];
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("unknown group 'missing'"));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bad_names() {
        let mut config = BuildConfig::default();
        config.source_groups = vec![SourceGroupConfig::named("web"), SourceGroupConfig::named("web")];
        assert!(matches!(config.validate(), Err(BuildError::Configuration(_))));

        config.source_groups = vec![SourceGroupConfig::named("we b")];
        assert!(matches!(config.validate(), Err(BuildError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let mut config = BuildConfig::default();
        config.simulation_filter = Some("[unclosed".to_owned());
        assert!(matches!(config.validate(), Err(BuildError::Configuration(_))));
    }

    #[test]
    fn test_discover_without_file_uses_defaults() {
        let dir = TempDir::new().expect("create temp dir");
        let config = BuildConfig::discover(dir.path()).expect("discover");
        assert_eq!(config.project.root, dir.path());
        assert_eq!(config.build_dir(), dir.path().join("build/barrage"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = BuildConfig::default();
        config.source_groups = vec![
            SourceGroupConfig::named("web"),
            SourceGroupConfig::named("web-extra").depends_on("web"),
        ];
        config.save_to_file(&path).expect("save");

        let reloaded = BuildConfig::discover(dir.path()).expect("reload");
        assert_eq!(reloaded.source_groups.len(), 2);
        assert_eq!(reloaded.source_groups[1].depends_on, vec!["web".to_owned()]);
    }

    #[test]
    fn test_save_replaces_existing_file_in_place() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let mut config = BuildConfig::default();
        config.source_groups = vec![SourceGroupConfig::named("load-alpha")];
        config.save_to_file(&path).expect("first save");

        config.source_groups = vec![SourceGroupConfig::named("load-beta")];
        config.save_to_file(&path).expect("second save");

        let written = fs::read_to_string(&path).expect("read config");
        assert!(written.starts_with("# Barrage build configuration"));
        assert!(written.contains("load-beta"));
        assert!(!written.contains("load-alpha"));
        let files: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("list dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(files, vec![CONFIG_FILE_NAME]);
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = EnterpriseConfig::default().retry_policy();
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(20), Duration::from_secs(30));
    }
}
