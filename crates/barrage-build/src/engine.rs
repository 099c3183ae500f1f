//! Shared engine classpath, resolved once per build.

use std::path::Path;

use barrage_core::{
    BuildConfig, Fingerprint, FingerprintAlgorithm, Fingerprinter,
    ResolvedClasspath, Result,
};
use tracing::debug;

use crate::classpath::{expand_path_pattern, in_context};

/// Expands the configured engine classpath entries.
///
/// # Errors
/// Returns a resolution error if an entry matches nothing.
pub fn resolve_engine_classpath(config: &BuildConfig) -> Result<ResolvedClasspath> {
    let mut classpath = ResolvedClasspath::new();
    for entry in &config.engine.classpath {
        let matches = expand_path_pattern(&config.project.root, Path::new(entry))
            .map_err(|error| in_context(error, &format!("engine classpath entry '{entry}'")))?;
        classpath.extend(matches);
    }
    debug!(entries = classpath.len(), "Resolved engine classpath");
    Ok(classpath)
}

/// Fingerprint of the engine configuration and the artifacts it expands to.
///
/// # Errors
/// Returns an error if an entry cannot be resolved or its metadata read.
pub fn engine_fingerprint(
    config: &BuildConfig,
    algorithm: FingerprintAlgorithm,
) -> Result<Fingerprint> {
    let classpath = resolve_engine_classpath(config)?;
    let mut fingerprinter = Fingerprinter::new(algorithm);
    fingerprinter
        .str("java", &config.engine.java.to_string_lossy())
        .str("main-class", &config.engine.main_class);
    for entry in classpath.entries() {
        fingerprinter.artifact_identity(entry)?;
    }
    Ok(fingerprinter.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use barrage_core::BuildError;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_engine_globs_expand_sorted() {
        let dir = TempDir::new().expect("create temp dir");
        fs::create_dir_all(dir.path().join("engine")).expect("create engine dir");
        fs::write(dir.path().join("engine/gatling-core.jar"), "core").expect("write");
        fs::write(dir.path().join("engine/gatling-app.jar"), "app").expect("write");

        let mut config = BuildConfig::default();
        config.project.root = dir.path().to_path_buf();
        config.engine.classpath = vec!["engine/*.jar".to_owned()];

        let classpath = resolve_engine_classpath(&config).expect("resolve");
        assert_eq!(
            classpath.entries(),
            &[
                dir.path().join("engine/gatling-app.jar"),
                dir.path().join("engine/gatling-core.jar"),
            ]
        );

        let before = engine_fingerprint(&config, FingerprintAlgorithm::Sha256).expect("fingerprint");
        assert_eq!(
            before,
            engine_fingerprint(&config, FingerprintAlgorithm::Sha256).expect("fingerprint")
        );
        fs::write(dir.path().join("engine/gatling-http.jar"), "http").expect("write");
        assert_ne!(
            before,
            engine_fingerprint(&config, FingerprintAlgorithm::Sha256).expect("fingerprint")
        );
    }

    #[test]
    fn test_missing_engine_entry_fails() {
        let dir = TempDir::new().expect("create temp dir");
        let mut config = BuildConfig::default();
        config.project.root = dir.path().to_path_buf();
        config.engine.classpath = vec!["engine/missing.jar".to_owned()];

        let error = resolve_engine_classpath(&config).expect_err("must fail");
        assert!(matches!(error, BuildError::Resolution(_)));
    }
}
