//! Simulation discovery.
//!
//! Launchable simulations are top-level classes extending the engine's
//! `Simulation` base. Sources are scanned once per compile fingerprint and
//! the result cached under `<build_dir>/discovery/<group>.json`.

use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use barrage_core::{BuildConfig, BuildError, Fingerprint, Result};
use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::sources::SourceFile;

static PACKAGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| match Regex::new(r"(?m)^\s*package\s+([A-Za-z_][\w.]*)") {
        Ok(regex) => regex,
        Err(err) => panic!("Package regex is invalid: {err}"),
    });

static CLASS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(
        r"(?m)^[ \t]*((?:(?:public|private|protected|internal|final|open|abstract|sealed|static)\s+)*)class\s+([A-Za-z_][A-Za-z0-9_]*)",
    ) {
        Ok(regex) => regex,
        Err(err) => panic!("Class regex is invalid: {err}"),
    }
});

static SUPERTYPE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| match Regex::new(r"\bextends\s+Simulation\b|:\s*Simulation\s*\(") {
        Ok(regex) => regex,
        Err(err) => panic!("Supertype regex is invalid: {err}"),
    });

/// Fully-qualified names of the launchable simulations declared in `contents`.
///
/// Java classes must be `public`; abstract, private, internal and nested
/// (`static`) classes are never launchable.
pub fn scan_source(contents: &str, java: bool) -> Vec<String> {
    let package = PACKAGE_REGEX
        .captures(contents)
        .and_then(|captures| captures.get(1))
        .map(|package| package.as_str().trim_end_matches('.'));

    let declarations: Vec<_> = CLASS_REGEX.captures_iter(contents).collect();
    declarations
        .iter()
        .enumerate()
        .filter_map(|(index, captures)| {
            // The header may span lines; it ends at the body or the next declaration.
            let start = captures.get(0)?.end();
            let end = declarations
                .get(index + 1)
                .and_then(|next| next.get(0))
                .map_or(contents.len(), |next| next.start());
            let header = &contents[start..end];
            let header = header.find('{').map_or(header, |body| &header[..body]);
            if !SUPERTYPE_REGEX.is_match(header) {
                return None;
            }
            let modifiers: Vec<&str> = captures
                .get(1)
                .map_or("", |modifiers| modifiers.as_str())
                .split_whitespace()
                .collect();
            let excluded = modifiers.iter().any(|modifier| {
                matches!(
                    *modifier,
                    "private" | "protected" | "internal" | "abstract" | "sealed" | "static"
                )
            });
            if excluded || (java && !modifiers.contains(&"public")) {
                return None;
            }
            let name = captures.get(2)?.as_str();
            Some(package.map_or_else(|| name.to_owned(), |package| format!("{package}.{name}")))
        })
        .collect()
}

/// Scans `sources` and returns the sorted, de-duplicated simulation names.
///
/// # Errors
/// Returns an error if a source file cannot be read.
pub fn discover_simulations(sources: &[SourceFile]) -> Result<Vec<String>> {
    let mut simulations = Vec::new();
    for source in sources {
        let contents = fs::read_to_string(&source.path)?;
        let java = source
            .path
            .extension()
            .is_some_and(|extension| extension == "java");
        simulations.extend(scan_source(&contents, java));
    }
    simulations.sort();
    simulations.dedup();
    Ok(simulations)
}

/// Include/exclude selection over fully-qualified simulation names.
#[derive(Debug, Clone, Default)]
pub struct SimulationFilter {
    include: Option<Pattern>,
    exclude: Vec<Pattern>,
    only: Option<String>,
}

impl SimulationFilter {
    /// Filter built from `simulation_filter` and `simulation_excludes`.
    ///
    /// # Errors
    /// Returns a configuration error for an invalid glob pattern.
    pub fn from_config(config: &BuildConfig) -> Result<Self> {
        let compile = |pattern: &str| {
            Pattern::new(pattern).map_err(|error| {
                BuildError::Configuration(format!("invalid simulation pattern '{pattern}': {error}"))
            })
        };
        Ok(Self {
            include: config.simulation_filter.as_deref().map(compile).transpose()?,
            exclude: config
                .simulation_excludes
                .iter()
                .map(|pattern| compile(pattern))
                .collect::<Result<_>>()?,
            only: None,
        })
    }

    /// Restricts the selection to one simulation, matched by fully-qualified
    /// or simple name.
    #[must_use]
    pub fn with_only(mut self, simulation: Option<String>) -> Self {
        self.only = simulation;
        self
    }

    /// Whether `simulation` is selected.
    pub fn matches(&self, simulation: &str) -> bool {
        if let Some(only) = &self.only {
            let simple = simulation.rsplit('.').next().unwrap_or(simulation);
            if only != simulation && only != simple {
                return false;
            }
        }
        self.include
            .as_ref()
            .is_none_or(|pattern| pattern.matches(simulation))
            && !self.exclude.iter().any(|pattern| pattern.matches(simulation))
    }

    /// Selected subset of `simulations`, order preserved.
    pub fn apply(&self, simulations: &[String]) -> Vec<String> {
        simulations
            .iter()
            .filter(|simulation| self.matches(simulation))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DiscoveryRecord {
    fingerprint: Fingerprint,
    simulations: Vec<String>,
}

/// Discovered simulations per group, keyed by the compile fingerprint.
#[derive(Debug, Clone)]
pub struct DiscoveryCache {
    dir: PathBuf,
}

impl DiscoveryCache {
    /// Cache stored in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, group: &str) -> PathBuf {
        self.dir.join(format!("{group}.json"))
    }

    /// Cached list for `group` if it was recorded under `fingerprint`.
    ///
    /// # Errors
    /// Returns an error for I/O failures other than a missing record.
    pub fn load(&self, group: &str, fingerprint: &Fingerprint) -> Result<Option<Vec<String>>> {
        let path = self.record_path(group);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        match serde_json::from_str::<DiscoveryRecord>(&contents) {
            Ok(record) if &record.fingerprint == fingerprint => Ok(Some(record.simulations)),
            Ok(_) => Ok(None),
            Err(error) => {
                warn!(group, "Ignoring corrupt discovery record {}: {error}", path.display());
                Ok(None)
            }
        }
    }

    /// Records `simulations` for `group` under `fingerprint`.
    ///
    /// # Errors
    /// Returns an error if the record cannot be written.
    pub fn store(&self, group: &str, fingerprint: &Fingerprint, simulations: &[String]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let record = DiscoveryRecord {
            fingerprint: fingerprint.clone(),
            simulations: simulations.to_vec(),
        };
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(serde_json::to_string_pretty(&record)?.as_bytes())?;
        temp.persist(self.record_path(group))
            .map_err(|error| error.error)?;
        Ok(())
    }

    /// Cached list, or a fresh scan of `sources` recorded for next time.
    ///
    /// # Errors
    /// Returns an error if the sources cannot be read or the record written.
    pub fn discover(
        &self,
        group: &str,
        fingerprint: &Fingerprint,
        sources: &[SourceFile],
    ) -> Result<Vec<String>> {
        if let Some(simulations) = self.load(group, fingerprint)? {
            debug!(group, count = simulations.len(), "Using cached simulation list");
            return Ok(simulations);
        }
        let simulations = discover_simulations(sources)?;
        debug!(group, count = simulations.len(), "Discovered simulations");
        self.store(group, fingerprint, &simulations)?;
        Ok(simulations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barrage_core::{FingerprintAlgorithm, Fingerprinter};
    use tempfile::TempDir;

    const JAVA_SIMULATION: &str = r#"package computerdatabase.advanced;

import io.gatling.javaapi.core.*;

public class AdvancedSimulationStep03 extends Simulation {

  static class Search {
    static final ChainBuilder search = exec(http("Home").get("/"));
  }

  {
    setUp(scn.injectOpen(atOnceUsers(1)));
  }
}
"#;

    const KOTLIN_SIMULATION: &str = r#"package example.advanced

import io.gatling.javaapi.core.*

class BasicSimulation2 : Simulation() {
    private val vu: Int = Integer.getInteger("vu", 1)
}

private class Hidden : Simulation()
abstract class Base : Simulation()
"#;

    fn fingerprint(value: &str) -> Fingerprint {
        let mut fingerprinter = Fingerprinter::new(FingerprintAlgorithm::Sha256);
        fingerprinter.str("value", value);
        fingerprinter.finish()
    }

    #[test]
    fn test_scan_java_ignores_nested_classes() {
        assert_eq!(
            scan_source(JAVA_SIMULATION, true),
            vec!["computerdatabase.advanced.AdvancedSimulationStep03"]
        );
        assert!(scan_source("class Helper extends Simulation {}", true).is_empty());
    }

    #[test]
    fn test_scan_declaration_wrapped_over_lines() {
        let java = "package load;\n\npublic class CheckoutSimulation\n    extends Simulation {\n}\n";
        assert_eq!(scan_source(java, true), vec!["load.CheckoutSimulation"]);

        let kotlin = "package load\n\nclass CartSimulation(\n    private val users: Int = 10,\n) :\n    Simulation() {\n}\n";
        assert_eq!(scan_source(kotlin, false), vec!["load.CartSimulation"]);
    }

    #[test]
    fn test_bodyless_class_does_not_claim_next_declaration() {
        let kotlin = "package load\n\nclass Payload(val id: Int)\n\nclass OrderSimulation : Simulation() {\n}\n";
        assert_eq!(scan_source(kotlin, false), vec!["load.OrderSimulation"]);
    }

    #[test]
    fn test_scan_kotlin() {
        assert_eq!(
            scan_source(KOTLIN_SIMULATION, false),
            vec!["example.advanced.BasicSimulation2"]
        );
        assert_eq!(
            scan_source("class NoPackage extends Simulation {}", false),
            vec!["NoPackage"]
        );
    }

    #[test]
    fn test_filter_include_exclude_and_only() {
        let mut config = BuildConfig::default();
        config.simulation_filter = Some("computerdatabase.*".to_owned());
        config.simulation_excludes = vec!["*Step03".to_owned()];
        let filter = SimulationFilter::from_config(&config).expect("filter");

        let simulations = vec![
            "computerdatabase.BasicSimulation".to_owned(),
            "computerdatabase.advanced.AdvancedSimulationStep03".to_owned(),
            "example.advanced.BasicSimulation2".to_owned(),
        ];
        assert_eq!(
            filter.apply(&simulations),
            vec!["computerdatabase.BasicSimulation"]
        );

        let only = SimulationFilter::default().with_only(Some("BasicSimulation2".to_owned()));
        assert_eq!(
            only.apply(&simulations),
            vec!["example.advanced.BasicSimulation2"]
        );
    }

    #[test]
    fn test_cache_is_keyed_by_fingerprint() {
        let dir = TempDir::new().expect("create temp dir");
        let root = dir.path().join("src");
        fs::create_dir_all(&root).expect("create src");
        let path = root.join("AdvancedSimulationStep03.java");
        fs::write(&path, JAVA_SIMULATION).expect("write");
        let sources = vec![SourceFile { root, path: path.clone() }];

        let cache = DiscoveryCache::new(dir.path().join("discovery"));
        let first = fingerprint("one");
        let found = cache.discover("web", &first, &sources).expect("discover");
        assert_eq!(found.len(), 1);

        // A matching fingerprint answers from the record without reading sources.
        fs::remove_file(&path).expect("remove source");
        assert_eq!(cache.discover("web", &first, &sources).expect("cached"), found);
        assert_eq!(cache.load("web", &fingerprint("two")).expect("load"), None);
        assert!(cache.discover("web", &fingerprint("two"), &sources).is_err());
    }
}
