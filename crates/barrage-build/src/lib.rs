//! Source resolution, compilation and classpath assembly for barrage.
//!
//! Everything here runs before a simulation is launched: resolving source
//! groups against the filesystem, compiling them, building deterministic
//! classpaths and discovering which simulations a group declares.
#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        reason = "Allow for tests"
    )
)]

/// Classpath assembly.
pub mod classpath;
/// Compiler seam and process-based compiler.
pub mod compiler;
/// Simulation discovery and filtering.
pub mod discovery;
/// Shared engine classpath.
pub mod engine;
/// Source group resolution.
pub mod resolver;
/// Source file enumeration.
pub mod sources;

pub use classpath::{ClasspathAssembler, expand_path_pattern};
pub use compiler::{
    CompileOutput, CompileRequest, Compiler, ProcessCompiler, compile_fingerprint,
    output_fingerprint,
};
pub use discovery::{DiscoveryCache, SimulationFilter, discover_simulations, scan_source};
pub use engine::{engine_fingerprint, resolve_engine_classpath};
pub use resolver::SourceSets;
pub use sources::{SourceFile, collect_sources};
