//! Core types for the barrage simulation build orchestrator.
//!
//! This crate provides the data model shared by every stage of a build:
//! configuration, the error taxonomy, task identities and results, content
//! fingerprints and the durable fingerprint cache.
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

/// Durable fingerprint cache.
pub mod cache;
/// Configuration loaded from `barrage.toml`.
pub mod config;
/// Error types and result definitions.
pub mod error;
/// Content fingerprints.
pub mod fingerprint;
/// Report summaries.
pub mod report;
/// Simulation launch descriptors.
pub mod run_spec;
/// Source groups and classpaths.
pub mod source_group;
/// Task identities, states and results.
pub mod task;

pub use cache::{CacheEntry, FingerprintCache};
pub use config::{
    ArtifactMetadata, BuildConfig, CompilerConfig, EngineConfig, EnterpriseConfig,
    ExecutionConfig, RetryPolicy, SourceGroupConfig,
};
pub use error::{BuildError, RemoteSubmissionError, Result, TaskFailure};
pub use fingerprint::{Fingerprint, FingerprintAlgorithm, Fingerprinter};
pub use report::ReportSummary;
pub use run_spec::SimulationRunSpec;
pub use source_group::{DependencyRef, ResolvedClasspath, SourceGroup};
pub use task::{BuildSummary, ExecutionResult, FailureCause, TaskId, TaskKind, TaskStatus};
