//! Build actions for barrage: compiling source groups, launching simulations,
//! aggregating their reports and submitting packages remotely.
//!
//! [`Orchestrator`] is the entry point used by the command line.
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

/// Node executor for every task kind.
pub mod actions;
/// Remote execution service client and packaging.
pub mod enterprise;
/// Simulation child processes.
pub mod launcher;
/// Build directory layout.
pub mod layout;
/// Build facade.
pub mod orchestrator;
/// Run manifests and report aggregation.
pub mod report;

pub use actions::BuildActions;
pub use enterprise::{
    EnterpriseClient, HttpEnterpriseClient, RemoteRunState, RemoteSubmitter, SubmissionOutcome,
    create_package,
};
pub use launcher::{LaunchOutcome, OutputLine, OutputStream, SimulationLauncher};
pub use layout::BuildLayout;
pub use orchestrator::{BuildOverrides, Orchestrator};
pub use report::{RunManifest, RunRecord, aggregate, discover_runs, locate_run_directory};
