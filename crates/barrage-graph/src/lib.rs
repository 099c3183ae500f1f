//! Task graph construction and scheduling for barrage.
//!
//! [`GraphBuilder`] turns resolved source groups into a DAG of build actions
//! for a verb; [`Scheduler`] executes it on a bounded worker pool with
//! up-to-date checks, fail-fast isolation and cancellation.
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

/// Graph construction per verb.
pub mod builder;
/// Task dependency graph.
pub mod graph;
/// Worker pool execution.
pub mod scheduler;

pub use builder::{GraphBuilder, Verb};
pub use graph::{TaskGraph, TaskNode};
pub use scheduler::{
    NodeContext, NodeExecutor, NodeOutput, Scheduler, SchedulerOptions, UpstreamOutputs,
};
pub use tokio_util::sync::CancellationToken;
