//! Report summaries surfaced to the invoking surface.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Engine verdict for one simulation run, as recorded in its output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Fully-qualified simulation name
    pub simulation: String,
    /// Run-scoped output directory
    pub directory: PathBuf,
    /// Number of assertions the engine evaluated
    pub assertions_total: usize,
    /// Messages of assertions the engine marked as failed
    pub failed_assertions: Vec<String>,
}

impl ReportSummary {
    /// A run passes when the engine recorded no failing assertion.
    pub fn passed(&self) -> bool {
        self.failed_assertions.is_empty()
    }
}
