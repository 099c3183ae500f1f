//! Build summary table.

use core::fmt::Write as _;
use std::time::Duration;

use barrage_core::{BuildSummary, TaskStatus};
use console::style;

/// Renders one row per task, then failure details and report locations.
pub fn render(summary: &BuildSummary, colors: bool) -> String {
    let width = summary
        .results
        .iter()
        .map(|result| result.task.to_string().len())
        .max()
        .unwrap_or(4)
        .max(4);

    let mut out = String::new();
    let _ignored = writeln!(out, "{:<width$}  {:<18}  {:>9}", "TASK", "STATUS", "TIME");
    for result in &summary.results {
        let label = format!("{:<18}", result.status.label());
        let label = if colors { paint(result.status, &label) } else { label };
        let _ignored = writeln!(
            out,
            "{:<width$}  {label}  {:>9}",
            result.task.to_string(),
            format_duration(result.duration)
        );
    }

    let failures: Vec<_> = summary.failures().collect();
    if !failures.is_empty() {
        out.push('\n');
        for result in failures {
            if let Some(failure) = &result.failure {
                let _ignored = writeln!(out, "{failure}");
            }
            if let Some(log) = &result.log {
                let _ignored = writeln!(out, "  log: {}", log.display());
            }
        }
    }

    let reports: Vec<_> = summary
        .results
        .iter()
        .flat_map(|result| &result.reports)
        .collect();
    if !reports.is_empty() {
        out.push('\n');
        for report in reports {
            let verdict = if report.passed() { "passed" } else { "failed" };
            let _ignored = writeln!(
                out,
                "{} {verdict} ({} assertions): {}",
                report.simulation,
                report.assertions_total,
                report.directory.display()
            );
        }
    }

    let total = summary.results.len();
    let failed = summary.failures().count();
    let verdict = if summary.is_success() {
        "BUILD SUCCESSFUL"
    } else {
        "BUILD FAILED"
    };
    let _ignored = write!(out, "\n{verdict}: {total} tasks, {failed} failed");
    out
}

fn paint(status: TaskStatus, label: &str) -> String {
    match status {
        TaskStatus::Succeeded => style(label).green().to_string(),
        TaskStatus::SkippedUpToDate => style(label).dim().to_string(),
        TaskStatus::Failed(_) => style(label).red().bold().to_string(),
        _ => style(label).yellow().to_string(),
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        "-".to_owned()
    } else if duration < Duration::from_secs(1) {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}
