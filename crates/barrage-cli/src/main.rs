//! Barrage command line: compile, run, report on and upload load-test simulations.
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

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use barrage_core::{BuildConfig, BuildError};
use barrage_graph::Verb;
use barrage_runner::{BuildOverrides, Orchestrator};
use clap::Parser as _;
use console::{Term, style};
use tokio::signal::ctrl_c;
use tracing::{debug, warn};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use cli::{Cli, Commands, RunArgs, Selection};

mod cli;
mod summary;

/// Exit status for invalid configuration or arguments.
const EXIT_CONFIGURATION: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(error) = init_logging(cli.verbose, cli.log_file.as_deref()) {
        report_error(&error);
        return ExitCode::FAILURE;
    }

    match execute(cli).await {
        Ok(code) => code,
        Err(error) => {
            report_error(&error);
            let configuration = matches!(
                error.downcast_ref::<BuildError>(),
                Some(BuildError::Configuration(_) | BuildError::Toml(_))
            );
            if configuration {
                ExitCode::from(EXIT_CONFIGURATION)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let default_filter = match verbose {
        0 => "warn,barrage=info",
        1 => "info,barrage=debug",
        _ => "debug,barrage=trace",
    };
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .with_level(true),
            )
        }
        None => None,
    };

    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(verbose > 0)
                .without_time(),
        )
        .with(file_layer)
        .try_init()
        .context("Failed to initialise logging")?;
    Ok(())
}

fn report_error(error: &anyhow::Error) {
    let term = Term::stderr();
    let message = format!("{} {error:#}", style("error:").red().bold());
    if term.write_line(&message).is_err() {
        warn!("{error:#}");
    }
}

fn load_config(cli: &Cli) -> Result<BuildConfig> {
    let config = match &cli.config {
        Some(path) => BuildConfig::load_from_file(path)?,
        None => BuildConfig::discover(&cli.project)?,
    };
    debug!(root = %config.project.root.display(), "Configuration loaded");
    Ok(config)
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let mut overrides = BuildOverrides {
        max_workers: cli.workers,
        ..BuildOverrides::default()
    };

    let (verb, groups) = match cli.command {
        Commands::Clean => return clean(config),
        Commands::Compile(Selection { groups }) => (Verb::Compile, groups),
        Commands::Report(Selection { groups }) => (Verb::Report, groups),
        Commands::Upload {
            selection,
            abort_on_failure,
        } => {
            overrides.abort_on_failure = abort_on_failure;
            (Verb::Upload, selection.groups)
        }
        Commands::Run { selection, run } => {
            apply_run_args(&mut overrides, run);
            (Verb::Run, selection.groups)
        }
    };

    let orchestrator = Orchestrator::with_overrides(config, &overrides)?;
    let cancel = orchestrator.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling build");
            cancel.cancel();
        }
    });

    let result = orchestrator.execute(verb, &groups).await;
    interrupt.abort();
    let summary = result?;

    let term = Term::stdout();
    term.write_line(&summary::render(&summary, term.features().colors_supported()))?;
    Ok(ExitCode::from(u8::try_from(summary.exit_code()).unwrap_or(1)))
}

fn apply_run_args(overrides: &mut BuildOverrides, run: RunArgs) {
    overrides.simulation = run.simulation;
    overrides.run_timeout = run.timeout.map(Duration::from_secs);
    overrides.abort_on_failure = run.abort_on_failure;
    overrides.system_properties = run.system_properties.into_iter().collect::<BTreeMap<_, _>>();
}

fn clean(config: BuildConfig) -> Result<ExitCode> {
    let orchestrator = Orchestrator::new(config)?;
    let root = orchestrator.layout().root().to_path_buf();
    let removed = orchestrator.clean()?;
    let message = if removed {
        format!("Removed {}", root.display())
    } else {
        format!("Nothing to clean at {}", root.display())
    };
    Term::stdout().write_line(&message)?;
    Ok(ExitCode::SUCCESS)
}
