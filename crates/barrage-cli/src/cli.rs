use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

/// Command-line arguments for barrage
#[derive(Debug, Parser)]
#[command(name = "barrage", version)]
#[command(about = "Compile, run and report load-test simulations", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, default_value = ".", help = "Project root directory")]
    pub project: PathBuf,

    #[arg(short, long, global = true, help = "Configuration file [default: <project>/barrage.toml]")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, action = ArgAction::Count, help = "More logging (-v debug, -vv trace)")]
    pub verbose: u8,

    #[arg(long, global = true, help = "Also write logs to this file")]
    pub log_file: Option<PathBuf>,

    #[arg(long, global = true, help = "Worker pool size (overrides config)")]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Build verbs.
#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Compile source groups")]
    Compile(Selection),

    #[command(about = "Compile, run simulations and aggregate their reports")]
    Run {
        #[command(flatten)]
        selection: Selection,

        #[command(flatten)]
        run: RunArgs,
    },

    #[command(about = "Aggregate the latest reports without running anything")]
    Report(Selection),

    #[command(about = "Package compiled simulations and submit them remotely")]
    Upload {
        #[command(flatten)]
        selection: Selection,

        #[arg(long, help = "Cancel the build on the first failure")]
        abort_on_failure: bool,
    },

    #[command(about = "Delete the build directory and fingerprint cache")]
    Clean,
}

/// Source group filter.
#[derive(Debug, Args)]
pub struct Selection {
    #[arg(help = "Source groups to build (default: all)")]
    pub groups: Vec<String>,
}

/// Options for simulation runs.
#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(short, long, help = "Run only this simulation (fully-qualified or simple name)")]
    pub simulation: Option<String>,

    #[arg(long, value_name = "SECONDS", help = "Wall-clock limit per simulation")]
    pub timeout: Option<u64>,

    #[arg(
        short = 'D',
        long = "system-property",
        value_name = "KEY=VALUE",
        value_parser = parse_property,
        help = "System property passed to simulations (repeatable)"
    )]
    pub system_properties: Vec<(String, String)>,

    #[arg(long, help = "Cancel the build on the first failure")]
    pub abort_on_failure: bool,
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), value.to_owned()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_property() {
        assert_eq!(
            parse_property("baseUrl=http://localhost:8080?a=b"),
            Ok(("baseUrl".to_owned(), "http://localhost:8080?a=b".to_owned()))
        );
        assert_eq!(parse_property("empty="), Ok(("empty".to_owned(), String::new())));
        assert!(parse_property("=value").is_err());
        assert!(parse_property("novalue").is_err());
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from([
            "barrage",
            "--workers",
            "3",
            "run",
            "web",
            "--simulation",
            "BasicSimulation",
            "-D",
            "users=5",
            "--timeout",
            "60",
        ]);
        assert_eq!(cli.workers, Some(3));
        let Commands::Run { selection, run } = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(selection.groups, vec!["web"]);
        assert_eq!(run.simulation.as_deref(), Some("BasicSimulation"));
        assert_eq!(run.timeout, Some(60));
        assert_eq!(
            run.system_properties,
            vec![("users".to_owned(), "5".to_owned())]
        );
    }

    #[test]
    fn test_global_flags_after_verb() {
        let cli = Cli::parse_from(["barrage", "compile", "-vv", "--project", "/tmp/project"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.project, PathBuf::from("/tmp/project"));
        assert!(matches!(cli.command, Commands::Compile(_)));
    }
}
