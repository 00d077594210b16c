//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use hirelings::logging::LogFormat;
use hirelings::pool::default_concurrency;
use hirelings::workers::WorkerKind;
use std::ffi::OsString;
use std::path::PathBuf;

/// Run jobs in a bounded pool of worker processes.
#[derive(Parser, Debug)]
#[command(name = "hirelings")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    /// Log format for stderr.
    #[arg(long, env = "HIRELINGS_LOG_FORMAT", global = true, value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run JSON jobs (one per input line) through a pool of workers.
    Run(RunArgs),

    /// Act as a worker: speak the protocol on stdin/stdout.
    Worker(WorkerArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Maximum number of worker processes.
    #[arg(short, long, env = "HIRELINGS_CONCURRENCY", default_value_t = default_concurrency())]
    pub concurrency: usize,

    /// JSON options sent to every worker on startup.
    #[arg(long, value_parser = parse_json, default_value = "{}")]
    pub options: serde_json::Value,

    /// File with one JSON job per line (default: stdin).
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Worker program followed by its arguments.
    #[arg(required = true, last = true, value_name = "PROGRAM")]
    pub worker: Vec<OsString>,
}

/// Arguments for the worker command.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Built-in worker to run.
    #[arg(value_enum)]
    pub kind: WorkerKind,
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "hirelings",
            &mut std::io::stdout(),
        );
    }
}

fn parse_json(s: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON: {}", e))
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args() {
        let cli = Cli::try_parse_from([
            "hirelings",
            "run",
            "-c",
            "3",
            "--options",
            r#"{"thing":"ohai"}"#,
            "--",
            "hirelings",
            "worker",
            "echo",
        ])
        .unwrap();

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.concurrency, 3);
                assert_eq!(args.options, json!({"thing": "ohai"}));
                assert_eq!(args.input, None);
                let worker: Vec<_> = args.worker.iter().map(|s| s.to_str().unwrap()).collect();
                assert_eq!(worker, vec!["hirelings", "worker", "echo"]);
            }
            other => panic!("Expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_run_requires_program() {
        assert!(Cli::try_parse_from(["hirelings", "run"]).is_err());
    }

    #[test]
    fn test_bad_options_rejected() {
        let err = Cli::try_parse_from(["hirelings", "run", "--options", "{nope", "--", "w"])
            .unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn test_worker_kind() {
        let cli = Cli::try_parse_from(["hirelings", "worker", "sleep"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Worker(WorkerArgs { kind: WorkerKind::Sleep })
        ));
        assert!(Cli::try_parse_from(["hirelings", "worker", "bogus"]).is_err());
    }

    #[test]
    fn test_log_format_flag() {
        let cli =
            Cli::try_parse_from(["hirelings", "--log-format", "json", "worker", "echo"]).unwrap();
        assert_eq!(cli.log_format, Some(LogFormat::Json));
    }
}
