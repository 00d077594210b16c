//! hirelings - run jobs in a bounded pool of worker processes

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::{Value, json};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{debug, info};

use cli::{Cli, Commands, RunArgs, WorkerArgs};
use hirelings::logging::{self, LogConfig};
use hirelings::pool::{
    Hireling, JobEvent, JobId, LEADER_PID_ENV, Leader, LeaderConfig, ShutdownHandle,
};
use hirelings::workers::{EchoWorker, SleepWorker, SlowWorker, WorkerKind};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let mut log_config = LogConfig::from_verbosity(cli.verbose, cli.quiet).with_ansi(!cli.no_color);
    if cli.verbose > 0 || cli.quiet {
        // Explicit flags beat HIRELINGS_LOG and RUST_LOG.
        let level = log_config.level.to_string().to_lowercase();
        log_config = log_config.with_filter(level);
    }
    let mut log_config = log_config.with_env_overrides();
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    logging::init(log_config);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Worker(args) => cmd_worker(args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Tally of terminal events.
#[derive(Debug, Default)]
struct RunSummary {
    succeeded: usize,
    failed: usize,
    errored: usize,
    aborted: usize,
}

impl RunSummary {
    fn record(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Success(_) => self.succeeded += 1,
            JobEvent::Failure(_) => self.failed += 1,
            JobEvent::Error(_) => self.errored += 1,
            JobEvent::Abort => self.aborted += 1,
            JobEvent::Start | JobEvent::Progress(_) => {}
        }
    }

    fn total(&self) -> usize {
        self.succeeded + self.failed + self.errored + self.aborted
    }
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let (program, worker_args) = args
        .worker
        .split_first()
        .context("No worker program given")?;

    let config = LeaderConfig::new(program)
        .with_args(worker_args.iter().cloned())
        .with_concurrency(args.concurrency)
        .with_options(args.options.clone());

    let payloads = read_jobs(args.input.as_deref())?;
    let expected = payloads.len();

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let summary = rt.block_on(run_jobs(config, payloads))?;

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        errored = summary.errored,
        aborted = summary.aborted,
        "All jobs finished"
    );

    if summary.succeeded != expected {
        anyhow::bail!(
            "{} of {} jobs did not succeed",
            expected - summary.succeeded,
            expected
        );
    }
    Ok(())
}

/// Read one JSON payload per non-blank line.
fn read_jobs(input: Option<&Path>) -> Result<Vec<Value>> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    let mut payloads = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read jobs")?;
        if line.trim().is_empty() {
            continue;
        }
        let payload = serde_json::from_str(&line)
            .with_context(|| format!("Invalid job on line {}", index + 1))?;
        payloads.push(payload);
    }
    Ok(payloads)
}

async fn run_jobs(config: LeaderConfig, payloads: Vec<Value>) -> Result<RunSummary> {
    let leader = Leader::new(config)?;
    let signals = tokio::spawn(forward_signals(leader.shutdown_handle()));

    let (tx, mut rx) = mpsc::unbounded_channel::<(JobId, JobEvent)>();
    for payload in payloads {
        let mut job = leader.enqueue(payload);
        let tx = tx.clone();
        tokio::spawn(async move {
            let id = job.id();
            while let Some(event) = job.next_event().await {
                if tx.send((id, event)).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut summary = RunSummary::default();
    while let Some((id, event)) = rx.recv().await {
        let line = json!({
            "job": id.get(),
            "event": event.name(),
            "data": event.data(),
        });
        writeln!(io::stdout().lock(), "{}", line).context("Failed to write event")?;
        summary.record(&event);
    }

    debug!(jobs = summary.total(), "Event stream closed");
    signals.abort();
    leader.shutdown();
    Ok(summary)
}

/// Shut the pool down on SIGINT or SIGTERM.
async fn forward_signals(shutdown: ShutdownHandle) -> io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down workers"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down workers"),
    }

    shutdown.shutdown();
    Ok(())
}

fn cmd_worker(args: &WorkerArgs) -> Result<()> {
    debug!(
        kind = ?args.kind,
        leader_pid = ?std::env::var(LEADER_PID_ENV).ok(),
        "Starting worker"
    );

    match args.kind {
        WorkerKind::Echo => Hireling::new(EchoWorker::default()).run_main(),
        WorkerKind::Sleep => Hireling::new(SleepWorker).run_main(),
        WorkerKind::Slow => Hireling::new(SlowWorker).run_main(),
    }
}
