//! Built-in demo workers, run via `hirelings worker <name>`.
//!
//! They double as fixtures for the integration tests.

use crate::pool::{Reporter, Work};
use clap::ValueEnum;
use serde_json::{Value, json};
use std::thread;
use std::time::Duration;

/// Selectable built-in worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkerKind {
    /// Progress 1, 2, 3 then success with `{options, job}`.
    Echo,
    /// Succeed with "Done!" after `delay` milliseconds.
    Sleep,
    /// Pause, start, pause again, then succeed with the job payload.
    Slow,
}

/// Echoes jobs back with the worker's options.
///
/// Job flags: `cause_failure` reports a failure, `cause_error` faults,
/// `exit_code` exits the process mid-job, `fault_after_success` succeeds
/// and then faults.
#[derive(Debug, Default)]
pub struct EchoWorker {
    options: Value,
}

impl Work for EchoWorker {
    fn init(&mut self, options: &Value) -> anyhow::Result<()> {
        self.options = options.clone();
        Ok(())
    }

    fn run(&mut self, job: Value, reporter: &mut Reporter<'_>) -> anyhow::Result<()> {
        if flag(&job, "cause_error") {
            anyhow::bail!("THIS IS AN ERROR");
        }
        if flag(&job, "cause_failure") {
            reporter.failure("THIS IS A FAILURE")?;
            return Ok(());
        }
        if let Some(code) = job.get("exit_code").and_then(Value::as_i64) {
            std::process::exit(code as i32);
        }

        for step in 1..=3 {
            reporter.progress(step)?;
        }
        let late_fault = flag(&job, "fault_after_success");
        reporter.success(json!({
            "options": self.options,
            "job": job,
        }))?;
        if late_fault {
            anyhow::bail!("FAULT AFTER SUCCESS");
        }
        Ok(())
    }
}

/// Sleeps for `delay` milliseconds, then succeeds.
#[derive(Debug, Default)]
pub struct SleepWorker;

impl Work for SleepWorker {
    fn run(&mut self, job: Value, reporter: &mut Reporter<'_>) -> anyhow::Result<()> {
        thread::sleep(delay(&job, 0));
        reporter.success("Done!")?;
        Ok(())
    }
}

/// Takes its time: waits `delay` ms (default 500) before and after
/// reporting progress.
#[derive(Debug, Default)]
pub struct SlowWorker;

impl Work for SlowWorker {
    fn init(&mut self, _options: &Value) -> anyhow::Result<()> {
        thread::sleep(Duration::from_millis(100));
        Ok(())
    }

    fn run(&mut self, job: Value, reporter: &mut Reporter<'_>) -> anyhow::Result<()> {
        let pause = delay(&job, 500);
        thread::sleep(pause);
        reporter.progress("halfway")?;
        thread::sleep(pause);
        reporter.success(job)?;
        Ok(())
    }
}

fn flag(job: &Value, name: &str) -> bool {
    job.get(name).and_then(Value::as_bool).unwrap_or(false)
}

fn delay(job: &Value, default_ms: u64) -> Duration {
    let ms = job.get("delay").and_then(Value::as_u64).unwrap_or(default_ms);
    Duration::from_millis(ms)
}
