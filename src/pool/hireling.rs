//! Worker side of the channel.
//!
//! A worker binary wraps its job logic in a [`Work`] implementation and
//! hands it to [`Hireling::run_main`], which speaks the protocol over
//! stdin/stdout until the leader closes the pipe.
//!
//! ```no_run
//! use hirelings::pool::{Hireling, Reporter, Work};
//! use serde_json::Value;
//!
//! struct Double;
//!
//! impl Work for Double {
//!     fn run(&mut self, job: Value, reporter: &mut Reporter<'_>) -> anyhow::Result<()> {
//!         let n = job["n"].as_i64().unwrap_or(0);
//!         reporter.success(n * 2)?;
//!         Ok(())
//!     }
//! }
//!
//! Hireling::new(Double).run_main();
//! ```

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{LeaderMessage, WorkerMessage};
use crate::error::{HirelingError, Result};
use serde_json::Value;
use std::any::Any;
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Job logic run inside a worker process.
pub trait Work {
    /// Called once the leader's options have been merged over the defaults.
    fn init(&mut self, options: &Value) -> anyhow::Result<()> {
        let _ = options;
        Ok(())
    }

    /// Run one job.
    ///
    /// Report progress and the result through `reporter`. Returning `Ok`
    /// without a result reports `success(null)`; returning `Err` or
    /// panicking reports `error` and takes the worker process down.
    fn run(&mut self, job: Value, reporter: &mut Reporter<'_>) -> anyhow::Result<()>;
}

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HirelingState {
    /// Waiting for `init`.
    Uninitialized,
    /// Waiting for a job.
    Ready,
    /// Inside [`Work::run`].
    Running,
}

trait Outbound {
    fn send(&mut self, message: &WorkerMessage) -> Result<()>;
}

impl<W: Write> Outbound for LineWriter<W> {
    fn send(&mut self, message: &WorkerMessage) -> Result<()> {
        self.write_line(&message.to_line()?)?;
        Ok(())
    }
}

/// Reports a running job's progress and result to the leader.
pub struct Reporter<'a> {
    out: &'a mut dyn Outbound,
    verdict: Option<&'static str>,
}

impl Reporter<'_> {
    pub fn progress(&mut self, data: impl Into<Value>) -> Result<()> {
        if let Some(op) = self.verdict {
            return Err(HirelingError::AlreadyReported(op));
        }
        self.out.send(&WorkerMessage::progress(data.into()))
    }

    pub fn success(&mut self, data: impl Into<Value>) -> Result<()> {
        self.finish(WorkerMessage::success(data.into()))
    }

    /// Report a graceful failure. The worker stays up for the next job.
    pub fn failure(&mut self, reason: impl Into<Value>) -> Result<()> {
        self.finish(WorkerMessage::failure(reason.into()))
    }

    /// Whether a result has been reported.
    pub fn is_finished(&self) -> bool {
        self.verdict.is_some()
    }

    fn finish(&mut self, message: WorkerMessage) -> Result<()> {
        if let Some(op) = self.verdict {
            return Err(HirelingError::AlreadyReported(op));
        }
        self.out.send(&message)?;
        self.verdict = Some(message.op());
        Ok(())
    }
}

/// Protocol driver for a worker process.
pub struct Hireling<W> {
    work: W,
    defaults: Value,
    options: Value,
    state: HirelingState,
    jobs_run: usize,
}

impl<W: Work> Hireling<W> {
    pub fn new(work: W) -> Self {
        Self {
            work,
            defaults: Value::Null,
            options: Value::Null,
            state: HirelingState::Uninitialized,
            jobs_run: 0,
        }
    }

    /// Local option defaults. Options sent by the leader override them key
    /// by key.
    pub fn with_defaults(mut self, defaults: Value) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn state(&self) -> HirelingState {
        self.state
    }

    /// Effective options after the last `init`.
    pub fn options(&self) -> &Value {
        &self.options
    }

    pub fn jobs_run(&self) -> usize {
        self.jobs_run
    }

    pub fn work(&self) -> &W {
        &self.work
    }

    /// Serve leader messages until EOF.
    ///
    /// Returns an error if the channel breaks or the job code faults; the
    /// process is expected to exit non-zero in that case.
    pub fn serve<R: Read, Wr: Write>(
        &mut self,
        reader: &mut LineReader<R>,
        writer: &mut LineWriter<Wr>,
    ) -> Result<()> {
        while let Some(line) = reader.read_line()? {
            if line.trim().is_empty() {
                continue;
            }
            let message = match LeaderMessage::from_line(line) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, line = %line, "Ignoring malformed leader message");
                    continue;
                }
            };
            match message {
                LeaderMessage::Init { data } => self.init(data)?,
                LeaderMessage::Job { data } => self.run_job(data, writer)?,
            }
        }
        debug!(jobs = self.jobs_run, "Leader closed the channel");
        Ok(())
    }

    fn init(&mut self, received: Value) -> Result<()> {
        self.options = merge_options(&self.defaults, received);
        self.state = HirelingState::Ready;

        let options = &self.options;
        let work = &mut self.work;
        match guarded(|| work.init(options)) {
            Ok(()) => Ok(()),
            Err(fault) => {
                error!(error = %fault, "Worker init failed");
                Err(HirelingError::Fault(fault))
            }
        }
    }

    fn run_job<Wr: Write>(&mut self, job: Value, writer: &mut LineWriter<Wr>) -> Result<()> {
        if self.state == HirelingState::Uninitialized {
            warn!("Job arrived before init, running with defaults");
            self.init(Value::Null)?;
        }

        writer.send(&WorkerMessage::Start)?;
        self.state = HirelingState::Running;
        self.jobs_run += 1;

        let mut reporter = Reporter {
            out: writer,
            verdict: None,
        };
        let work = &mut self.work;
        let outcome = guarded(|| work.run(job, &mut reporter));
        let verdict = reporter.verdict;
        self.state = HirelingState::Ready;

        match outcome {
            Ok(()) if verdict.is_none() => writer.send(&WorkerMessage::success(Value::Null)),
            Ok(()) => Ok(()),
            Err(fault) => {
                match verdict {
                    None => writer.send(&WorkerMessage::error(Value::String(fault.clone())))?,
                    Some(op) => warn!(verdict = op, error = %fault, "Job faulted after reporting"),
                }
                Err(HirelingError::Fault(fault))
            }
        }
    }

    /// Serve the leader over stdin/stdout, then exit the process.
    ///
    /// Exits 0 when the leader closes the channel, 1 on a fault.
    pub fn run_main(mut self) -> ! {
        // Ignore SIGPIPE; a vanished leader surfaces as an io::Error.
        unsafe {
            nix::sys::signal::signal(
                nix::sys::signal::Signal::SIGPIPE,
                nix::sys::signal::SigHandler::SigIgn,
            )
            .ok();
        }

        let mut reader = LineReader::new(PipeFd::stdin());
        let mut writer = LineWriter::new(PipeFd::stdout());

        match self.serve(&mut reader, &mut writer) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                error!(error = %e, "Hireling exiting");
                std::process::exit(1);
            }
        }
    }
}

/// Shallow merge: top-level keys of `received` replace those in `defaults`.
fn merge_options(defaults: &Value, received: Value) -> Value {
    match (defaults, received) {
        (Value::Object(defaults), Value::Object(received)) => {
            let mut merged = defaults.clone();
            merged.extend(received);
            Value::Object(merged)
        }
        (defaults, Value::Null) => defaults.clone(),
        (_, received) => received,
    }
}

/// Run job code, turning both errors and panics into a fault message.
fn guarded<F>(f: F) -> std::result::Result<(), String>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {}", msg)
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    /// Scriptable job logic driven by the job payload.
    #[derive(Default)]
    struct Scripted {
        seen_options: Option<Value>,
    }

    impl Work for Scripted {
        fn init(&mut self, options: &Value) -> anyhow::Result<()> {
            if options["refuse"] == json!(true) {
                anyhow::bail!("refusing to start");
            }
            self.seen_options = Some(options.clone());
            Ok(())
        }

        fn run(&mut self, job: Value, reporter: &mut Reporter<'_>) -> anyhow::Result<()> {
            match job["mode"].as_str().unwrap_or("echo") {
                "echo" => {
                    reporter.progress(1)?;
                    reporter.success(job)?;
                }
                "fail" => reporter.failure("nope")?,
                "silent" => {}
                "error" => anyhow::bail!("it broke"),
                "panic" => panic!("it panicked"),
                "twice" => {
                    reporter.success("first")?;
                    let err = reporter.success("second").unwrap_err();
                    assert!(matches!(err, HirelingError::AlreadyReported("success")));
                    assert!(reporter.progress(9).is_err());
                }
                other => anyhow::bail!("unknown mode {}", other),
            }
            Ok(())
        }
    }

    fn input(messages: &[LeaderMessage]) -> LineReader<Cursor<Vec<u8>>> {
        let mut buf = String::new();
        for message in messages {
            buf.push_str(&message.to_line().unwrap());
        }
        LineReader::new(Cursor::new(buf.into_bytes()))
    }

    fn output(writer: &LineWriter<Vec<u8>>) -> Vec<WorkerMessage> {
        String::from_utf8(writer.get_ref().clone())
            .unwrap()
            .lines()
            .map(|line| WorkerMessage::from_line(line).unwrap())
            .collect()
    }

    fn serve(
        hireling: &mut Hireling<Scripted>,
        messages: &[LeaderMessage],
    ) -> (Result<()>, Vec<WorkerMessage>) {
        let mut reader = input(messages);
        let mut writer = LineWriter::new(Vec::new());
        let result = hireling.serve(&mut reader, &mut writer);
        (result, output(&writer))
    }

    #[test]
    fn test_init_merges_received_over_defaults() {
        let mut hireling = Hireling::new(Scripted::default())
            .with_defaults(json!({"thing": "default", "keep": 1}));
        assert_eq!(hireling.state(), HirelingState::Uninitialized);

        let (result, sent) = serve(
            &mut hireling,
            &[LeaderMessage::init(json!({"thing": "ohai"}))],
        );

        assert!(result.is_ok());
        assert!(sent.is_empty());
        assert_eq!(hireling.state(), HirelingState::Ready);
        assert_eq!(hireling.options(), &json!({"thing": "ohai", "keep": 1}));
        assert_eq!(hireling.work().seen_options, Some(json!({"thing": "ohai", "keep": 1})));
    }

    #[test]
    fn test_job_event_sequence() {
        let mut hireling = Hireling::new(Scripted::default());
        let (result, sent) = serve(
            &mut hireling,
            &[
                LeaderMessage::init(json!({})),
                LeaderMessage::job(json!({"whatsit": "orly"})),
                LeaderMessage::job(json!({"mode": "fail"})),
            ],
        );

        assert!(result.is_ok());
        assert_eq!(
            sent,
            vec![
                WorkerMessage::Start,
                WorkerMessage::progress(json!(1)),
                WorkerMessage::success(json!({"whatsit": "orly"})),
                WorkerMessage::Start,
                WorkerMessage::failure(json!("nope")),
            ]
        );
        assert_eq!(hireling.jobs_run(), 2);
        assert_eq!(hireling.state(), HirelingState::Ready);
    }

    #[test]
    fn test_unreported_job_succeeds_with_null() {
        let mut hireling = Hireling::new(Scripted::default());
        let (_, sent) = serve(
            &mut hireling,
            &[
                LeaderMessage::init(json!({})),
                LeaderMessage::job(json!({"mode": "silent"})),
            ],
        );
        assert_eq!(sent, vec![WorkerMessage::Start, WorkerMessage::success(Value::Null)]);
    }

    #[test]
    fn test_error_reports_and_stops() {
        let mut hireling = Hireling::new(Scripted::default());
        let (result, sent) = serve(
            &mut hireling,
            &[
                LeaderMessage::init(json!({})),
                LeaderMessage::job(json!({"mode": "error"})),
                LeaderMessage::job(json!({"whatsit": "never"})),
            ],
        );

        assert!(matches!(result, Err(HirelingError::Fault(ref msg)) if msg == "it broke"));
        assert_eq!(sent, vec![WorkerMessage::Start, WorkerMessage::error(json!("it broke"))]);
    }

    #[test]
    fn test_panic_is_reported_as_error() {
        let mut hireling = Hireling::new(Scripted::default());
        let (result, sent) = serve(
            &mut hireling,
            &[
                LeaderMessage::init(json!({})),
                LeaderMessage::job(json!({"mode": "panic"})),
            ],
        );

        assert!(result.is_err());
        assert_eq!(sent.len(), 2);
        match &sent[1] {
            WorkerMessage::Error { data } => {
                assert!(data.as_str().unwrap().contains("it panicked"));
            }
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_second_verdict_is_not_sent() {
        let mut hireling = Hireling::new(Scripted::default());
        let (result, sent) = serve(
            &mut hireling,
            &[
                LeaderMessage::init(json!({})),
                LeaderMessage::job(json!({"mode": "twice"})),
            ],
        );

        assert!(result.is_ok());
        assert_eq!(sent, vec![WorkerMessage::Start, WorkerMessage::success(json!("first"))]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let mut hireling = Hireling::new(Scripted::default());
        let mut buf = String::from("not json\n\n{\"op\":\"bogus\"}\n");
        buf.push_str(&LeaderMessage::init(json!({})).to_line().unwrap());
        buf.push_str(&LeaderMessage::job(json!({"mode": "silent"})).to_line().unwrap());

        let mut reader = LineReader::new(Cursor::new(buf.into_bytes()));
        let mut writer = LineWriter::new(Vec::new());
        hireling.serve(&mut reader, &mut writer).unwrap();

        assert_eq!(output(&writer).len(), 2);
    }

    #[test]
    fn test_init_failure_is_fatal() {
        let mut hireling = Hireling::new(Scripted::default());
        let (result, sent) = serve(&mut hireling, &[LeaderMessage::init(json!({"refuse": true}))]);
        assert!(matches!(result, Err(HirelingError::Fault(ref msg)) if msg.contains("refusing")));
        assert!(sent.is_empty());
    }

    #[test]
    fn test_merge_options() {
        assert_eq!(
            merge_options(&json!({"a": 1, "b": 2}), json!({"b": 3, "c": 4})),
            json!({"a": 1, "b": 3, "c": 4})
        );
        assert_eq!(merge_options(&json!({"a": 1}), Value::Null), json!({"a": 1}));
        assert_eq!(merge_options(&Value::Null, json!({"a": 1})), json!({"a": 1}));
        assert_eq!(merge_options(&json!({"a": 1}), json!("raw")), json!("raw"));
    }
}
