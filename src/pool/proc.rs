//! Leader-side handle for one worker subprocess.
//!
//! A [`HirelingProcess`] owns its child process and both ends of the
//! channel. Two tasks back it: a writer draining the outbox into the
//! child's stdin, and a supervisor that forwards stdout messages to the
//! leader and reports the exit once stdout closes.

use super::config::LeaderConfig;
use super::job::{FailureReason, JobCore};
use super::leader::Shared;
use super::protocol::{LeaderMessage, WorkerMessage};
use super::signals::{TerminationReason, analyze_exit_status};
use super::spawn::spawn_worker;
use crate::error::{HirelingError, Result};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Handle to a worker subprocess.
#[derive(Debug)]
pub(crate) struct HirelingProcess {
    /// Process ID
    pid: u32,
    /// Distinguishes this process from an earlier one with a recycled PID.
    serial: u64,
    /// Job currently assigned, if busy.
    job: Option<Arc<JobCore>>,
    /// Messages for the writer task.
    outbox: mpsc::UnboundedSender<LeaderMessage>,
    /// Fires the supervisor's kill path.
    kill: Option<oneshot::Sender<()>>,
    /// Number of jobs this worker has been handed.
    jobs_accepted: usize,
    spawned_at: Instant,
}

impl HirelingProcess {
    /// Spawn a worker, send it `init`, and start its supervisor.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn(config: &LeaderConfig, serial: u64, leader: Weak<Shared>) -> Result<Self> {
        let mut child = spawn_worker(config)?;

        let pid = child
            .id()
            .ok_or_else(|| HirelingError::Protocol("worker exited during spawn".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HirelingError::Protocol("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HirelingError::Protocol("worker stdout not captured".into()))?;

        let (outbox, inbox) = mpsc::unbounded_channel();
        let (kill, kill_rx) = oneshot::channel();

        tokio::spawn(write_loop(pid, stdin, inbox));
        tokio::spawn(supervise(pid, serial, child, stdout, kill_rx, leader));

        let hireling = Self {
            pid,
            serial,
            job: None,
            outbox,
            kill: Some(kill),
            jobs_accepted: 0,
            spawned_at: Instant::now(),
        };
        hireling.send(LeaderMessage::init(config.options.clone()));

        debug!(pid, serial, "Spawned hireling");
        Ok(hireling)
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.job.is_some()
    }

    pub(crate) fn job(&self) -> Option<&Arc<JobCore>> {
        self.job.as_ref()
    }

    pub(crate) fn jobs_accepted(&self) -> usize {
        self.jobs_accepted
    }

    /// Take on a job and send it to the worker.
    ///
    /// Fails without touching the current assignment if already busy.
    pub(crate) fn accept_job(&mut self, job: Arc<JobCore>) -> Result<()> {
        if let Some(current) = &self.job {
            return Err(HirelingError::AlreadyBusy {
                pid: self.pid,
                job: current.id(),
            });
        }
        job.assign_to(self.pid);
        self.send(LeaderMessage::job(job.payload().clone()));
        self.jobs_accepted += 1;
        trace!(pid = self.pid, job_id = job.id().get(), "Hireling accepted job");
        self.job = Some(job);
        Ok(())
    }

    /// Drop the current job, marking the worker idle.
    pub(crate) fn release(&mut self) -> Option<Arc<JobCore>> {
        self.job.take()
    }

    /// Kill the worker process. Reconciliation is the caller's job.
    pub(crate) fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            debug!(
                pid = self.pid,
                uptime_ms = self.spawned_at.elapsed().as_millis(),
                "Killing hireling"
            );
            let _ = kill.send(());
        }
    }

    fn send(&self, message: LeaderMessage) {
        // A closed outbox means the worker is already on its way out; the
        // supervisor reports that exit separately.
        if self.outbox.send(message).is_err() {
            debug!(pid = self.pid, "Hireling outbox closed, message dropped");
        }
    }
}

/// Forward queued messages to the worker's stdin.
async fn write_loop(
    pid: u32,
    mut stdin: ChildStdin,
    mut inbox: mpsc::UnboundedReceiver<LeaderMessage>,
) {
    while let Some(message) = inbox.recv().await {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(pid, error = %e, "Failed to encode message for hireling");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(pid, error = %e, "Hireling stdin closed");
            return;
        }
        if let Err(e) = stdin.flush().await {
            debug!(pid, error = %e, "Hireling stdin closed");
            return;
        }
    }
    // Outbox dropped: closing stdin tells the worker to wind down.
}

/// Read worker messages until stdout closes or a kill is requested, then
/// wait for the process and report its exit.
///
/// All stdout lines are handled before the exit, so a worker that reports
/// a result and then exits is seen to succeed.
async fn supervise(
    pid: u32,
    serial: u64,
    mut child: Child,
    stdout: ChildStdout,
    mut kill_rx: oneshot::Receiver<()>,
    leader: Weak<Shared>,
) {
    let mut lines = BufReader::new(stdout).lines();

    // A dropped sender counts as a kill request: the handle is gone.
    let mut killed = loop {
        tokio::select! {
            biased;
            _ = &mut kill_rx => break true,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match WorkerMessage::from_line(&line) {
                        Ok(message) => {
                            with_leader(&leader, |pool| pool.on_message(pid, serial, message))
                        }
                        Err(e) => {
                            warn!(pid, error = %e, line = %line, "Ignoring malformed message")
                        }
                    }
                }
                Ok(None) => break false,
                Err(e) => {
                    warn!(pid, error = %e, "Failed to read from hireling");
                    break false;
                }
            },
        }
    };

    let status = if killed {
        let _ = child.start_kill();
        child.wait().await
    } else {
        tokio::select! {
            status = child.wait() => status,
            _ = &mut kill_rx => {
                killed = true;
                let _ = child.start_kill();
                child.wait().await
            }
        }
    };

    let reason = match status {
        Ok(status) => analyze_exit_status(status),
        Err(e) => {
            warn!(pid, error = %e, "Failed to wait for hireling");
            TerminationReason::Unknown
        }
    };
    debug!(pid, killed, reason = %reason, "Hireling exited");

    with_leader(&leader, |pool| {
        pool.on_worker_exit(pid, serial, FailureReason::Exit(reason))
    });
}

fn with_leader(leader: &Weak<Shared>, f: impl FnOnce(&mut super::leader::Pool)) {
    if let Some(shared) = leader.upgrade() {
        f(&mut shared.lock());
    }
}
