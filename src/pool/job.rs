//! Jobs and their event streams.
//!
//! A [`Job`] is the caller's view of one unit of work: an ordered stream of
//! [`JobEvent`]s ending in exactly one terminal event. The leader owns the
//! other half of the job (`JobCore`) and is the only one that emits.

use super::leader::Shared;
use super::protocol::WorkerMessage;
use super::signals::TerminationReason;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Leader-scoped job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job #{}", self.0)
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Failure reported by the worker code itself.
    Reported(Value),
    /// The worker process exited while the job was running.
    Exit(TerminationReason),
    /// The leader killed the worker (shutdown).
    Killed,
    /// The job was still queued when the leader shut down.
    Shutdown,
    /// No worker could be started for the job.
    Unassignable(String),
}

impl FailureReason {
    /// Whether the failure came from losing the worker process rather than
    /// from the job's own code.
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit(_) | Self::Killed)
    }

    /// JSON rendering used when events leave the process.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Reported(data) => data.clone(),
            Self::Exit(reason) => Value::String(format!("exit: {}", reason)),
            Self::Killed => Value::String("killed".into()),
            Self::Shutdown => Value::String("shutdown".into()),
            Self::Unassignable(msg) => Value::String(format!("unassignable: {}", msg)),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reported(data) => write!(f, "{}", data),
            Self::Exit(reason) => write!(f, "worker {}", reason),
            Self::Killed => write!(f, "worker killed"),
            Self::Shutdown => write!(f, "leader shut down before the job ran"),
            Self::Unassignable(msg) => write!(f, "no worker available: {}", msg),
        }
    }
}

/// One event in a job's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A worker acknowledged the job.
    Start,
    /// Intermediate progress; may repeat.
    Progress(Value),
    /// Terminal: the job succeeded.
    Success(Value),
    /// Terminal: the job failed, gracefully or by losing its worker.
    Failure(FailureReason),
    /// Terminal: the worker code faulted.
    Error(Value),
    /// Terminal: the job was aborted.
    Abort,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Start | Self::Progress(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Progress(_) => "progress",
            Self::Success(_) => "success",
            Self::Failure(_) => "failure",
            Self::Error(_) => "error",
            Self::Abort => "abort",
        }
    }

    /// Event payload, if it has one.
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::Start | Self::Abort => None,
            Self::Progress(data) | Self::Success(data) | Self::Error(data) => Some(data.clone()),
            Self::Failure(reason) => Some(reason.to_value()),
        }
    }
}

impl From<WorkerMessage> for JobEvent {
    fn from(msg: WorkerMessage) -> Self {
        match msg {
            WorkerMessage::Start => Self::Start,
            WorkerMessage::Progress { data } => Self::Progress(data),
            WorkerMessage::Success { data } => Self::Success(data),
            WorkerMessage::Failure { data } => Self::Failure(FailureReason::Reported(data)),
            WorkerMessage::Error { data } => Self::Error(data),
        }
    }
}

/// Sentinel for "not assigned"; child PIDs are never zero.
const UNASSIGNED: u32 = 0;

/// Leader-side state of a job.
#[derive(Debug)]
pub(crate) struct JobCore {
    id: JobId,
    payload: Value,
    done: AtomicBool,
    /// Set once a worker has acknowledged the job.
    started: AtomicBool,
    /// PID of the worker running the job.
    hireling: AtomicU32,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl JobCore {
    pub(crate) fn new(
        id: JobId,
        payload: Value,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<JobEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let core = Arc::new(Self {
            id,
            payload,
            done: AtomicBool::new(false),
            started: AtomicBool::new(false),
            hireling: AtomicU32::new(UNASSIGNED),
            events,
        });
        (core, rx)
    }

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn payload(&self) -> &Value {
        &self.payload
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn hireling(&self) -> Option<u32> {
        match self.hireling.load(Ordering::Acquire) {
            UNASSIGNED => None,
            pid => Some(pid),
        }
    }

    pub(crate) fn assign_to(&self, pid: u32) {
        self.hireling.store(pid, Ordering::Release);
    }

    /// Clear the worker assignment, returning the previous PID.
    pub(crate) fn unassign(&self) -> Option<u32> {
        match self.hireling.swap(UNASSIGNED, Ordering::AcqRel) {
            UNASSIGNED => None,
            pid => Some(pid),
        }
    }

    /// Deliver an event to the caller.
    ///
    /// This is the single terminal guard: the first terminal event flips
    /// `done`, every event after that is dropped. Returns whether the event
    /// was delivered.
    pub(crate) fn emit(&self, event: JobEvent) -> bool {
        if event.is_terminal() {
            if self.done.swap(true, Ordering::AcqRel) {
                return false;
            }
        } else if self.is_done() {
            return false;
        }
        if matches!(event, JobEvent::Start) {
            self.started.store(true, Ordering::Release);
        }
        // The caller may have dropped its Job; the transition still counts.
        let _ = self.events.send(event);
        true
    }
}

/// Cloneable control handle for a job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    core: Arc<JobCore>,
    leader: Weak<Shared>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.core.id()
    }

    pub fn payload(&self) -> &Value {
        self.core.payload()
    }

    /// Whether the job has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }

    /// PID of the worker currently running the job.
    pub fn worker_pid(&self) -> Option<u32> {
        self.core.hireling()
    }

    /// Abort the job.
    ///
    /// Emits a terminal `Abort` unless the job already finished. A running
    /// job's worker process is killed, since there is no way to stop work
    /// in flight short of that; a queued job is dropped from the backlog.
    /// Calling this more than once has no further effect.
    ///
    /// May spawn a replacement worker for the backlog, so it must be called
    /// from within a Tokio runtime.
    pub fn abort(&self) {
        match self.leader.upgrade() {
            Some(shared) => shared.lock().abort(&self.core),
            None => {
                self.core.emit(JobEvent::Abort);
            }
        }
    }
}

/// A submitted job and its event stream.
#[derive(Debug)]
pub struct Job {
    handle: JobHandle,
    events: mpsc::UnboundedReceiver<JobEvent>,
    finished: bool,
}

impl Job {
    pub(crate) fn new(
        core: Arc<JobCore>,
        events: mpsc::UnboundedReceiver<JobEvent>,
        leader: Weak<Shared>,
    ) -> Self {
        Self {
            handle: JobHandle { core, leader },
            events,
            finished: false,
        }
    }

    pub fn id(&self) -> JobId {
        self.handle.id()
    }

    pub fn payload(&self) -> &Value {
        self.handle.payload()
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.handle.worker_pid()
    }

    /// See [`JobHandle::abort`].
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// A handle that can abort or inspect the job from elsewhere.
    pub fn handle(&self) -> JobHandle {
        self.handle.clone()
    }

    /// Wait for the next event. Returns `None` once the terminal event has
    /// been delivered.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await;
        match &event {
            Some(e) if e.is_terminal() => self.finished = true,
            Some(_) => {}
            None => self.finished = true,
        }
        event
    }

    /// Collect every remaining event, terminal event included.
    pub async fn events(&mut self) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }

    /// Wait for the terminal event, discarding progress.
    pub async fn outcome(mut self) -> JobEvent {
        let mut last = None;
        while let Some(event) = self.next_event().await {
            last = Some(event);
        }
        match last {
            Some(event) if event.is_terminal() => event,
            // Stream closed without a verdict: the leader went away.
            _ => JobEvent::Failure(FailureReason::Killed),
        }
    }
}
