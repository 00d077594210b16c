//! The leader: a bounded pool of worker processes with a FIFO backlog.
//!
//! All pool state sits behind one mutex. Every mutation (enqueue, worker
//! message, worker exit, abort, shutdown) is a short critical section that
//! never awaits, so the pool behaves like a single-threaded event loop
//! while the workers run in parallel as separate processes.

use super::config::LeaderConfig;
use super::job::{FailureReason, Job, JobCore, JobEvent, JobId};
use super::proc::HirelingProcess;
use super::protocol::WorkerMessage;
use super::signals::TerminationReason;
use crate::error::{HirelingError, Result};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, trace, warn};

/// State shared between the leader, its jobs and the supervisor tasks.
#[derive(Debug)]
pub(crate) struct Shared {
    pool: Mutex<Pool>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Pool> {
        // Pool methods never panic midway through an update, so a poisoned
        // lock still guards consistent state.
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Configured maximum number of workers.
    pub concurrency: usize,
    /// Live worker processes.
    pub workers: usize,
    /// Workers currently running a job.
    pub busy: usize,
    /// Jobs waiting for a free worker.
    pub backlog: usize,
    /// Jobs not yet terminal (queued, waiting for assignment, or running).
    pub active_jobs: usize,
    /// Worker processes spawned over the leader's lifetime.
    pub spawned: usize,
    /// Jobs that reached a terminal state.
    pub finished: usize,
}

/// Pool state. Only ever touched through [`Shared::lock`].
#[derive(Debug)]
pub(crate) struct Pool {
    config: Arc<LeaderConfig>,
    me: Weak<Shared>,
    hirelings: HashMap<u32, HirelingProcess>,
    /// Enqueued jobs whose first assignment attempt has not run yet.
    incoming: VecDeque<Arc<JobCore>>,
    backlog: VecDeque<Arc<JobCore>>,
    next_job_id: u64,
    next_serial: u64,
    active: usize,
    spawned: usize,
    finished: usize,
    idle: watch::Sender<bool>,
}

impl Pool {
    fn new(config: Arc<LeaderConfig>, me: Weak<Shared>, idle: watch::Sender<bool>) -> Self {
        Self {
            config,
            me,
            hirelings: HashMap::new(),
            incoming: VecDeque::new(),
            backlog: VecDeque::new(),
            next_job_id: 0,
            next_serial: 0,
            active: 0,
            spawned: 0,
            finished: 0,
            idle,
        }
    }

    fn create_job(&mut self, payload: Value) -> (Arc<JobCore>, mpsc::UnboundedReceiver<JobEvent>) {
        self.next_job_id += 1;
        let (job, events) = JobCore::new(JobId::new(self.next_job_id), payload);
        self.active += 1;
        self.incoming.push_back(job.clone());
        self.publish_idle();
        (job, events)
    }

    /// Run the first assignment attempt for every freshly enqueued job, in
    /// enqueue order.
    fn assign_incoming(&mut self) {
        while let Some(job) = self.incoming.pop_front() {
            self.assign(job);
        }
    }

    /// Hand a job to an idle worker, or queue it if the pool is saturated.
    fn assign(&mut self, job: Arc<JobCore>) {
        if job.is_done() {
            trace!(job_id = job.id().get(), "Skipping finished job");
            return;
        }
        match self.find_idle() {
            Ok(Some(pid)) => self.hand_over(pid, job),
            Ok(None) => {
                self.backlog.push_back(job);
                debug!(backlog = self.backlog.len(), "All hirelings busy, job backlogged");
            }
            Err(e) => self.fail_unassignable(&job, e),
        }
    }

    /// Find an idle worker, spawning one if the pool has room.
    ///
    /// Returns `None` when every worker is busy and the pool is full.
    fn find_idle(&mut self) -> Result<Option<u32>> {
        if let Some(hireling) = self.hirelings.values().find(|h| !h.is_busy()) {
            return Ok(Some(hireling.pid()));
        }
        if self.hirelings.len() >= self.config.concurrency {
            return Ok(None);
        }

        self.next_serial += 1;
        let hireling = HirelingProcess::spawn(&self.config, self.next_serial, self.me.clone())?;
        let pid = hireling.pid();
        self.spawned += 1;

        if let Some(mut stale) = self.hirelings.insert(pid, hireling) {
            // The old process was reaped but its exit is still in flight.
            warn!(pid, "Recycled pid replaced a stale hireling");
            if let Some(job) = stale.release() {
                job.unassign();
                let reason = FailureReason::Exit(TerminationReason::Unknown);
                self.settle(&job, JobEvent::Failure(reason));
            }
        }

        debug!(pid, workers = self.hirelings.len(), "Pool grew");
        Ok(Some(pid))
    }

    fn hand_over(&mut self, pid: u32, job: Arc<JobCore>) {
        let accepted = match self.hirelings.get_mut(&pid) {
            Some(hireling) => hireling.accept_job(job.clone()),
            None => Err(HirelingError::Protocol(format!("hireling {} is gone", pid))),
        };
        if let Err(e) = accepted {
            error!(pid, job_id = job.id().get(), error = %e, "Failed to hand over job");
            self.fail_unassignable(&job, e);
        }
    }

    fn fail_unassignable(&mut self, job: &JobCore, err: HirelingError) {
        warn!(job_id = job.id().get(), error = %err, "Job could not be assigned");
        self.settle(job, JobEvent::Failure(FailureReason::Unassignable(err.to_string())));
        self.publish_idle();
    }

    /// Deliver an event, keeping the job counters in step with terminal
    /// transitions. Returns whether the event was delivered.
    fn settle(&mut self, job: &JobCore, event: JobEvent) -> bool {
        let terminal = event.is_terminal();
        let name = event.name();
        if !job.emit(event) {
            trace!(job_id = job.id().get(), event = name, "Dropped event for finished job");
            return false;
        }
        if terminal {
            self.active -= 1;
            self.finished += 1;
            debug!(job_id = job.id().get(), outcome = name, "Job finished");
        }
        true
    }

    /// Route a worker message to the job that worker is running.
    pub(crate) fn on_message(&mut self, pid: u32, serial: u64, message: WorkerMessage) {
        let job = match self.hirelings.get(&pid) {
            Some(hireling) if hireling.serial() == serial => hireling.job().cloned(),
            _ => None,
        };
        let Some(job) = job else {
            trace!(pid, op = message.op(), "Dropping message from idle hireling");
            return;
        };

        let event = JobEvent::from(message);
        let terminal = event.is_terminal();
        let faulted = matches!(event, JobEvent::Error(_));
        if !self.settle(&job, event) || !terminal {
            return;
        }
        if faulted {
            // A worker that reported an error exits next; never reuse it.
            debug!(pid, job_id = job.id().get(), "Retiring hireling after error");
            self.terminate(pid);
        }
        self.on_job_done(&job);
    }

    /// Free the worker a finished job ran on and feed it the next backlog
    /// entry.
    fn on_job_done(&mut self, job: &JobCore) {
        if let Some(pid) = job.unassign()
            && let Some(hireling) = self.hirelings.get_mut(&pid)
            && hireling.job().is_some_and(|current| current.id() == job.id())
        {
            hireling.release();
        }
        self.drain_backlog();
        self.publish_idle();
    }

    /// Assign the oldest live backlog entry, if a worker can take it.
    fn drain_backlog(&mut self) {
        while let Some(job) = self.backlog.pop_front() {
            if job.is_done() {
                continue;
            }
            match self.find_idle() {
                Ok(Some(pid)) => {
                    self.hand_over(pid, job);
                    return;
                }
                Ok(None) => {
                    self.backlog.push_front(job);
                    return;
                }
                Err(e) => self.fail_unassignable(&job, e),
            }
        }
    }

    /// React to a worker process ending, however it ended.
    pub(crate) fn on_worker_exit(&mut self, pid: u32, serial: u64, reason: FailureReason) {
        match self.hirelings.get(&pid) {
            Some(hireling) if hireling.serial() == serial => {}
            // Already reconciled by terminate().
            _ => return,
        }
        if let Some(mut hireling) = self.hirelings.remove(&pid) {
            let jobs = hireling.jobs_accepted();
            if hireling.is_busy() {
                warn!(pid, jobs, reason = %reason, "Hireling exited while running a job");
            } else {
                debug!(pid, jobs, reason = %reason, "Idle hireling exited");
            }
            // A worker that already served a job and dies before
            // acknowledging the next one never ran it: put it back.
            if jobs > 1
                && hireling.job().is_some_and(|job| !job.is_started())
                && let Some(job) = hireling.release()
            {
                job.unassign();
                let job_id = job.id().get();
                info!(pid, job_id, "Requeueing job the hireling never started");
                self.backlog.push_front(job);
                self.drain_backlog();
            }
            self.retire(hireling, reason);
        }
    }

    /// Kill a worker and reconcile as if it had exited on its own.
    fn terminate(&mut self, pid: u32) {
        if let Some(mut hireling) = self.hirelings.remove(&pid) {
            hireling.kill();
            self.retire(hireling, FailureReason::Killed);
        }
    }

    /// Settle the job of a worker that left the pool. No respawn happens
    /// here; the pool only grows again when a job needs a worker.
    fn retire(&mut self, mut hireling: HirelingProcess, reason: FailureReason) {
        if let Some(job) = hireling.release() {
            job.unassign();
            if self.settle(&job, JobEvent::Failure(reason)) {
                self.drain_backlog();
            }
        }
        self.publish_idle();
    }

    pub(crate) fn abort(&mut self, job: &Arc<JobCore>) {
        if !self.settle(job, JobEvent::Abort) {
            return;
        }
        let id = job.id();
        self.incoming.retain(|queued| queued.id() != id);
        self.backlog.retain(|queued| queued.id() != id);

        if let Some(pid) = job.hireling() {
            // No cooperative cancellation: the worker goes down with the job.
            self.terminate(pid);
        }
        self.on_job_done(job);
    }

    fn shutdown(&mut self) {
        let queued: Vec<_> = self.incoming.drain(..).chain(self.backlog.drain(..)).collect();
        for job in &queued {
            self.settle(job, JobEvent::Failure(FailureReason::Shutdown));
        }

        let pids: Vec<u32> = self.hirelings.keys().copied().collect();
        if !pids.is_empty() || !queued.is_empty() {
            info!(
                workers = pids.len(),
                dropped_jobs = queued.len(),
                "Shutting down hireling pool"
            );
        }
        for pid in pids {
            self.terminate(pid);
        }
        self.publish_idle();
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            concurrency: self.config.concurrency,
            workers: self.hirelings.len(),
            busy: self.hirelings.values().filter(|h| h.is_busy()).count(),
            backlog: self.backlog.len(),
            active_jobs: self.active,
            spawned: self.spawned,
            finished: self.finished,
        }
    }

    fn publish_idle(&self) {
        let idle = self.active == 0;
        let changed = self.idle.send_if_modified(|current| {
            let changed = *current != idle;
            *current = idle;
            changed
        });
        if changed && idle {
            debug!(workers = self.hirelings.len(), "Pool drained");
        }
    }
}

/// Dispatches jobs to a bounded pool of worker processes.
///
/// Workers are spawned on demand up to `concurrency`; jobs beyond that wait
/// in a FIFO backlog. Dropping the leader shuts the pool down.
#[derive(Debug)]
pub struct Leader {
    shared: Arc<Shared>,
    config: Arc<LeaderConfig>,
    idle: watch::Receiver<bool>,
}

impl Leader {
    /// Create a leader. No worker is spawned until a job needs one.
    pub fn new(config: LeaderConfig) -> Result<Self> {
        config.validate()?;

        info!(
            concurrency = config.concurrency,
            program = %config.program.display(),
            "Initializing hireling pool"
        );

        let config = Arc::new(config);
        let (idle_tx, idle) = watch::channel(true);
        let shared = Arc::new_cyclic(|me| Shared {
            pool: Mutex::new(Pool::new(config.clone(), me.clone(), idle_tx)),
        });

        Ok(Self {
            shared,
            config,
            idle,
        })
    }

    pub fn config(&self) -> &LeaderConfig {
        &self.config
    }

    /// Submit a job.
    ///
    /// Returns at once. The job is assigned by a separate task, so events
    /// can only start flowing after this call returns; a failure to start a
    /// worker shows up as a `Failure` event on the job.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[instrument(level = "trace", skip(self, payload))]
    pub fn enqueue(&self, payload: Value) -> Job {
        let (job, events) = self.shared.lock().create_job(payload);
        trace!(job_id = job.id().get(), "Job enqueued");

        let leader = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            if let Some(shared) = leader.upgrade() {
                shared.lock().assign_incoming();
            }
        });

        Job::new(job, events, Arc::downgrade(&self.shared))
    }

    /// Kill every worker.
    ///
    /// Running jobs fail with [`FailureReason::Killed`], queued jobs with
    /// [`FailureReason::Shutdown`]. Safe to call repeatedly or on an empty
    /// pool; the leader stays usable and will spawn new workers for new jobs.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown();
    }

    /// A cloneable hook for wiring shutdown into signal handling.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.lock().stats()
    }

    /// PIDs of the live workers.
    pub fn worker_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.shared.lock().hirelings.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Ids of the backlogged jobs, oldest first.
    pub fn backlog(&self) -> Vec<JobId> {
        self.shared.lock().backlog.iter().map(|job| job.id()).collect()
    }

    /// Whether no job is queued or running.
    pub fn is_drained(&self) -> bool {
        *self.idle.borrow()
    }

    /// Wait until every submitted job has reached a terminal state.
    pub async fn drained(&self) {
        let mut idle = self.idle.clone();
        let _ = idle.wait_for(|idle| *idle).await;
    }
}

impl Drop for Leader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Shuts a leader's pool down from elsewhere, e.g. a signal handler.
///
/// Does nothing once the leader is gone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shared: Weak<Shared>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.lock().shutdown();
        }
    }
}
