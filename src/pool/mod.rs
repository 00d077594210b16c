//! Bounded pool of worker processes.
//!
//! A [`Leader`] spawns worker processes on demand, up to its concurrency
//! limit, and hands each one job at a time. Jobs that find every worker
//! busy wait in a FIFO backlog. Each job reports back as a stream of
//! [`JobEvent`]s ending in exactly one terminal event.
//!
//! # Architecture
//!
//! ```text
//!                  ┌───────────────────────────┐
//!   enqueue() ───► │          Leader           │ ───► Job (event stream)
//!                  │ backlog · pid → hireling  │
//!                  └─────────────┬─────────────┘
//!                                │ JSON lines over stdin/stdout
//!               ┌────────────────┼────────────────┐
//!               │                │                │
//!         ┌─────▼─────┐    ┌─────▼─────┐    ┌─────▼─────┐
//!         │ Hireling  │    │ Hireling  │    │ Hireling  │
//!         │ (process) │    │ (process) │    │ (process) │
//!         └───────────┘    └───────────┘    └───────────┘
//! ```
//!
//! # Behavior
//!
//! - **Lazy growth**: workers are only spawned when a job needs one
//! - **Process isolation**: a crashing job takes down its worker, not the leader
//! - **No respawn**: a lost worker is not replaced until the next job asks for one
//! - **Abort by kill**: aborting a running job kills its worker
//!
//! ```no_run
//! use hirelings::pool::{JobEvent, Leader, LeaderConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> hirelings::Result<()> {
//! let config = LeaderConfig::current_exe(["worker", "echo"])?.with_concurrency(4);
//! let leader = Leader::new(config)?;
//!
//! let job = leader.enqueue(json!({"whatsit": "orly"}));
//! if let JobEvent::Success(data) = job.outcome().await {
//!     println!("{}", data);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod hireling;
mod ipc;
mod job;
mod leader;
mod proc;
mod protocol;
mod signals;
mod spawn;

pub use config::{LEADER_PID_ENV, LeaderConfig, STRIPPED_ENV, WORKER_ID_ENV, default_concurrency};
pub use hireling::{Hireling, HirelingState, Reporter, Work};
pub use ipc::{LineReader, LineWriter, PipeFd};
pub use job::{FailureReason, Job, JobEvent, JobHandle, JobId};
pub use leader::{Leader, PoolStats, ShutdownHandle};
pub use protocol::{LeaderMessage, WorkerMessage};
pub use signals::TerminationReason;
pub use spawn::worker_env;
