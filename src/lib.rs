//! hirelings - bounded-concurrency job dispatch over worker processes
//!
//! The [`pool`] module holds both halves: the [`Leader`](pool::Leader) that
//! queues jobs and supervises workers, and the [`Hireling`](pool::Hireling)
//! loop that worker binaries run. [`workers`] has a few ready-made workers.

pub mod error;
pub mod logging;
pub mod pool;
pub mod workers;

pub use error::{HirelingError, Result};
