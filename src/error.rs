//! Error types for hirelings.

use crate::pool::JobId;
use thiserror::Error;

/// Main error type for hirelings.
#[derive(Error, Debug)]
pub enum HirelingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Hireling {pid} already has a job ({job})")]
    AlreadyBusy { pid: u32, job: JobId },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Job already reported {0}")]
    AlreadyReported(&'static str),

    #[error("Worker fault: {0}")]
    Fault(String),
}

/// Result type alias for hirelings operations.
pub type Result<T> = std::result::Result<T, HirelingError>;
