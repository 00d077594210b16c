//! Leader configuration.

use crate::error::{HirelingError, Result};
use serde_json::Value;
use std::ffi::OsString;
use std::path::PathBuf;

/// Environment variable the leader sets on every worker it spawns.
pub const LEADER_PID_ENV: &str = "HIRELINGS_LEADER_PID";

/// Environment variable some supervisors use to tag a worker's identity.
pub const WORKER_ID_ENV: &str = "HIRELINGS_WORKER_ID";

/// Worker-identity variables never inherited from the parent environment.
///
/// A leader that itself runs as somebody else's worker must not hand its
/// own identity down, or its children would believe they belong to the
/// outer supervisor.
pub const STRIPPED_ENV: &[&str] = &[LEADER_PID_ENV, WORKER_ID_ENV];

/// Default concurrency: a quarter more workers than CPUs, to cover the time
/// workers spend blocked on I/O.
pub fn default_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cpus * 5).div_ceil(4).max(1)
}

/// Configuration for a [`Leader`](super::Leader).
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Maximum number of simultaneous worker processes.
    pub concurrency: usize,
    /// Worker program to spawn.
    pub program: PathBuf,
    /// Arguments passed to the worker program.
    pub args: Vec<OsString>,
    /// Opaque init payload sent to every worker after spawn.
    pub options: Value,
    /// Extra variables removed from the worker environment.
    pub strip_env: Vec<String>,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            program: PathBuf::new(),
            args: Vec::new(),
            options: Value::Object(Default::default()),
            strip_env: Vec::new(),
        }
    }
}

impl LeaderConfig {
    /// Create a configuration for the given worker program.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Run workers by re-executing the current binary with `args`.
    pub fn current_exe<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe).with_args(args))
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// Strip an additional variable from the worker environment.
    pub fn strip_env(mut self, name: impl Into<String>) -> Self {
        self.strip_env.push(name.into());
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(HirelingError::Config(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.program.as_os_str().is_empty() {
            return Err(HirelingError::Config("worker program is not set".into()));
        }
        Ok(())
    }

    /// Whether `name` must not be inherited by workers.
    pub(crate) fn is_stripped(&self, name: &str) -> bool {
        STRIPPED_ENV.contains(&name) || self.strip_env.iter().any(|s| s == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_concurrency_is_positive() {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let concurrency = default_concurrency();
        assert!(concurrency >= cpus);
        assert!(concurrency <= cpus * 2);
    }

    #[test]
    fn test_builder() {
        let config = LeaderConfig::new("/usr/bin/worker")
            .with_concurrency(4)
            .with_args(["worker", "echo"])
            .with_options(json!({"thing": "ohai"}))
            .strip_env("OUTER_WORKER_SLOT");

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.args, vec![OsString::from("worker"), OsString::from("echo")]);
        assert_eq!(config.options, json!({"thing": "ohai"}));
        assert!(config.is_stripped("OUTER_WORKER_SLOT"));
        assert!(config.is_stripped(LEADER_PID_ENV));
        assert!(!config.is_stripped("PATH"));
    }

    #[test]
    fn test_validate() {
        assert!(LeaderConfig::new("worker").validate().is_ok());

        let err = LeaderConfig::new("worker")
            .with_concurrency(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("concurrency"));

        let err = LeaderConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("program"));
    }
}
