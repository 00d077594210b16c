//! Worker subprocess spawning.
//!
//! Workers get piped stdin/stdout for the protocol and inherit stderr, so
//! anything a worker logs shows up in the leader's terminal.

use super::config::{LEADER_PID_ENV, LeaderConfig};
use crate::error::{HirelingError, Result};
use std::ffi::OsString;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Build the environment a worker starts with.
///
/// Starts from `vars` (normally the parent's environment), drops the
/// worker-identity variables and points the child at this leader.
pub fn worker_env<I>(config: &LeaderConfig, vars: I) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: Vec<_> = vars
        .into_iter()
        .filter(|(key, _)| !key.to_str().is_some_and(|k| config.is_stripped(k)))
        .collect();
    env.push((
        LEADER_PID_ENV.into(),
        std::process::id().to_string().into(),
    ));
    env
}

/// Build the command used to start a worker.
pub fn worker_command(config: &LeaderConfig) -> Command {
    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args);

    cmd.env_clear();
    cmd.envs(worker_env(config, std::env::vars_os()));

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    // Backstop for the supervisor task: if it is dropped, so is the worker.
    cmd.kill_on_drop(true);
    cmd
}

/// Spawn a worker subprocess.
///
/// Must be called from within a Tokio runtime.
pub fn spawn_worker(config: &LeaderConfig) -> Result<Child> {
    worker_command(config)
        .spawn()
        .map_err(|source| HirelingError::Spawn {
            program: config.program.display().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::config::WORKER_ID_ENV;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect()
    }

    #[test]
    fn test_worker_env_strips_identity() {
        let config = LeaderConfig::new("worker").strip_env("OUTER_SLOT");
        let env = worker_env(
            &config,
            vars(&[
                ("PATH", "/usr/bin"),
                (WORKER_ID_ENV, "3"),
                (LEADER_PID_ENV, "1"),
                ("OUTER_SLOT", "7"),
            ]),
        );

        let keys: Vec<_> = env.iter().map(|(k, _)| k.to_str().unwrap()).collect();
        assert_eq!(keys, vec!["PATH", LEADER_PID_ENV]);

        let leader_pid = &env[1].1;
        assert_eq!(leader_pid, &OsString::from(std::process::id().to_string()));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let config = LeaderConfig::new("/definitely/not/a/worker");
        let err = spawn_worker(&config).unwrap_err();
        assert!(matches!(err, HirelingError::Spawn { .. }));
        assert!(err.to_string().contains("/definitely/not/a/worker"));
    }
}
