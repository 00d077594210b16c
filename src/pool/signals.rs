//! Exit analysis for worker subprocesses.
//!
//! Turns a process exit status into a reason that can be reported on the
//! job the worker was running.

use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Exit status could not be determined.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {}", sig.as_str()),
            Self::Unknown => "exited for an unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze an `ExitStatus` to determine the termination reason.
pub fn analyze_exit_status(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }
    status
        .signal()
        .and_then(|raw| Signal::try_from(raw).ok())
        .map(TerminationReason::Signaled)
        .unwrap_or(TerminationReason::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_reason_success() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Exited(1).is_success());
        assert!(!TerminationReason::Signaled(Signal::SIGKILL).is_success());
    }

    #[test]
    fn test_analyze_exit_code() {
        // Raw wait status: exit code lives in the second byte.
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(analyze_exit_status(status), TerminationReason::Exited(3));
    }

    #[test]
    fn test_analyze_signal() {
        let status = ExitStatus::from_raw(Signal::SIGKILL as i32);
        assert_eq!(
            analyze_exit_status(status),
            TerminationReason::Signaled(Signal::SIGKILL)
        );
    }

    #[test]
    fn test_description() {
        assert_eq!(
            TerminationReason::Signaled(Signal::SIGTERM).to_string(),
            "killed by signal SIGTERM"
        );
        assert_eq!(
            TerminationReason::Exited(2).to_string(),
            "exited with code 2"
        );
    }
}
