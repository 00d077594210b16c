//! IPC protocol for leader/worker communication.
//!
//! Messages are JSON objects tagged by `op`, serialized one per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message from the leader to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum LeaderMessage {
    /// Worker configuration, sent once right after spawn.
    #[serde(rename = "init")]
    Init {
        #[serde(default)]
        data: Value,
    },

    /// A job payload to execute.
    #[serde(rename = "job")]
    Job {
        #[serde(default)]
        data: Value,
    },
}

/// Message from a worker to the leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum WorkerMessage {
    /// Job received, execution begins.
    #[serde(rename = "start")]
    Start,

    /// Intermediate progress report.
    #[serde(rename = "progress")]
    Progress {
        #[serde(default)]
        data: Value,
    },

    /// Job finished successfully.
    #[serde(rename = "success")]
    Success {
        #[serde(default)]
        data: Value,
    },

    /// Job failed gracefully.
    #[serde(rename = "failure")]
    Failure {
        #[serde(default)]
        data: Value,
    },

    /// Uncaught fault in worker code; the process exits right after.
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        data: Value,
    },
}

impl LeaderMessage {
    /// Create an init message.
    pub fn init(data: Value) -> Self {
        Self::Init { data }
    }

    /// Create a job message.
    pub fn job(data: Value) -> Self {
        Self::Job { data }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

impl WorkerMessage {
    pub fn progress(data: Value) -> Self {
        Self::Progress { data }
    }

    pub fn success(data: Value) -> Self {
        Self::Success { data }
    }

    pub fn failure(data: Value) -> Self {
        Self::Failure { data }
    }

    pub fn error(data: Value) -> Self {
        Self::Error { data }
    }

    /// The `op` tag this message travels under.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Progress { .. } => "progress",
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this message ends the job it belongs to.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success { .. } | Self::Failure { .. } | Self::Error { .. }
        )
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_leader_message_wire_format() {
        let line = LeaderMessage::init(json!({"thing": "ohai"})).to_line().unwrap();
        assert!(line.ends_with('\n'));

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value, json!({"op": "init", "data": {"thing": "ohai"}}));
    }

    #[test]
    fn test_leader_message_parse_job() {
        let parsed = LeaderMessage::from_line(r#"{"op":"job","data":{"delay":5}}"#).unwrap();
        assert_eq!(parsed, LeaderMessage::job(json!({"delay": 5})));
    }

    #[test]
    fn test_start_has_no_data() {
        let line = WorkerMessage::Start.to_line().unwrap();
        assert_eq!(line, "{\"op\":\"start\"}\n");
    }

    #[test]
    fn test_missing_data_defaults_to_null() {
        let parsed = WorkerMessage::from_line(r#"{"op":"success"}"#).unwrap();
        assert_eq!(parsed, WorkerMessage::success(Value::Null));
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        assert!(WorkerMessage::from_line(r#"{"op":"ready"}"#).is_err());
        // Leader messages echoed back are not worker messages.
        assert!(WorkerMessage::from_line(r#"{"op":"init","data":{}}"#).is_err());
    }

    #[test]
    fn test_terminal_ops() {
        assert!(!WorkerMessage::Start.is_terminal());
        assert!(!WorkerMessage::progress(json!(1)).is_terminal());
        assert!(WorkerMessage::success(json!("ok")).is_terminal());
        assert!(WorkerMessage::failure(json!("X")).is_terminal());
        assert!(WorkerMessage::error(json!("boom")).is_terminal());
    }

    #[test]
    fn test_op_matches_wire_tag() {
        for msg in [
            WorkerMessage::Start,
            WorkerMessage::progress(json!(3)),
            WorkerMessage::success(json!(null)),
            WorkerMessage::failure(json!("X")),
            WorkerMessage::error(json!("boom")),
        ] {
            let value: Value = serde_json::from_str(&msg.to_line().unwrap()).unwrap();
            assert_eq!(value["op"], msg.op());
        }
    }
}
