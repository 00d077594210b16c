//! Integration tests for the hirelings CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::io::Write;
use tempfile::NamedTempFile;

const BIN: &str = env!("CARGO_BIN_EXE_hirelings");

/// Get a command for the hirelings binary.
fn hirelings() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("hirelings").unwrap();
    cmd.env_remove("HIRELINGS_CONCURRENCY")
        .env_remove("HIRELINGS_LOG")
        .env_remove("RUST_LOG");
    cmd
}

fn events(stdout: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_help() {
    hirelings()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("worker processes"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn test_run_from_file() {
    let mut input = NamedTempFile::new().unwrap();
    writeln!(input, r#"{{"whatsit":"orly"}}"#).unwrap();
    writeln!(input).unwrap();
    writeln!(input, r#"{{"whatsit":"yarly"}}"#).unwrap();

    let output = hirelings()
        .args(["run", "-c", "2", "--options", r#"{"thing":"ohai"}"#, "--input"])
        .arg(input.path())
        .args(["--", BIN, "worker", "echo"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let events = events(&output);
    let successes: Vec<&Value> = events.iter().filter(|e| e["event"] == "success").collect();
    assert_eq!(successes.len(), 2);
    for success in &successes {
        assert_eq!(success["data"]["options"]["thing"], "ohai");
    }
    assert_eq!(events.iter().filter(|e| e["event"] == "start").count(), 2);
    assert_eq!(events.iter().filter(|e| e["event"] == "progress").count(), 6);

    // Each job's events arrive in order.
    let first: Vec<&str> = events
        .iter()
        .filter(|e| e["job"] == 1)
        .map(|e| e["event"].as_str().unwrap())
        .collect();
    assert_eq!(first, vec!["start", "progress", "progress", "progress", "success"]);
}

#[test]
fn test_run_reports_failures() {
    hirelings()
        .args(["run", "--", BIN, "worker", "echo"])
        .write_stdin("{\"cause_failure\":true}\n{\"whatsit\":\"orly\"}\n")
        .assert()
        .failure()
        .stdout(predicate::str::contains("THIS IS A FAILURE"))
        .stdout(predicate::str::contains(r#""event":"success""#))
        .stderr(predicate::str::contains("1 of 2 jobs did not succeed"));
}

#[test]
fn test_run_reports_errors() {
    hirelings()
        .args(["run", "--", BIN, "worker", "echo"])
        .write_stdin("{\"cause_error\":true}\n")
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""event":"error""#))
        .stdout(predicate::str::contains("THIS IS AN ERROR"));
}

#[test]
fn test_run_without_jobs() {
    hirelings()
        .args(["run", "--", BIN, "worker", "echo"])
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_run_rejects_bad_job() {
    hirelings()
        .args(["run", "--", BIN, "worker", "echo"])
        .write_stdin("{\"ok\":1}\nnot json\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid job on line 2"));
}

#[test]
fn test_run_missing_worker_program() {
    hirelings()
        .args(["run", "--", "/definitely/not/a/worker"])
        .write_stdin("{}\n")
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""event":"failure""#))
        .stdout(predicate::str::contains("unassignable"));
}

#[test]
fn test_run_rejects_zero_concurrency() {
    hirelings()
        .env("HIRELINGS_CONCURRENCY", "0")
        .args(["run", "--", BIN, "worker", "echo"])
        .write_stdin("{}\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("concurrency must be at least 1"));
}

#[test]
fn test_worker_speaks_protocol() {
    hirelings()
        .args(["worker", "echo"])
        .write_stdin(concat!(
            "{\"op\":\"init\",\"data\":{\"thing\":\"ohai\"}}\n",
            "{\"op\":\"job\",\"data\":{\"whatsit\":\"orly\"}}\n",
        ))
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"{"op":"start"}"#))
        .stdout(predicate::str::contains(r#"{"op":"progress","data":3}"#))
        .stdout(predicate::str::contains(
            r#"{"op":"success","data":{"job":{"whatsit":"orly"},"options":{"thing":"ohai"}}}"#,
        ));
}

#[test]
fn test_worker_exits_nonzero_on_error() {
    hirelings()
        .args(["worker", "echo"])
        .write_stdin(concat!(
            "{\"op\":\"init\",\"data\":{}}\n",
            "{\"op\":\"job\",\"data\":{\"cause_error\":true}}\n",
        ))
        .assert()
        .code(1)
        .stdout(predicate::str::contains(r#"{"op":"error","data":"THIS IS AN ERROR"}"#));
}

#[test]
fn test_completions() {
    hirelings()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hirelings"));
}
