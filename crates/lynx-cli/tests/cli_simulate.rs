#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::Value;
use std::io::Write;
use std::process::Command;

fn lynx() -> Command {
    Command::new(env!("CARGO_BIN_EXE_lynx"))
}

fn fast_config() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[fleet]
tick_interval_ms = 10
default_max_attempts = 3

[fleet.retry]
backoff_base_ms = 5
backoff_max_ms = 20
"#
    )
    .unwrap();
    file
}

fn run_simulate(config: &tempfile::NamedTempFile, extra: &[&str]) -> Value {
    let output = lynx()
        .arg("--config")
        .arg(config.path())
        .arg("simulate")
        .args(["--work-ms", "2"])
        .args(extra)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "simulate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_simulate_drains_workload() {
    let config = fast_config();
    let report = run_simulate(&config, &["--tasks", "40", "--agents", "4"]);

    let snapshot = &report["snapshot"];
    assert_eq!(snapshot["completed"], 40);
    assert_eq!(snapshot["failed"], 0);
    assert_eq!(snapshot["queue_depth"], 0);
    assert_eq!(snapshot["total_load"], 0);
    assert_eq!(snapshot["total_agents"], 4);
    assert_eq!(report["executions"], 40);

    let completed: u64 = report["agents"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["tasks_completed"].as_u64().unwrap())
        .sum();
    assert_eq!(completed, 40);
}

#[test]
fn test_simulate_with_failures_retries() {
    let config = fast_config();
    let report = run_simulate(
        &config,
        &["--tasks", "20", "--agents", "2", "--fail-every", "4"],
    );

    let snapshot = &report["snapshot"];
    let finished = snapshot["completed"].as_u64().unwrap() + snapshot["failed"].as_u64().unwrap();
    assert_eq!(finished, 20);
    // every fourth attempt fails, so some tasks needed a second attempt
    assert!(report["executions"].as_u64().unwrap() > 20);
    assert!(snapshot["average_success_rate"].as_f64().unwrap() < 1.0);
}

#[test]
fn test_agents_from_config_file() {
    let mut file = fast_config();
    writeln!(
        file,
        r#"
[[agents]]
name = "only-db"
capabilities = ["database"]
max_concurrency = 3
"#
    )
    .unwrap();
    let report = run_simulate(&file, &["--tasks", "6", "--capabilities", "database"]);

    let agents = report["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["name"], "only-db");
    assert_eq!(agents[0]["tasks_completed"], 6);
}

#[test]
fn test_explicit_missing_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = lynx()
        .arg("--config")
        .arg(dir.path().join("nope.toml"))
        .args(["simulate", "--tasks", "1"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope.toml"));
}

#[test]
fn test_invalid_config_is_an_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[fleet]\nglobal_concurrency_cap = 0").unwrap();
    let output = lynx()
        .arg("--config")
        .arg(file.path())
        .args(["simulate", "--tasks", "1"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}
