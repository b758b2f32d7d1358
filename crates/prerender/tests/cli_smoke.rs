//! CLI smoke tests
//!
//! Runs the `prerender` binary against temp config files and the bundled
//! scenarios:
//! - `config` prints validated defaults as TOML or JSON
//! - invalid or missing config files fail with remediation
//! - `simulate` writes one JSON line per step plus a summary line

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn prerender() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("prerender").expect("prerender binary should be built");
    cmd.env_remove("PRERENDER_CONFIG");
    cmd.env_remove("PRERENDER_LOG_LEVEL");
    cmd.env_remove("RUST_LOG");
    cmd
}

fn scenario(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("scenarios")
        .join(name)
}

fn write_config(dir: &TempDir, text: &str) -> PathBuf {
    let path = dir.path().join("prerender.toml");
    std::fs::write(&path, text).expect("write config");
    path
}

fn json_lines(stdout: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("each stdout line is JSON"))
        .collect()
}

fn simulate(scenario_name: &str, config: &str) -> Vec<Value> {
    let dir = TempDir::new().expect("create temp dir");
    let config = write_config(&dir, config);
    let output = prerender()
        .args(["--log-level", "warn", "simulate"])
        .arg(scenario(scenario_name))
        .arg("--config")
        .arg(&config)
        .output()
        .expect("run prerender");
    assert!(
        output.status.success(),
        "simulate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    json_lines(&output.stdout)
}

// =============================================================================
// config
// =============================================================================

#[test]
fn config_prints_defaults_as_toml() {
    prerender()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[speculation]"))
        .stdout(predicate::str::contains("[memory]"))
        .stdout(predicate::str::contains("budget_percent"));
}

#[test]
fn config_json_reflects_file() {
    let dir = TempDir::new().expect("create temp dir");
    let path = write_config(&dir, "[speculation]\nmax_rule_based_sessions = 3\n");
    let output = prerender()
        .args(["config", "--json", "--config"])
        .arg(&path)
        .output()
        .expect("run prerender");
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).expect("config JSON");
    assert_eq!(value["speculation"]["max_rule_based_sessions"], 3);
    assert_eq!(value["logging"]["level"], "info");
}

#[test]
fn config_from_env_var() {
    let dir = TempDir::new().expect("create temp dir");
    let path = write_config(&dir, "[memory]\nbudget_percent = 12.5\n");
    let output = prerender()
        .env("PRERENDER_CONFIG", &path)
        .args(["config", "--json"])
        .output()
        .expect("run prerender");
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).expect("config JSON");
    assert_eq!(value["memory"]["budget_percent"], 12.5);
}

#[test]
fn invalid_config_shows_remediation() {
    let dir = TempDir::new().expect("create temp dir");
    let path = write_config(&dir, "[memory]\nbudget_percent = 150.0\n");
    prerender()
        .args(["config", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Validation error"))
        .stderr(predicate::str::contains("prerender config"));
}

#[test]
fn missing_config_file_fails() {
    prerender()
        .args(["config", "--config", "/nonexistent/prerender.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

// =============================================================================
// simulate
// =============================================================================

const NO_MEMORY: &str = "[memory]\nenabled = false\n";

#[test]
fn simulate_activation_scenario() {
    let lines = simulate("activation.toml", NO_MEMORY);
    // Eight steps and the summary.
    assert_eq!(lines.len(), 9);

    let redirect = &lines[1];
    assert_eq!(redirect["op"], "redirect");
    assert_eq!(redirect["cancelled"][0]["status"], "cross_origin_redirect");

    let finish = &lines[4];
    assert_eq!(finish["phase"], "ready_for_activation");

    let refused = &lines[5];
    assert_eq!(refused["label"], "comments");
    assert_eq!(refused["rejected"], "quota_exceeded");

    let navigate = &lines[7];
    assert_eq!(navigate["op"], "navigate");
    assert_eq!(navigate["activated_nodes"], 1);
    assert!(navigate.get("candidate_error").is_none());

    let summary = &lines[8];
    assert_eq!(summary["scenario"], "activation");
    assert_eq!(summary["sessions"]["article"]["final_status"], "activated");
    assert_eq!(summary["sessions"]["article"]["outcome"], "success");
    assert_eq!(summary["sessions"]["promo"]["final_status"], "cross_origin_redirect");
    assert!(summary["sessions"].get("comments").is_none());
    assert_eq!(summary["metrics"]["admitted"], 2);
    assert_eq!(summary["metrics"]["rejected"]["quota_exceeded"], 1);
    assert_eq!(summary["metrics"]["activation_matches"], 1);
}

#[test]
fn simulate_background_cancels_immediately_by_default() {
    let lines = simulate("background.toml", NO_MEMORY);
    assert_eq!(lines[1]["op"], "visibility");
    assert_eq!(lines[1]["cancelled"][0]["status"], "trigger_backgrounded");
    let summary = lines.last().expect("summary line");
    assert_eq!(
        summary["sessions"]["omnibox"]["final_status"],
        "trigger_backgrounded"
    );
}

#[test]
fn simulate_background_timeout_with_keep_alive() {
    let lines = simulate(
        "background.toml",
        "[speculation]\nkeep_alive_in_background = true\nbackground_timeout_ms = 1000\n\n[memory]\nenabled = false\n",
    );
    assert!(lines[1].get("cancelled").is_none());
    assert_eq!(lines[2]["op"], "tick");
    assert_eq!(lines[2]["cancelled"][0]["status"], "timeout_backgrounded");
    assert_eq!(lines[3]["candidate_error"]["kind"], "no_match");
}

#[test]
fn simulate_missing_scenario_fails() {
    prerender()
        .args(["simulate", "/nonexistent/scenario.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read scenario"));
}

#[test]
fn simulate_rejects_unknown_step() {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[[step]]\nop = \"explode\"\n").expect("write scenario");
    prerender()
        .arg("simulate")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid scenario"));
}
