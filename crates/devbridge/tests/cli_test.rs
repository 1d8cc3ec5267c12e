//! Integration tests for the `devbridge` binary.
//!
//! Everything here runs without a live broker: argument parsing, config
//! validation, topic listing, and connection failure handling.
#![allow(clippy::unwrap_used)]

use std::io::Write;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a [`Command`] for the binary with env isolation.
fn devbridge_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("devbridge");
    cmd.env("HOME", "/tmp/devbridge-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/devbridge-cli-test-nonexistent")
        .env("NO_COLOR", "1")
        .env_remove("DEVBRIDGE_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

const VALID: &str = r#"
instance_id = "hue"
base_topic = "home"

[broker]
host = "127.0.0.1"
port = 1
max_connect_attempts = 1
backoff_initial_ms = 10
backoff_max_ms = 10

[[devices]]
id = "lamp"
name = "Lamp"

[devices.fields.power]
type = "bool"
writable = true

[devices.fields.brightness]
type = "int"
writable = true
min = 0
max = 100

[[devices]]
id = "thermo"
enabled = false

[devices.fields.temperature]
type = "float"
unit = "°C"
"#;

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn no_args_shows_help() {
    let output = devbridge_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let text = String::from_utf8_lossy(&output.stderr);
    assert!(text.contains("Usage"), "Expected 'Usage' in:\n{text}");
}

#[test]
fn help_lists_subcommands() {
    devbridge_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("run")
            .and(predicate::str::contains("check"))
            .and(predicate::str::contains("send")),
    );
}

#[test]
fn version_flag() {
    devbridge_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("devbridge"));
}

#[test]
fn completions_zsh() {
    devbridge_cmd()
        .args(["completions", "zsh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#compdef"));
}

// ── check ───────────────────────────────────────────────────────────

#[test]
fn check_prints_topics() {
    let file = config_file(VALID);
    devbridge_cmd()
        .arg("--config")
        .arg(file.path())
        .arg("check")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("home/v1/instances/hue/devices/lamp/state")
                .and(predicate::str::contains("home/v1/instances/hue/devices/+/cmd"))
                .and(predicate::str::contains("homeassistant/light/hue_lamp/light/config"))
                .and(predicate::str::contains("[disabled]"))
                .and(predicate::str::contains("configuration OK: 2 device(s)")),
        );
}

#[test]
fn check_json_output() {
    let file = config_file(VALID);
    let output = devbridge_cmd()
        .arg("--config")
        .arg(file.path())
        .args(["--output", "json", "check"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["instance"], "hue");
    assert_eq!(report["availability_topic"], "home/v1/instances/hue/status");
    assert_eq!(report["devices"][1]["enabled"], false);
    assert_eq!(
        report["devices"][1]["discovery"][0],
        "homeassistant/sensor/hue_thermo/sensor/config"
    );
}

#[test]
fn check_rejects_invalid_config() {
    let file = config_file(
        r#"
        instance_id = "hue"
        [[devices]]
        id = "lamp"
        [[devices]]
        id = "lamp"
        "#,
    );
    devbridge_cmd()
        .arg("--config")
        .arg(file.path())
        .arg("check")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("duplicate device"));
}

#[test]
fn check_missing_config_file() {
    devbridge_cmd()
        .args(["--config", "/tmp/devbridge-cli-test-nonexistent/none.toml", "check"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("not found"));
}

// ── send ────────────────────────────────────────────────────────────

#[test]
fn send_rejects_malformed_values() {
    devbridge_cmd()
        .args(["send", "lamp", "power"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("FIELD=VALUE"));
}

#[test]
fn send_requires_values() {
    devbridge_cmd().args(["send", "lamp"]).assert().code(2);
}

#[test]
fn send_reports_unreachable_broker() {
    let file = config_file(VALID);
    devbridge_cmd()
        .arg("--config")
        .arg(file.path())
        .args(["send", "lamp", "power=true"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .code(7)
        .stderr(predicate::str::contains("connect"));
}
