//! CLI smoke tests

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_version() {
    Command::cargo_bin("th")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("th")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("node"))
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("broadcast"));
}

#[test]
fn test_exec_without_hub_fails() {
    let temp = TempDir::new().unwrap();
    Command::cargo_bin("th")
        .unwrap()
        .env("XDG_DATA_HOME", temp.path())
        .env("HOME", temp.path())
        .args(["--socket"])
        .arg(temp.path().join("missing.sock"))
        .args(["exec", "SELECT 1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to connect to hub"));
}

#[test]
fn test_broadcast_rejects_bad_json() {
    let temp = TempDir::new().unwrap();
    Command::cargo_bin("th")
        .unwrap()
        .env("XDG_DATA_HOME", temp.path())
        .env("HOME", temp.path())
        .args(["broadcast", "ping", "{not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Payload must be JSON"));
}
