//! Integration tests for the appool CLI surface.

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a command for the appool binary.
fn appool() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("appool").unwrap()
}

#[test]
fn config_root_prints_a_path() {
    appool()
        .args(["config", "--root"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^/.+\n$").unwrap());
}

#[test]
fn config_version_prints_the_version() {
    appool()
        .args(["config", "--version"])
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn bare_config_shows_help_and_fails() {
    appool()
        .arg("config")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("--root"));
}

#[test]
fn unknown_config_flag_prints_help_and_exits_one() {
    appool()
        .args(["config", "--frobnicate"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("--root"))
        .stdout(predicate::str::contains("--version"));
}

#[test]
fn serve_requires_a_spawn_server() {
    appool()
        .arg("serve")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--spawn-server"));
}

#[test]
fn serve_reports_a_missing_spawn_server_program() {
    appool()
        .args([
            "serve",
            "--socket",
            "/tmp/appool-test-nonexistent/pool.sock",
            "--spawn-server",
            "/nonexistent/appool-spawn-server",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("spawn server"));
}

#[test]
fn version_flag_works() {
    appool()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}
