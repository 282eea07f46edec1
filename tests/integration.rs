//! Integration tests for the stampede CLI.
//!
//! Cluster runs are open-ended, so these tests exercise the paths that exit
//! on their own: help/version output and configuration rejection.

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a command for the stampede binary.
fn stampede() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("stampede").unwrap()
}

// ============================================================================
// Help and Version Tests
// ============================================================================

#[test]
fn test_help_displays() {
    stampede()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cluster supervisor"))
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn test_serve_help_lists_cluster_flags() {
    stampede()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--worker-timeout"))
        .stdout(predicate::str::contains("--fork-worker"))
        .stdout(predicate::str::contains("--worker-culling-strategy"));
}

#[test]
fn test_version_displays() {
    stampede()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_unknown_subcommand_fails() {
    stampede().arg("frobnicate").assert().failure();
}

// ============================================================================
// Configuration Rejection Tests
// ============================================================================

#[test]
fn test_zero_workers_rejected() {
    stampede()
        .args(["serve", "--workers", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("workers must be at least 1"));
}

#[test]
fn test_bad_culling_strategy_rejected() {
    stampede()
        .args(["serve", "--worker-culling-strategy", "random"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("culling strategy"));
}

#[test]
fn test_check_interval_must_undercut_timeout() {
    stampede()
        .args([
            "serve",
            "--worker-check-interval",
            "60",
            "--worker-timeout",
            "60",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("worker_check_interval"));
}

#[test]
fn test_config_rejection_with_log_file() {
    // A bad configuration still exits cleanly when file logging is set up.
    let dir = tempfile::tempdir().unwrap();
    stampede()
        .env("STAMPEDE_LOG_FILE", dir.path().join("stampede.log"))
        .args(["serve", "--workers", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("workers must be at least 1"));
}
