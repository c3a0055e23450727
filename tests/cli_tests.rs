//! CLI surface tests: argument parsing, status output, exit codes.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn cadre() -> Command {
    cargo_bin_cmd!("cadre")
}

#[test]
fn help_lists_subcommands() {
    cadre()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("prune"));
}

#[test]
fn version_prints() {
    cadre().arg("--version").assert().success();
}

#[test]
fn run_requires_issue_numbers() {
    let dir = TempDir::new().unwrap();
    cadre()
        .current_dir(dir.path())
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("ISSUES"));
}

#[test]
fn run_outside_a_repository_fails_validation_with_exit_2() {
    let dir = TempDir::new().unwrap();
    cadre()
        .current_dir(dir.path())
        .args(["run", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("validation failed"));
}

#[test]
fn status_without_checkpoint_reports_nothing_to_show() {
    let dir = TempDir::new().unwrap();
    cadre()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No fleet checkpoint"));
}

#[test]
fn invalid_backend_in_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join(".cadre")).unwrap();
    std::fs::write(
        dir.path().join(".cadre/cadre.toml"),
        "[agent]\nbackend = \"skynet\"\n",
    )
    .unwrap();
    cadre()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cadre.toml"));
}
