//! Smoke tests of the `lxc-compose` binary that need no container runtime.
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn help_lists_commands() {
    cargo_bin_cmd!("lxc-compose")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("port"))
        .stdout(predicate::str::contains("destroy"));

    cargo_bin_cmd!("lxc-compose")
        .args(["port", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("apply"));
}

#[test]
fn missing_compose_file_fails() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("lxc-compose.yml");

    cargo_bin_cmd!("lxc-compose")
        .args(["up", "--file", file.to_string_lossy().as_ref()])
        .env("LXC_COMPOSE_ROOT", tmp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn invalid_port_is_rejected_before_anything_runs() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("lxc-compose.yml");
    std::fs::write(
        &file,
        "containers:\n  web:\n    port_forwards: [\"8080:99999\"]\n",
    )
    .unwrap();

    cargo_bin_cmd!("lxc-compose")
        .args(["up", "--file", file.to_string_lossy().as_ref()])
        .env("LXC_COMPOSE_ROOT", tmp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid port specification"));

    // Nothing was written to the state directory
    assert!(!tmp.path().join("ip-allocations.json").exists());
}

#[test]
fn unknown_protocol_is_a_usage_error() {
    cargo_bin_cmd!("lxc-compose")
        .args(["port", "remove", "8080", "--protocol", "icmp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown protocol"));
}

#[test]
fn subnet_must_be_a_24() {
    cargo_bin_cmd!("lxc-compose")
        .env("LXC_COMPOSE_SUBNET", "10.0.0.0/16")
        .arg("list")
        .assert()
        .failure();
}
