//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn info_prints_provider_identity() {
    let mut cmd = cargo_bin_cmd!("fly-provider");
    cmd.arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"fly-provider\""));
}

#[test]
fn missing_subcommand_prints_usage() {
    let mut cmd = cargo_bin_cmd!("fly-provider");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn create_without_network_key_reports_configuration_error() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let mut cmd = cargo_bin_cmd!("fly-provider");
    cmd.current_dir(tmp.path())
        .env("HOME", tmp.path())
        .env("XDG_CONFIG_HOME", tmp.path())
        .env("FLY_PROVIDER_NETWORK_KEY", "")
        .env("FLY_PROVIDER_CONTROL_URL", "https://control.example.test")
        .env_remove("FLY_PROVIDER_CONFIG_PATH")
        .args(["create", "--target-id", "t1", "--name", "ws", "--image", "alpine:3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("FLY_PROVIDER_NETWORK_KEY"));
}

#[test]
fn malformed_env_pair_is_rejected() {
    let mut cmd = cargo_bin_cmd!("fly-provider");
    cmd.args(["start", "--target-id", "t1", "--name", "ws", "--env", "NOVALUE"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected KEY=VALUE"));
}

#[test]
fn create_without_image_is_a_usage_error() {
    let mut cmd = cargo_bin_cmd!("fly-provider");
    cmd.args(["create", "--target-id", "t1", "--name", "ws"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--image"));
}
