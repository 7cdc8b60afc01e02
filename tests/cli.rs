#![allow(missing_docs)]

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn help_lists_server_options() {
    let output = cargo_bin_cmd!("tserver")
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let help = String::from_utf8_lossy(&output);
    for flag in ["--wal-threshold", "--journal-mode", "--port", "--config"] {
        assert!(help.contains(flag), "missing {flag} in help:\n{help}");
    }
}

#[test]
fn missing_explicit_config_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("absent.toml");
    let output = cargo_bin_cmd!("tserver")
        .env("XDG_CONFIG_HOME", dir.path())
        .arg("--config")
        .arg(&config)
        .arg(dir.path().join("load.db"))
        .assert()
        .failure()
        .get_output()
        .clone();
    let stderr = stderr_of(&output);
    assert!(stderr.starts_with("error: "), "{stderr}");
    assert!(stderr.contains("not found"), "{stderr}");
}

#[test]
fn database_is_required() {
    let dir = TempDir::new().expect("tempdir");
    let output = cargo_bin_cmd!("tserver")
        .env("XDG_CONFIG_HOME", dir.path())
        .env_remove("TSERVER_CONFIG")
        .assert()
        .failure()
        .get_output()
        .clone();
    assert!(stderr_of(&output).contains("no database given"));
}

#[test]
fn malformed_config_is_reported_with_its_path() {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("tserver.toml");
    fs::write(&config, "[checkpoint]\nwal_threshold = \"lots\"\n").expect("write config");
    let output = cargo_bin_cmd!("tserver")
        .env("TSERVER_CONFIG", &config)
        .arg(dir.path().join("load.db"))
        .assert()
        .failure()
        .get_output()
        .clone();
    let stderr = stderr_of(&output);
    assert!(stderr.contains("failed to parse config"), "{stderr}");
    assert!(stderr.contains("tserver.toml"), "{stderr}");
}

#[test]
fn unknown_journal_mode_is_rejected_by_the_parser() {
    cargo_bin_cmd!("tserver")
        .args(["--journal-mode", "memory", "load.db"])
        .assert()
        .code(2);
}
