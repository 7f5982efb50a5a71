//! Binary tests

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_help_lists_options() {
    Command::cargo_bin("kura")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--check-config"));
}

#[test]
fn test_check_config_accepts_valid_file() {
    let file = config_file(
        r#"
storage:
  backend: memory
  wal:
    path: /tmp/kura-cli-test-wal
"#,
    );

    Command::cargo_bin("kura")
        .unwrap()
        .arg("--config")
        .arg(file.path())
        .arg("--check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"));
}

#[test]
fn test_check_config_rejects_invalid_file() {
    let file = config_file(
        r#"
storage:
  backend: s3
  s3:
    bucket: ""
    region: us-east-1
"#,
    );

    Command::cargo_bin("kura")
        .unwrap()
        .arg("--config")
        .arg(file.path())
        .arg("--check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("bucket and region"));
}

#[test]
fn test_missing_config_file_fails() {
    Command::cargo_bin("kura")
        .unwrap()
        .args(["--config", "/nonexistent/kura.yaml", "--check-config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}
