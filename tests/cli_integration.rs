// CLI integration tests for `check`, `completion` and argument errors.
use std::fs;
use std::path::Path;
use std::process::Command;

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_gedis");
    Command::new(exe)
}

fn parse_json_line(output: &[u8]) -> Value {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().next().expect("json line");
    serde_json::from_str(line).expect("valid json")
}

fn write_package(root: &Path, name: &str, source: &str) -> String {
    let dir = root.join(name);
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("main.rhai"), source).expect("write");
    dir.to_str().expect("utf8 path").to_string()
}

#[test]
fn check_reports_compiled_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    let calc = write_package(temp.path(), "calc", "fn add(a, b) { a + b }");

    let output = cmd().args(["check", &calc]).output().expect("check");
    assert!(output.status.success());
    let report = parse_json_line(&output.stdout);
    let package = &report["packages"][0];
    assert_eq!(package["path"], calc.as_str());
    assert_eq!(package["ok"], true);
    assert!(
        package["files"][0]
            .as_str()
            .expect("file")
            .ends_with("main.rhai")
    );
}

#[test]
fn check_fails_with_compile_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let good = write_package(temp.path(), "good", "fn one() { 1 }");
    let bad = write_package(temp.path(), "bad", "fn broken( {");

    let output = cmd().args(["check", &good, &bad]).output().expect("check");
    assert_eq!(output.status.code(), Some(7));
    let report = parse_json_line(&output.stdout);
    assert_eq!(report["packages"][0]["ok"], true);
    let failed = &report["packages"][1];
    assert_eq!(failed["ok"], false);
    assert_eq!(failed["error"]["kind"], "Compile");
    assert!(
        failed["error"]["path"]
            .as_str()
            .expect("path")
            .ends_with("main.rhai")
    );
}

#[test]
fn check_missing_directory_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let missing = temp.path().join("missing");

    let output = cmd()
        .arg("check")
        .arg(&missing)
        .output()
        .expect("check");
    assert_eq!(output.status.code(), Some(3));
    let report = parse_json_line(&output.stdout);
    assert_eq!(report["packages"][0]["error"]["kind"], "NotFound");
}

#[test]
fn invalid_arguments_emit_usage_envelope() {
    let output = cmd()
        .args(["serve", "--pool-size", "lots"])
        .output()
        .expect("serve");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json_line(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
    assert!(
        err["error"]["hint"]
            .as_str()
            .expect("hint")
            .starts_with("Try `gedis")
    );
}

#[test]
fn zero_pool_size_is_rejected_before_binding() {
    let output = cmd()
        .args(["serve", "--pool-size", "0", "--bind", "127.0.0.1:0"])
        .output()
        .expect("serve");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json_line(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
    assert!(
        err["error"]["message"]
            .as_str()
            .expect("message")
            .contains("--pool-size")
    );
}

#[test]
fn completion_generates_script() {
    let output = cmd().args(["completion", "bash"]).output().expect("completion");
    assert!(output.status.success());
    let script = String::from_utf8_lossy(&output.stdout);
    assert!(script.contains("gedis"));
}
