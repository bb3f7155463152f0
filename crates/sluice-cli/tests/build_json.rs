//! Integration tests for `sluice --json build`.
//!
//! These tests verify:
//! - stdout is a single JSON document with an `ok` boolean
//! - exit code 0 on success, 1 on build failures, 2 on config errors
//! - error codes are SCREAMING_SNAKE_CASE

use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn sluice(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sluice"))
        .arg("--json")
        .arg("--cwd")
        .arg(dir)
        .args(args)
        .output()
        .expect("Failed to run sluice")
}

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).expect("Output should be valid JSON")
}

#[test]
fn test_build_success_writes_output() {
    let dir = tempdir().unwrap();
    write(
        dir.path(),
        "src/main.js",
        "import { greet } from './util';\ngreet();\n",
    );
    write(dir.path(), "src/util.js", "export function greet() {}\n");

    let output = sluice(dir.path(), &["build"]);
    assert_eq!(output.status.code(), Some(0));

    let json = stdout_json(&output);
    assert_eq!(json["ok"], true);
    let files: Vec<&str> = json["summary"]["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f.as_str().unwrap())
        .collect();
    assert!(files.contains(&"index.html"));
    assert!(files.contains(&"manifest.json"));
    assert!(files.iter().any(|f| f.starts_with("js/main.") && f.ends_with(".js")));

    for file in files {
        assert!(dir.path().join("dist").join(file).is_file(), "{file}");
    }
}

#[test]
fn test_build_out_dir_override() {
    let dir = tempdir().unwrap();
    write(dir.path(), "src/main.js", "console.log(1);\n");

    let output = sluice(dir.path(), &["build", "--out-dir", "public-build"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(dir.path().join("public-build/index.html").is_file());
    assert!(!dir.path().join("dist").exists());
}

#[test]
fn test_build_out_dir_at_root_exits_2() {
    let dir = tempdir().unwrap();
    write(dir.path(), "src/main.js", "console.log(1);\n");

    let output = sluice(dir.path(), &["build", "--out-dir", "."]);
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(stdout_json(&output)["error"]["code"], "CONFIG_INVALID");
    assert!(dir.path().join("src/main.js").is_file());
}

#[test]
fn test_build_missing_import_exits_1() {
    let dir = tempdir().unwrap();
    write(dir.path(), "src/main.js", "import './nowhere';\n");

    let output = sluice(dir.path(), &["build"]);
    assert_eq!(output.status.code(), Some(1));

    let json = stdout_json(&output);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error"]["code"], "RESOLVE_FAILED");
    assert_eq!(json["error"]["file"], "src/main.js");
    assert!(json["error"]["message"].as_str().unwrap().contains("./nowhere"));
}

#[test]
fn test_build_malformed_config_exits_2() {
    let dir = tempdir().unwrap();
    write(dir.path(), "src/main.js", "console.log(1);\n");
    write(dir.path(), "sluice.config.json", "{ not json");

    let output = sluice(dir.path(), &["build"]);
    assert_eq!(output.status.code(), Some(2));

    let json = stdout_json(&output);
    assert_eq!(json["ok"], false);
    let code = json["error"]["code"].as_str().unwrap();
    assert_eq!(code, "CONFIG_INVALID");
    assert!(code.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
}

#[test]
fn test_version_prints_name() {
    let dir = tempdir().unwrap();
    let output = sluice(dir.path(), &["version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("sluice "));
}
