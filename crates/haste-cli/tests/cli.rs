//! Smoke tests for the `haste` binary.

use std::fs;
use std::process::Command;
use tempfile::tempdir;

fn haste() -> Command {
    Command::new(env!("CARGO_BIN_EXE_haste"))
}

#[test]
fn test_deps_json() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("index.js"), "require('./a');").unwrap();
    fs::write(dir.path().join("a.js"), "").unwrap();

    let output = haste()
        .args(["--json", "deps", "--entry", "index.js", "--root"])
        .arg(dir.path())
        .output()
        .expect("failed to run haste");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let paths: Vec<String> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(paths.len(), 2);
    assert!(paths[0].ends_with("index.js"));
    assert!(paths[1].ends_with("a.js"));
}

#[test]
fn test_bundle_to_file() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("index.js"), "console.log('hi');").unwrap();
    let out = dir.path().join("out/bundle.js");
    fs::create_dir_all(out.parent().unwrap()).unwrap();

    let status = haste()
        .args(["bundle", "--entry", "index.js", "--dev", "--blacklist", "/out/", "--root"])
        .arg(dir.path())
        .arg("--out")
        .arg(&out)
        .status()
        .expect("failed to run haste");
    assert!(status.success());

    let source = fs::read_to_string(&out).unwrap();
    assert!(source.contains("__d(\"index.js\""));
    assert!(source.ends_with(";require(\"index.js\");"));
}

#[test]
fn test_missing_entry_reports_payload() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("index.js"), "").unwrap();

    let output = haste()
        .args(["--json", "bundle", "--entry", "missing.js", "--root"])
        .arg(dir.path())
        .output()
        .expect("failed to run haste");
    assert!(!output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let payload: serde_json::Value = serde_json::from_str(stdout.lines().next().unwrap()).unwrap();
    assert_eq!(payload["type"], "NotFoundError");
}
