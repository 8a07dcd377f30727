use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[allow(deprecated)]
fn smoke_cmd() -> Command {
    Command::cargo_bin("opa-smoke").unwrap()
}

fn emit_stub(dir: &Path, abi_minor: i32) -> PathBuf {
    let path = dir.join(format!("stub-1.{abi_minor}.wasm"));
    smoke_cmd()
        .arg("--emit-stub")
        .arg(&path)
        .arg("--stub-abi-minor")
        .arg(abi_minor.to_string())
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote stub policy"));
    path
}

#[test]
fn help_works() {
    smoke_cmd().arg("--help").assert().success();
}

#[test]
fn missing_artifact_fails_visibly() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent.wasm");

    smoke_cmd()
        .arg(&missing)
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .code(1)
        .stderr(predicate::str::contains("Failed to read policy artifact"))
        .stderr(predicate::str::contains("ReadError").not());
}

#[test]
fn non_wasm_artifact_fails() {
    let dir = TempDir::new().unwrap();
    let bogus = dir.path().join("bogus.wasm");
    std::fs::write(&bogus, b"definitely not wasm").unwrap();

    smoke_cmd().arg(&bogus).assert().failure();
}

#[test]
fn smoke_inputs_are_reported_in_order() {
    let dir = TempDir::new().unwrap();
    for abi_minor in [1, 2] {
        let stub = emit_stub(dir.path(), abi_minor);

        let assert = smoke_cmd().arg(&stub).assert().success();
        let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
        let lines: Vec<&str> = stdout.lines().collect();

        assert_eq!(
            lines,
            vec![
                r#"input: {"name":"Doe","role":"admin"}"#,
                r#"result: [{"result":{"name":"Doe","role":"admin"}}]"#,
                r#"input: {"name":"Štěpán","role":"admin"}"#,
                r#"result: [{"result":{"name":"Štěpán","role":"admin"}}]"#,
                r#"input: {"name":"\\","role":"admin"}"#,
                r#"result: [{"result":{"name":"\\","role":"admin"}}]"#,
            ]
        );
    }
}

#[test]
fn undefined_entrypoint_reports_undefined() {
    let dir = TempDir::new().unwrap();
    let stub = emit_stub(dir.path(), 2);

    let assert = smoke_cmd()
        .arg(&stub)
        .args(["--entrypoint", "stub/undefined"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert_eq!(stdout.matches("undefined\n").count(), 3);
}

#[test]
fn evaluation_errors_do_not_stop_the_run() {
    let dir = TempDir::new().unwrap();
    let stub = emit_stub(dir.path(), 2);

    smoke_cmd()
        .arg(&stub)
        .args(["--entrypoint", "2", "--isolate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("input: ").count(3))
        .stderr(predicate::str::contains("evaluation error").count(3));
}

#[test]
fn errors_on_a_shared_instance_do_not_stop_the_run() {
    let dir = TempDir::new().unwrap();
    for abi_minor in [1, 2] {
        let stub = emit_stub(dir.path(), abi_minor);

        for entrypoint in ["stub/abort", "stub/status", "stub/missing"] {
            smoke_cmd()
                .arg(&stub)
                .args(["--entrypoint", entrypoint])
                .assert()
                .success()
                .stdout(predicate::str::contains("input: ").count(3))
                .stderr(predicate::str::contains("evaluation error").count(3));
        }
    }
}

#[test]
fn custom_inputs_and_data() {
    let dir = TempDir::new().unwrap();
    let stub = emit_stub(dir.path(), 1);

    smoke_cmd()
        .arg(&stub)
        .args(["--input", r#"{"role":"dev"}"#, "--data", r#"{"roles":["dev"]}"#])
        .assert()
        .success()
        .stdout(predicate::str::diff(
            "input: {\"role\":\"dev\"}\nresult: [{\"result\":{\"role\":\"dev\"}}]\n",
        ));
}
