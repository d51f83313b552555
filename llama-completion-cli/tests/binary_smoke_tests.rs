use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;

fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../llama-completion/fixtures/counting.json")
}

fn llama_complete() -> Command {
    let mut cmd = Command::cargo_bin("llama-complete").unwrap();
    cmd.env_remove("LLAMA_COMPLETE_FIXTURE");
    cmd
}

#[test]
fn test_complete_streams_to_stdout() {
    llama_complete()
        .arg("--fixture")
        .arg(fixture())
        .args(["complete", "--prompt", "Count: 1", "--stop", "\n\n"])
        .assert()
        .success()
        .stdout(" 2 3 4 5\n")
        .stderr(predicate::str::contains("stop: word"));
}

#[test]
fn test_complete_json_output() {
    let output = llama_complete()
        .arg("--fixture")
        .arg(fixture())
        .args(["complete", "--prompt", "Count: 1", "-n", "1", "--json"])
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&output.get_output().stdout);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["text"], " 2");
}

#[test]
fn test_missing_fixture_exits_with_error() {
    llama_complete()
        .args(["complete", "--prompt", "Count: 1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--fixture"));
}

#[test]
fn test_embed_outputs_json_vector() {
    llama_complete()
        .arg("--fixture")
        .arg(fixture())
        .args(["embed", "--prompt", "Count: 1"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("{\"embedding\":["));
}

#[test]
fn test_bench_prints_table() {
    llama_complete()
        .arg("--fixture")
        .arg(fixture())
        .args(["bench", "--pp", "8", "--tg", "4", "--nr", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("| counting (scripted) |"));
}

#[test]
fn test_help_lists_subcommands() {
    llama_complete()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("complete"))
        .stdout(predicate::str::contains("session"))
        .stdout(predicate::str::contains("bench"));
}
