//! Integration tests for the `optibench` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn optibench() -> Command {
    Command::cargo_bin("optibench").unwrap()
}

#[test]
fn test_list_shows_builtin_plugins() {
    optibench()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("mnist"))
        .stdout(predicate::str::contains("wmt"))
        .stdout(predicate::str::contains("adamw_baseline"))
        .stdout(predicate::str::contains("sgd_baseline"));
}

#[test]
fn test_list_json_output() {
    let assert = optibench().args(["list", "--json"]).assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let json: serde_json::Value = serde_json::from_str(&stdout).expect("list JSON output should be valid JSON");
    assert_eq!(json["workloads"].as_array().unwrap().len(), 4);
    assert_eq!(json["submissions"][0]["name"], "adamw_baseline");
}

#[test]
fn test_inspect_json_reports_specs_and_groups() {
    let temp_dir = TempDir::new().unwrap();
    let assert = optibench()
        .args(["inspect", "--workload", "mnist", "--submission", "sgd_baseline", "--json", "--data-dir"])
        .arg(temp_dir.path())
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["specs"]["max_steps"], 4536);
    assert_eq!(json["specs"]["target_metric"], "val_acc");
    assert_eq!(json["groups"].as_array().unwrap().len(), 1);
    assert_eq!(json["optimizers"]["optimizers"][0]["name"], "sgd");
}

#[test]
fn test_unknown_submission_fails_with_its_name() {
    optibench()
        .args(["inspect", "-w", "mnist", "-s", "lion"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown submission 'lion'"))
        .stderr(predicate::str::contains("adamw_baseline, sgd_baseline"));
}

#[test]
fn test_run_without_download_requires_dataset() {
    let temp_dir = TempDir::new().unwrap();
    optibench()
        .args(["run", "-w", "mnist", "-s", "sgd_baseline", "--data-dir"])
        .arg(temp_dir.path().join("missing"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_run_writes_plan() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("out");
    let hparams = temp_dir.path().join("adamw.toml");
    std::fs::write(&hparams, "learning_rate = 0.01\n").unwrap();

    optibench()
        .args(["run", "-w", "mnist", "-s", "adamw_baseline", "--download", "--batch-size", "64", "--data-dir"])
        .arg(temp_dir.path().join("data"))
        .arg("--hyperparameters")
        .arg(&hparams)
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("Run plan written"));

    let plan: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(output.join("run_plan.json")).unwrap()).unwrap();
    assert_eq!(plan["workload"], "mnist");
    assert_eq!(plan["train"]["batch_size"], 64);
    assert_eq!(plan["checkpoint"]["monitor"], "val_acc");
    assert_eq!(plan["optimizers"]["optimizers"][0]["groups"][0]["lr"], 0.01);
    assert!(temp_dir.path().join("data").join("mnist").is_dir());
}
