use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn aura() -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("aura");
    cmd.env("RUST_LOG", "off");
    cmd
}

#[test]
fn budgets_check_prints_parsed_values() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../ux_budgets.yaml");
    let output = aura()
        .args(["budgets", "check", path])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["handshake"]["degrade_p50_s"], 1.5);
    assert_eq!(value["handshake"]["reconnect_p95_s"], 6.0);
    assert_eq!(value["gesture_detection"]["false_positive_cap"], 0.05);
}

#[test]
fn budgets_check_rejects_inverted_window() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "handshake:\n  degrade_p50: 5\n  degrade_p95: 1\n  reconnect_p50: 1\n  reconnect_p95: 2"
    )
    .unwrap();
    aura()
        .args(["budgets", "check"])
        .arg(file.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("degrade_p50"));
}

#[test]
fn budgets_check_reports_missing_key() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "handshake:\n  degrade_p50: 1\n").unwrap();
    aura()
        .args(["budgets", "check"])
        .arg(file.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing key `handshake.degrade_p95`"));
}

#[test]
fn duty_sim_with_baseline_halves_admissions() {
    let output = aura()
        .args(["duty-sim", "--baseline"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["report"]["admitted"], 140);
    assert_eq!(value["baseline"]["admitted"], 300);
    assert!(value["report"]["max_idle_admission_latency_ms"].as_u64().unwrap() <= 500);
}

#[test]
fn duty_sim_rejects_negative_rate() {
    aura()
        .args(["duty-sim", "--idle-hz=-1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("error:"));
}
