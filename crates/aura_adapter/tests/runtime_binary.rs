use assert_cmd::Command;
use predicates::prelude::*;

fn budgets_path() -> String {
    concat!(env!("CARGO_MANIFEST_DIR"), "/../../ux_budgets.yaml").to_string()
}

fn runtime() -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("aura_adapter_runtime");
    cmd.env("AURA_UX_BUDGETS_PATH", budgets_path())
        .env_remove("AURA_IDLE_HZ")
        .env_remove("AURA_ACTIVE_HZ")
        .env("RUST_LOG", "off");
    cmd
}

#[test]
fn scripted_session_prints_json_replies() {
    let output = runtime()
        .write_stdin("pair\nadmit vision\nadmit vision\nactive\nadmit\nstatus\nreconnected\nquit\n")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let replies: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .filter(|v: &serde_json::Value| v.get("command").is_some())
        .collect();

    assert_eq!(replies.len(), 7);
    assert_eq!(replies[0]["ok"], "ok");
    assert_eq!(replies[1]["ok"]["decision"], "admitted");
    assert_eq!(replies[2]["ok"]["decision"], "throttled");
    assert_eq!(replies[4]["ok"]["decision"], "admitted");
    assert_eq!(replies[5]["ok"]["snapshot"]["state"], "READY");
    assert_eq!(replies[5]["ok"]["snapshot"]["engagement"], "ACTIVE");
    assert!(replies[6]["error"]
        .as_str()
        .unwrap()
        .contains("illegal handshake transition"));
    assert!(stdout.contains("\"kind\":\"transition\""));
}

#[test]
fn unknown_channel_and_command_are_reported_not_fatal() {
    let output = runtime()
        .write_stdin("admit radar\nfly\nquit\n")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("unknown channel"));
    assert!(stdout.contains("unknown command"));
}

#[test]
fn missing_budgets_file_exits_with_status_2() {
    runtime()
        .env("AURA_UX_BUDGETS_PATH", "/nonexistent/ux_budgets.yaml")
        .write_stdin("quit\n")
        .assert()
        .code(2)
        .stderr(predicate::str::contains(
            "error: failed to read /nonexistent/ux_budgets.yaml",
        ));
}

#[test]
fn negative_idle_rate_exits_with_status_2() {
    runtime()
        .env("AURA_IDLE_HZ", "-3")
        .write_stdin("quit\n")
        .assert()
        .code(2);
}
