//! CLI command integration tests.
//! Each test uses a temp directory via RASOOM_DATA_DIR for full isolation.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn rasoom_cmd(data_dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("rasoom").unwrap();
    cmd.env("RASOOM_DATA_DIR", data_dir.path());
    cmd
}

fn write_raw_input(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("burst.json");
    let raw = serde_json::json!({
        "channels": [
            {
                "kind": "pointer",
                "confidence": 0.9,
                "range": { "min": 0.0, "max": 1920.0 },
                "samples": [
                    { "t_ms": 1700000000000.0, "x": 200.0, "y": 300.0 },
                    { "t_ms": 1700000000020.0, "x": 420.0, "y": 310.0 },
                    { "t_ms": 1700000000040.0, "x": 700.0, "y": 330.0 },
                    { "t_ms": 1700000000060.0, "x": 960.0, "y": 340.0 }
                ]
            },
            {
                "kind": "pressure",
                "samples": [
                    { "t_ms": 1700000000000.0, "value": 0.4 },
                    { "t_ms": 1700000000050.0, "value": 0.6 }
                ]
            },
            {
                "kind": "voice",
                "samples": [ { "t_ms": 1700000000010.0, "text": "confirm" } ]
            }
        ]
    });
    std::fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();
    path
}

fn extract_stat_value<'a>(stdout: &'a str, key: &str) -> &'a str {
    stdout
        .lines()
        .find(|l| l.starts_with(key))
        .map(|l| l[key.len()..].trim())
        .unwrap_or("")
}

#[test]
fn stats_fresh_dir() {
    let dir = TempDir::new().unwrap();
    rasoom_cmd(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("prime:      0"))
        .stdout(predicate::str::contains("subscribed: 0"))
        .stdout(predicate::str::contains("dead:       0"));
}

#[test]
fn join_roster_leave() {
    let dir = TempDir::new().unwrap();

    rasoom_cmd(&dir)
        .args(["join", "p-1", "--tier", "prime"])
        .assert()
        .success()
        .stdout(predicate::str::contains("joined p-1 (prime)"));
    rasoom_cmd(&dir)
        .args(["join", "d-1", "--tier", "domain", "--cluster", "east"])
        .assert()
        .success();

    rasoom_cmd(&dir)
        .arg("roster")
        .assert()
        .success()
        .stdout(predicate::str::contains("p-1"))
        .stdout(predicate::str::contains("east"));

    // Rejoining updates in place
    rasoom_cmd(&dir)
        .args(["join", "d-1", "--tier", "domain", "--cluster", "west"])
        .assert()
        .success()
        .stdout(predicate::str::contains("updated d-1"));

    rasoom_cmd(&dir)
        .args(["leave", "d-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("left d-1"));

    let output = rasoom_cmd(&dir).arg("stats").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(extract_stat_value(&stdout, "prime:").starts_with('1'));
    assert!(extract_stat_value(&stdout, "domain:").starts_with('0'));
}

#[test]
fn roster_json_lists_members() {
    let dir = TempDir::new().unwrap();
    rasoom_cmd(&dir)
        .args(["join", "m-7", "--tier", "micro"])
        .assert()
        .success();

    let output = rasoom_cmd(&dir).args(["roster", "--json"]).output().unwrap();
    assert!(output.status.success());
    let members: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(members[0]["agent_id"], "m-7");
    assert_eq!(members[0]["tier"], "micro");
}

#[test]
fn empty_roster() {
    let dir = TempDir::new().unwrap();
    rasoom_cmd(&dir)
        .arg("roster")
        .assert()
        .success()
        .stdout(predicate::str::contains("(no members)"));
}

#[test]
fn leave_unknown_agent_fails() {
    let dir = TempDir::new().unwrap();
    rasoom_cmd(&dir)
        .args(["leave", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not in the roster"));
}

#[test]
fn encode_then_decode_binary() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_input(&dir);
    let frame = dir.path().join("msg.bin");

    rasoom_cmd(&dir)
        .args(["encode", "--source", "p-1", "--to", "domain", "--cluster", "east"])
        .arg(&input)
        .arg("--out")
        .arg(&frame)
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote"))
        .stdout(predicate::str::contains("tier=domain"));

    rasoom_cmd(&dir)
        .arg("decode")
        .arg(&frame)
        .assert()
        .success()
        .stdout(predicate::str::contains("source:     p-1"))
        .stdout(predicate::str::contains("tier:       domain"))
        .stdout(predicate::str::contains("text:       confirm"))
        .stdout(predicate::str::contains("corrected:  false"));
}

#[test]
fn decode_accepts_hex_output_of_encode() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_input(&dir);

    let output = rasoom_cmd(&dir)
        .args(["encode", "--source", "p-1", "--priority", "7"])
        .arg(&input)
        .output()
        .unwrap();
    assert!(output.status.success());
    let hex_path = dir.path().join("msg.hex");
    std::fs::write(&hex_path, &output.stdout).unwrap();

    let output = rasoom_cmd(&dir)
        .args(["decode", "--json"])
        .arg(&hex_path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let decoded: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(decoded["header"]["source_id"], "p-1");
    assert_eq!(decoded["header"]["priority"], 7);
}

#[test]
fn decode_garbage_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("junk.bin");
    std::fs::write(&path, b"not a frame").unwrap();
    rasoom_cmd(&dir)
        .arg("decode")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to decode frame"));
}

#[test]
fn send_command_between_primes() {
    let dir = TempDir::new().unwrap();
    for id in ["p-1", "p-2"] {
        rasoom_cmd(&dir)
            .args(["join", id, "--tier", "prime"])
            .assert()
            .success();
    }

    rasoom_cmd(&dir)
        .args(["send", "p-1", ">p-2 hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"route\": \"unicast\""))
        .stdout(predicate::str::contains("\"status\": \"delivered\""));

    rasoom_cmd(&dir)
        .arg("dead-letters")
        .assert()
        .success()
        .stdout(predicate::str::contains("(no dead letters)"));
}

#[test]
fn send_from_unknown_sender_fails() {
    let dir = TempDir::new().unwrap();
    rasoom_cmd(&dir)
        .args(["send", "nobody", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("send rejected"));
}

#[test]
fn dead_letters_purge_empty() {
    let dir = TempDir::new().unwrap();
    rasoom_cmd(&dir)
        .args(["dead-letters", "--purge"])
        .assert()
        .success()
        .stdout(predicate::str::contains("purged 0 dead letters"));
}

#[test]
fn bench_small_run() {
    let dir = TempDir::new().unwrap();
    let output = rasoom_cmd(&dir)
        .args(["bench", "--members", "8", "--trials", "5", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["members"], 8);
    assert_eq!(report["trials"], 5);
}
