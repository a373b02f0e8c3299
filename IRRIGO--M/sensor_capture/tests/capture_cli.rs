use std::{
    fs,
    io::Write,
    process::{Command, Output, Stdio},
};

use serde_json::Value;
use tempfile::tempdir;

const CAPTURE: &str = env!("CARGO_BIN_EXE_irrigo-capture");

const DUMP: &str = "boot ok\n\
[soil:bed]\n\
moisture: 41\n\
temp: 18.5\n\
[/soil:bed]\n\
[air:bed]\n\
moisture: 70\n\
[/air:bed]\n";

fn capture(args: &[&str], stdin: &str) -> Output {
    let mut child = Command::new(CAPTURE)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(stdin.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

#[test]
fn prints_pretty_record_for_selected_sensor() {
    let output = capture(&["--sensor", "soil"], DUMP);
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.starts_with("{\n    \"sensor\": \"soil\""));

    let record: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(record["bed"]["moisture"], "41");
    assert_eq!(record["bed"]["temp"], "18.5");
    assert!(record["timestamp"].is_string());
    assert_eq!(record.as_object().unwrap().len(), 3);
}

#[test]
fn garbage_input_still_exits_zero() {
    let output = capture(&["-s", "soil"], "\u{0}\u{1}not a report\n[soil:");
    assert!(output.status.success());
    let record: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(record["sensor"], "soil");
}

#[test]
fn writes_snapshot_and_archive() {
    let dir = tempdir().unwrap();
    let snapshots = dir.path().join("snapshots");
    let archive = dir.path().join("archive.jsonl");
    let output = capture(
        &[
            "-s",
            "air",
            "--save-dir",
            snapshots.to_str().unwrap(),
            "--archive",
            archive.to_str().unwrap(),
        ],
        DUMP,
    );
    assert!(output.status.success());

    let snapshot: Value =
        serde_json::from_str(&fs::read_to_string(snapshots.join("air.json")).unwrap()).unwrap();
    assert_eq!(snapshot["bed"]["moisture"], "70");
    let lines = fs::read_to_string(&archive).unwrap();
    assert_eq!(lines.lines().count(), 1);
}

#[test]
fn missing_sensor_flag_is_a_usage_error() {
    let output = capture(&[], DUMP);
    assert!(!output.status.success());
}
