// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn write_temp_file(prefix: &str, contents: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push("hotplug-tests");
    let _ = std::fs::create_dir_all(&dir);

    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let path = dir.join(format!("{}-{}.yaml", prefix, nonce));
    std::fs::write(&path, contents).expect("Failed to write temp file");
    path
}

fn run_script(script: &PathBuf) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_hotplug-sim"))
        .args(["run", "--script", script.to_str().unwrap()])
        .output()
        .expect("Failed to execute command")
}

#[test]
fn test_script_unknown_fields_exit_2() {
    let script = write_temp_file(
        "script-unknown",
        r#"
schema_version: "1.0"
inputs:
  topology: "../../configs/topologies/laptop-two-cables.yaml"
steps:
  - action: attach
unexpected_field: 123
"#,
    );

    let output = run_script(&script);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to parse Scenario Script YAML"));
}

#[test]
fn test_script_unsupported_schema_exit_2() {
    let script = write_temp_file(
        "script-schema",
        r#"
schema_version: "2.0"
inputs:
  topology: "topology.yaml"
steps:
  - action: attach
"#,
    );

    let output = run_script(&script);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unsupported schema_version"));
}

#[test]
fn test_missing_topology_exit_2() {
    let script = write_temp_file(
        "script-missing-topology",
        r#"
schema_version: "1.0"
inputs:
  topology: "does-not-exist.yaml"
steps:
  - action: attach
"#,
    );

    let output = run_script(&script);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read topology"));
}

#[test]
fn test_unknown_action_exit_2() {
    let script = write_temp_file(
        "script-bad-action",
        r#"
schema_version: "1.0"
inputs:
  topology: "topology.yaml"
steps:
  - action: reboot
"#,
    );

    let output = run_script(&script);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_topology_override_wins() {
    let topology =
        std::fs::canonicalize("../../configs/topologies/laptop-two-cables.yaml").unwrap();
    let script = write_temp_file(
        "script-override",
        r#"
schema_version: "1.0"
inputs:
  topology: "nowhere.yaml"
steps:
  - action: attach
assertions:
  - all_have_device: true
"#,
    );

    let output = Command::new(env!("CARGO_BIN_EXE_hotplug-sim"))
        .args([
            "run",
            "--script",
            script.to_str().unwrap(),
            "--topology",
            topology.to_str().unwrap(),
        ])
        .output()
        .expect("Failed to execute command");
    assert_eq!(output.status.code(), Some(0));
}
