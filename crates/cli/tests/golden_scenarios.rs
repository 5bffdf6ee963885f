// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::path::{Path, PathBuf};
use std::process::Command;

fn scenario_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/scenarios")
}

fn run_scenario(path: &Path, tag: &str) -> serde_json::Value {
    let output_dir = std::env::temp_dir()
        .join(format!("hotplug-golden-{}-{}", tag, std::process::id()))
        .join(path.file_stem().unwrap());
    let _ = std::fs::remove_dir_all(&output_dir);

    let output = Command::new(env!("CARGO_BIN_EXE_hotplug-sim"))
        .args([
            "run",
            "--script",
            path.to_str().unwrap(),
            "--output-dir",
            output_dir.to_str().unwrap(),
        ])
        .output()
        .expect("Failed to execute command");

    assert_eq!(
        output.status.code(),
        Some(0),
        "scenario {:?} failed: {}",
        path,
        String::from_utf8_lossy(&output.stderr)
    );

    let content = std::fs::read_to_string(output_dir.join("result.json")).unwrap();
    serde_json::from_str(&content).unwrap()
}

#[test]
fn test_all_shipped_scenarios_pass() {
    let mut scripts: Vec<PathBuf> = std::fs::read_dir(scenario_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map(|e| e == "yaml").unwrap_or(false))
        .collect();
    scripts.sort();
    assert!(!scripts.is_empty());

    for script in &scripts {
        let result = run_scenario(script, "all");
        assert_eq!(result["status"], "pass", "{:?}", script);
    }
}

#[test]
fn test_attach_timeline_is_deterministic() {
    let script = scenario_dir().join("attach.yaml");
    let result = run_scenario(&script, "timeline");
    let times: Vec<u64> = result["notifications"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["at_ms"].as_u64().unwrap())
        .collect();
    assert_eq!(times, vec![50, 70, 70, 80, 90]);
    // attach settles at 90 ms, the trailing sync adds 100
    assert_eq!(result["virtual_time_ms"], 190);
}

#[test]
fn test_noshow_leaves_tree_detached() {
    let result = run_scenario(&scenario_dir().join("update-noshow.yaml"), "noshow");
    assert!(result["tree"]["root"]["sysfs_path"].is_null());
    let removed = result["notifications"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|n| n["kind"] == "removed")
        .count();
    assert_eq!(removed, 5);
}
