// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::HarnessConfig;

/// How a simulated firmware update ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    #[default]
    Success,
    /// The device comes back but reports an error in `nvm_authenticate`.
    InternalFailure,
    /// The device never re-appears on the bus.
    NoReappear,
}

impl UpdateOutcome {
    /// Status code the device reports through `nvm_authenticate`.
    pub fn code(self) -> u32 {
        match self {
            UpdateOutcome::Success => 0,
            UpdateOutcome::InternalFailure => 1,
            UpdateOutcome::NoReappear => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UeventKind {
    Add,
    Remove,
    Change,
}

/// Expected result of a step that calls into the component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedResult {
    #[default]
    Ok,
    /// Any error.
    Error,
    /// An error of the internal kind specifically.
    InternalError,
}

fn default_reattach_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScenarioStep {
    /// Create the port, schedule the root and wait for the tree to settle.
    Attach,
    Settle,
    Sync {
        timeout_ms: u64,
    },
    Detach {
        #[serde(default)]
        node: u32,
    },
    /// Schedule a detached node onto its old attach point.
    Reattach {
        #[serde(default)]
        node: u32,
    },
    SetAttribute {
        #[serde(default)]
        node: u32,
        name: String,
        value: String,
    },
    Uevent {
        #[serde(default)]
        node: u32,
        event: UeventKind,
    },
    PrepareUpdate {
        #[serde(default)]
        node: u32,
        version: String,
        #[serde(default)]
        outcome: UpdateOutcome,
        #[serde(default = "default_reattach_delay_ms")]
        reattach_delay_ms: u64,
    },
    WriteFirmware {
        #[serde(default)]
        node: u32,
        #[serde(default)]
        expect: ExpectedResult,
    },
    AttachDevice {
        #[serde(default)]
        node: u32,
        #[serde(default)]
        expect: ExpectedResult,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AllHaveDeviceAssertion {
    pub all_have_device: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AllDetachedAssertion {
    pub all_detached: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NodeVersionDetails {
    #[serde(default)]
    pub node: u32,
    pub equals: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NodeVersionAssertion {
    pub node_version: NodeVersionDetails,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NodeAttachedDetails {
    #[serde(default)]
    pub node: u32,
    pub attached: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NodeAttachedAssertion {
    pub node_attached: NodeAttachedDetails,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ScenarioAssertion {
    AllHaveDevice(AllHaveDeviceAssertion),
    AllDetached(AllDetachedAssertion),
    NodeVersion(NodeVersionAssertion),
    NodeAttached(NodeAttachedAssertion),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScenarioInputs {
    /// Topology YAML, relative to the script.
    pub topology: String,
    /// Raw firmware payload, relative to the script. A synthetic payload is
    /// used when absent.
    #[serde(default)]
    pub firmware: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScenarioScript {
    pub schema_version: String,
    pub inputs: ScenarioInputs,
    #[serde(default)]
    pub harness: HarnessConfig,
    pub steps: Vec<ScenarioStep>,
    #[serde(default)]
    pub assertions: Vec<ScenarioAssertion>,
}

impl ScenarioScript {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        if self.inputs.topology.trim().is_empty() {
            anyhow::bail!("Input 'topology' path cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Scenario must contain at least one step");
        }

        for (index, step) in self.steps.iter().enumerate() {
            if let ScenarioStep::Sync { timeout_ms: 0 } = step {
                anyhow::bail!("Step {}: 'sync' needs a non-zero timeout_ms", index);
            }
        }

        self.harness.validate().context("Invalid 'harness' section")?;
        Ok(())
    }
}

/// Load a scenario script from YAML and validate it.
pub fn load_scenario<P: AsRef<Path>>(path: P) -> Result<ScenarioScript> {
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read scenario script at {:?}", path.as_ref()))?;
    let script: ScenarioScript =
        serde_yaml::from_str(&contents).context("Failed to parse Scenario Script YAML")?;
    script.validate()?;
    debug!(
        "loaded scenario {:?}: {} steps, {} assertions",
        path.as_ref(),
        script.steps.len(),
        script.assertions.len()
    );
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPDATE_SCRIPT: &str = r#"
schema_version: "1.0"
inputs:
  topology: "laptop-two-cables.yaml"
harness:
  settle_timeout_ms: 5000
steps:
  - action: attach
  - action: prepare_update
    version: "42.23"
    outcome: internal_failure
  - action: write_firmware
  - action: settle
  - action: attach_device
    expect: internal_error
  - action: sync
    timeout_ms: 500
assertions:
  - all_have_device: true
  - node_version:
      equals: "20.02"
"#;

    #[test]
    fn test_update_script_parses() {
        let script: ScenarioScript = serde_yaml::from_str(UPDATE_SCRIPT).unwrap();
        script.validate().unwrap();

        assert_eq!(script.harness.settle_timeout_ms, 5000);
        assert_eq!(script.steps.len(), 6);
        assert_eq!(
            script.steps[1],
            ScenarioStep::PrepareUpdate {
                node: 0,
                version: "42.23".to_string(),
                outcome: UpdateOutcome::InternalFailure,
                reattach_delay_ms: 1000,
            }
        );
        assert_eq!(
            script.steps[4],
            ScenarioStep::AttachDevice {
                node: 0,
                expect: ExpectedResult::InternalError,
            }
        );
        assert!(matches!(
            script.assertions[1],
            ScenarioAssertion::NodeVersion(ref a) if a.node_version.equals == "20.02"
        ));
    }

    #[test]
    fn test_zero_sync_rejected() {
        let yaml = r#"
schema_version: "1.0"
inputs:
  topology: "t.yaml"
steps:
  - action: sync
    timeout_ms: 0
"#;
        let script: ScenarioScript = serde_yaml::from_str(yaml).unwrap();
        let err = script.validate().unwrap_err();
        assert!(err.to_string().contains("non-zero"));
    }

    #[test]
    fn test_empty_steps_rejected() {
        let yaml = r#"
schema_version: "1.0"
inputs:
  topology: "t.yaml"
steps: []
"#;
        let script: ScenarioScript = serde_yaml::from_str(yaml).unwrap();
        assert!(script.validate().is_err());
    }

    #[test]
    fn test_outcome_codes() {
        assert_eq!(UpdateOutcome::Success.code(), 0);
        assert_eq!(UpdateOutcome::InternalFailure.code(), 1);
        assert_eq!(UpdateOutcome::NoReappear.code(), 2);
    }
}
