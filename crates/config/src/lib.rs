// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod scenario;
pub mod topology;

pub use scenario::{
    load_scenario, ExpectedResult, ScenarioAssertion, ScenarioInputs, ScenarioScript,
    ScenarioStep, UeventKind, UpdateOutcome,
};
pub use topology::{Topology, TopologyError, TopologyNode};

/// Default schema version for YAML configs
fn default_schema_version() -> String {
    "1.0".to_string()
}

fn default_settle_timeout_ms() -> u64 {
    10_000
}

fn default_subsystems() -> Vec<String> {
    vec!["thunderbolt".to_string()]
}

fn default_port_name() -> String {
    "usb4_port1".to_string()
}

fn default_nvm_capacity() -> String {
    "256 KiB".to_string()
}

/// Knobs of the harness itself, independent of the topology under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Upper bound for `settle`, in virtual milliseconds.
    #[serde(default = "default_settle_timeout_ms")]
    pub settle_timeout_ms: u64,
    /// Only uevents of these subsystems are routed to the component.
    #[serde(default = "default_subsystems")]
    pub subsystems: Vec<String>,
    /// Name of the synthetic port the root device hangs off.
    #[serde(default = "default_port_name")]
    pub port_name: String,
    /// Capacity of each emulated NVM region, e.g. "256 KiB".
    #[serde(default = "default_nvm_capacity")]
    pub nvm_capacity: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            settle_timeout_ms: default_settle_timeout_ms(),
            subsystems: default_subsystems(),
            port_name: default_port_name(),
            nvm_capacity: default_nvm_capacity(),
        }
    }
}

impl HarnessConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open harness config at {:?}", path.as_ref()))?;
        let config: Self =
            serde_yaml::from_reader(f).context("Failed to parse Harness Config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.settle_timeout_ms == 0 {
            anyhow::bail!("'settle_timeout_ms' must be greater than zero");
        }
        if self.subsystems.iter().all(|s| s.trim().is_empty()) {
            anyhow::bail!("'subsystems' must name at least one subsystem");
        }
        if self.port_name.trim().is_empty() {
            anyhow::bail!("'port_name' cannot be empty");
        }
        if self.nvm_capacity_bytes()? == 0 {
            anyhow::bail!("'nvm_capacity' must be greater than zero");
        }
        Ok(())
    }

    pub fn nvm_capacity_bytes(&self) -> Result<u64> {
        parse_size(&self.nvm_capacity)
            .with_context(|| format!("Invalid nvm_capacity '{}'", self.nvm_capacity))
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1 KB").unwrap(), 1000);
        assert_eq!(parse_size("1 KiB").unwrap(), 1024);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_harness_defaults() {
        let config: HarnessConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.subsystems, vec!["thunderbolt".to_string()]);
        assert_eq!(config.nvm_capacity_bytes().unwrap(), 262_144);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_harness_rejects_zero_timeout() {
        let config = HarnessConfig {
            settle_timeout_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("settle_timeout_ms"));
    }

    #[test]
    fn test_harness_rejects_bad_capacity() {
        let config = HarnessConfig {
            nvm_capacity: "big".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
