// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use crate::default_schema_version;

/// One authored device in a topology: a host controller, a cable, a dock or
/// an endpoint. Children are attached beneath it once it has materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyNode {
    /// Exposed as the `device_name` attribute.
    pub name: String,
    /// Identity code, exposed as the `device` attribute (e.g. `0x23`).
    pub id: String,
    /// Raw version string as the device reports it in `nvm_version`.
    pub nvm_version: String,
    /// Version a conforming component is expected to derive from `nvm_version`.
    pub nvm_parsed_version: String,
    /// Delay between the attach being scheduled and the device appearing.
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub domain_id: u32,
    /// Fixed unique id. A random one is generated per run when absent.
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub children: Vec<TopologyNode>,
}

impl TopologyNode {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        nvm_version: impl Into<String>,
        nvm_parsed_version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            nvm_version: nvm_version.into(),
            nvm_parsed_version: nvm_parsed_version.into(),
            delay_ms: 0,
            domain_id: 0,
            uuid: None,
            children: Vec::new(),
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_domain(mut self, domain_id: u32) -> Self {
        self.domain_id = domain_id;
        self
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn with_child(mut self, child: TopologyNode) -> Self {
        self.children.push(child);
        self
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(TopologyNode::count).sum::<usize>()
    }

    /// Depth of this subtree; a leaf has depth 1.
    pub fn depth(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(TopologyNode::depth)
            .max()
            .unwrap_or(0)
    }

    /// Depth-first, pre-order walk.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a TopologyNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Unsupported schema_version '{0}'. Supported versions: '1.0'")]
    SchemaVersion(String),
    #[error("Node with identity code '{0}' has an empty name")]
    EmptyName(String),
    #[error("Node '{0}' has an empty nvm_version")]
    EmptyVersion(String),
    #[error("Fixed uuid '{0}' is used by more than one node")]
    DuplicateUuid(String),
}

/// A complete authored device tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Topology {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub name: String,
    pub root: TopologyNode,
}

impl Topology {
    pub fn new(name: impl Into<String>, root: TopologyNode) -> Self {
        Self {
            schema_version: default_schema_version(),
            name: name.into(),
            root,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read topology at {:?}", path.as_ref()))?;
        let topology: Self =
            serde_yaml::from_str(&contents).context("Failed to parse Topology YAML")?;
        topology.validate()?;
        debug!(
            "loaded topology '{}' ({} nodes) from {:?}",
            topology.name,
            topology.node_count(),
            path.as_ref()
        );
        Ok(topology)
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.schema_version != "1.0" {
            return Err(TopologyError::SchemaVersion(self.schema_version.clone()));
        }

        let mut seen = HashSet::new();
        let mut failure = None;
        self.root.walk(&mut |node| {
            if failure.is_some() {
                return;
            }
            if node.name.trim().is_empty() {
                failure = Some(TopologyError::EmptyName(node.id.clone()));
            } else if node.nvm_version.trim().is_empty() {
                failure = Some(TopologyError::EmptyVersion(node.name.clone()));
            } else if let Some(uuid) = &node.uuid {
                if !seen.insert(uuid.as_str()) {
                    failure = Some(TopologyError::DuplicateUuid(uuid.clone()));
                }
            }
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn node_count(&self) -> usize {
        self.root.count()
    }
}
