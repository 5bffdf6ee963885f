// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::tree::{DeviceTree, TreeNode};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TreeSnapshot {
    pub topology: String,
    pub root: NodeSnapshot,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub id: u32,
    pub name: String,
    pub uuid: String,
    pub sysfs_path: Option<String>,
    pub nvm_version: String,
    pub nvm_authenticate: u32,
    /// Version the component currently reports, if it tracks the node.
    pub component_version: Option<String>,
    pub children: Vec<NodeSnapshot>,
}

impl NodeSnapshot {
    fn capture(node: &TreeNode<'_>) -> Self {
        Self {
            id: node.id().0,
            name: node.name().to_string(),
            uuid: node.uuid().to_string(),
            sysfs_path: node.sysfs_path().map(str::to_string),
            nvm_version: node.nvm_version().to_string(),
            nvm_authenticate: node.nvm_authenticate(),
            component_version: node.device().map(|d| d.version()),
            children: node.children().iter().map(NodeSnapshot::capture).collect(),
        }
    }
}

impl TreeSnapshot {
    pub fn capture(tree: &DeviceTree<'_>) -> Self {
        Self {
            topology: tree.topology().name.clone(),
            root: NodeSnapshot::capture(tree.root()),
        }
    }
}
