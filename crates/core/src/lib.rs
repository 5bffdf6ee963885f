// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Hotplug simulator and synchronization harness.
//!
//! A [`tree::DeviceTree`] is instantiated from an authored
//! [`hotplug_config::Topology`], materialized on a simulated [`testbed::Testbed`]
//! by the attachment scheduler, and observed through the notifications a
//! [`component::Component`] under test emits. Everything runs on one
//! cooperative [`event_loop::EventLoop`] over virtual time, so runs are
//! deterministic and never sleep.

pub mod barrier;
pub mod component;
pub mod event_loop;
pub mod fixtures;
pub mod harness;
pub mod nvm;
pub mod scheduler;
pub mod signals;
pub mod snapshot;
pub mod testbed;
pub mod tree;
pub mod update;

mod tests;

pub use barrier::BarrierError;
pub use component::{Component, ComponentContext, ComponentDevice, ComponentError, DeviceRef};
pub use harness::Harness;
pub use hotplug_config::{HarnessConfig, Topology, TopologyNode, UpdateOutcome};
pub use tree::{DeviceTree, NodeId, TreeNode};
pub use update::{UpdateId, UpdatePhase, UpdatePlan};

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Invalid harness configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Testbed(#[from] testbed::TestbedError),
    #[error("Unknown update context {0}")]
    UnknownUpdate(UpdateId),
    #[error("Unknown tree node {0}")]
    UnknownNode(NodeId),
    #[error("Node {0} is not attached")]
    NotAttached(NodeId),
    #[error("Node {0} is already attached or scheduled to attach")]
    AlreadyAttached(NodeId),
    #[error("Node {0} has nowhere to attach; its parent is detached")]
    NoAttachPoint(NodeId),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
