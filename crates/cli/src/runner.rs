// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use hotplug_config::{ExpectedResult, HarnessConfig, ScenarioAssertion, ScenarioStep, UeventKind};
use hotplug_core::component::{ReferenceComponent, WriteFlags};
use hotplug_core::testbed::UeventAction;
use hotplug_core::tree::{HasComponentDevice, IsDetached};
use hotplug_core::{ComponentError, DeviceTree, Harness, HarnessError, NodeId, UpdateId, UpdatePlan};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Why a step did not complete.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The step ran, but the outcome was not what the script expected.
    #[error("{0}")]
    Failed(String),
    /// The harness refused the step, e.g. an unknown or detached node.
    #[error(transparent)]
    Harness(#[from] HarnessError),
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub action: &'static str,
    pub at_ms: u64,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssertionResult {
    pub assertion: ScenarioAssertion,
    pub passed: bool,
}

pub fn step_action(step: &ScenarioStep) -> &'static str {
    match step {
        ScenarioStep::Attach => "attach",
        ScenarioStep::Settle => "settle",
        ScenarioStep::Sync { .. } => "sync",
        ScenarioStep::Detach { .. } => "detach",
        ScenarioStep::Reattach { .. } => "reattach",
        ScenarioStep::SetAttribute { .. } => "set_attribute",
        ScenarioStep::Uevent { .. } => "uevent",
        ScenarioStep::PrepareUpdate { .. } => "prepare_update",
        ScenarioStep::WriteFirmware { .. } => "write_firmware",
        ScenarioStep::AttachDevice { .. } => "attach_device",
    }
}

/// One scenario execution against the reference component.
pub struct ScenarioRunner<'t> {
    harness: Harness<ReferenceComponent>,
    tree: DeviceTree<'t>,
    firmware: Vec<u8>,
    updates: Vec<UpdateId>,
}

impl<'t> ScenarioRunner<'t> {
    pub fn new(
        tree: DeviceTree<'t>,
        config: HarnessConfig,
        firmware: Vec<u8>,
    ) -> Result<Self, HarnessError> {
        Ok(Self {
            harness: Harness::new(ReferenceComponent::new(), config)?,
            tree,
            firmware,
            updates: Vec::new(),
        })
    }

    pub fn harness(&self) -> &Harness<ReferenceComponent> {
        &self.harness
    }

    pub fn tree(&self) -> &DeviceTree<'t> {
        &self.tree
    }

    fn node_id(&self, node: u32) -> Result<NodeId, StepError> {
        let id = NodeId(node);
        match self.tree.node(id) {
            Some(_) => Ok(id),
            None => Err(HarnessError::UnknownNode(id).into()),
        }
    }

    pub fn run_step(&mut self, step: &ScenarioStep) -> Result<(), StepError> {
        debug!("step '{}' at {}", step_action(step), self.harness.now());
        match step {
            ScenarioStep::Attach => {
                let took = self
                    .harness
                    .attach(&mut self.tree)
                    .map_err(|e| StepError::Failed(e.to_string()))?;
                info!("tree attached after {:?}", took);
            }
            ScenarioStep::Settle => {
                self.harness
                    .settle(&mut self.tree)
                    .map_err(|e| StepError::Failed(e.to_string()))?;
            }
            ScenarioStep::Sync { timeout_ms } => {
                self.harness
                    .sync_for(&mut self.tree, Duration::from_millis(*timeout_ms));
            }
            ScenarioStep::Detach { node } => {
                let id = self.node_id(*node)?;
                self.harness.detach(&mut self.tree, id)?;
            }
            ScenarioStep::Reattach { node } => {
                let id = self.node_id(*node)?;
                self.harness.schedule_attach(&self.tree, id)?;
            }
            ScenarioStep::SetAttribute { node, name, value } => {
                let id = self.node_id(*node)?;
                self.harness.set_attribute(&self.tree, id, name, value)?;
            }
            ScenarioStep::Uevent { node, event } => {
                let id = self.node_id(*node)?;
                let action = match event {
                    UeventKind::Add => UeventAction::Add,
                    UeventKind::Remove => UeventAction::Remove,
                    UeventKind::Change => UeventAction::Change,
                };
                self.harness.uevent(&self.tree, id, action)?;
            }
            ScenarioStep::PrepareUpdate {
                node,
                version,
                outcome,
                reattach_delay_ms,
            } => {
                let id = self.node_id(*node)?;
                let plan = UpdatePlan::new(version.as_str(), self.firmware.clone())
                    .with_outcome(*outcome)
                    .with_reattach_delay(Duration::from_millis(*reattach_delay_ms));
                let update = self.harness.prepare_for_update(&self.tree, id, plan)?;
                self.updates.push(update);
            }
            ScenarioStep::WriteFirmware { node, expect } => {
                let id = self.node_id(*node)?;
                let result = self.harness.write_firmware(
                    &mut self.tree,
                    id,
                    &self.firmware,
                    WriteFlags::NO_SEARCH,
                );
                check_expected(*expect, result)?;
            }
            ScenarioStep::AttachDevice { node, expect } => {
                let id = self.node_id(*node)?;
                let result = self.harness.attach_device(&mut self.tree, id);
                check_expected(*expect, result)?;
            }
        }
        Ok(())
    }

    pub fn evaluate(&self, assertion: &ScenarioAssertion) -> bool {
        match assertion {
            ScenarioAssertion::AllHaveDevice(a) => {
                self.tree.for_all(&HasComponentDevice) == a.all_have_device
            }
            ScenarioAssertion::AllDetached(a) => self.tree.for_all(&IsDetached) == a.all_detached,
            ScenarioAssertion::NodeVersion(a) => self
                .tree
                .node(NodeId(a.node_version.node))
                .and_then(|n| n.device())
                .map(|d| d.version() == a.node_version.equals)
                .unwrap_or(false),
            ScenarioAssertion::NodeAttached(a) => self
                .tree
                .node(NodeId(a.node_attached.node))
                .map(|n| n.is_attached() == a.node_attached.attached)
                .unwrap_or(false),
        }
    }

    /// Drop pending updates and take the tree off the bus.
    pub fn finish(&mut self) {
        for update in self.updates.drain(..) {
            self.harness.release_update(update);
        }
        self.tree.teardown();
    }
}

fn check_expected(
    expect: ExpectedResult,
    result: Result<(), ComponentError>,
) -> Result<(), StepError> {
    match (expect, result) {
        (ExpectedResult::Ok, Ok(())) => Ok(()),
        (ExpectedResult::Ok, Err(e)) => Err(StepError::Failed(format!("unexpected error: {}", e))),
        (ExpectedResult::Error, Err(_)) => Ok(()),
        (ExpectedResult::InternalError, Err(e)) if e.is_internal() => Ok(()),
        (ExpectedResult::InternalError, Err(e)) => Err(StepError::Failed(format!(
            "expected an internal error, got: {}",
            e
        ))),
        (_, Ok(())) => Err(StepError::Failed(
            "expected an error, but the call succeeded".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotplug_config::UpdateOutcome;
    use hotplug_core::fixtures;

    #[test]
    fn test_check_expected_matrix() {
        assert!(check_expected(ExpectedResult::Ok, Ok(())).is_ok());
        assert!(check_expected(ExpectedResult::Error, Ok(())).is_err());
        assert!(check_expected(
            ExpectedResult::Error,
            Err(ComponentError::Write("x".into()))
        )
        .is_ok());
        assert!(check_expected(
            ExpectedResult::InternalError,
            Err(ComponentError::Write("x".into()))
        )
        .is_err());
        assert!(check_expected(
            ExpectedResult::InternalError,
            Err(ComponentError::Internal("x".into()))
        )
        .is_ok());
    }

    #[test]
    fn test_failed_update_script() {
        let topology = fixtures::laptop_two_cables();
        let tree = DeviceTree::instantiate(&topology);
        let mut runner = ScenarioRunner::new(
            tree,
            HarnessConfig::default(),
            fixtures::firmware_payload(1024),
        )
        .unwrap();

        let steps = [
            ScenarioStep::Attach,
            ScenarioStep::PrepareUpdate {
                node: 0,
                version: "42.23".to_string(),
                outcome: UpdateOutcome::InternalFailure,
                reattach_delay_ms: 1000,
            },
            ScenarioStep::WriteFirmware {
                node: 0,
                expect: ExpectedResult::Ok,
            },
            ScenarioStep::Settle,
            ScenarioStep::AttachDevice {
                node: 0,
                expect: ExpectedResult::InternalError,
            },
        ];
        for step in &steps {
            runner.run_step(step).unwrap();
        }

        let yaml = r#"
- all_have_device: true
- node_version:
    equals: "20.02"
"#;
        let assertions: Vec<ScenarioAssertion> = serde_yaml::from_str(yaml).unwrap();
        assert!(assertions.iter().all(|a| runner.evaluate(a)));

        runner.finish();
        assert!(runner.tree().for_all(&IsDetached));
    }

    #[test]
    fn test_unknown_node_is_a_harness_error() {
        let topology = fixtures::laptop_two_cables();
        let tree = DeviceTree::instantiate(&topology);
        let mut runner =
            ScenarioRunner::new(tree, HarnessConfig::default(), vec![0xAA; 16]).unwrap();

        let err = runner.run_step(&ScenarioStep::Detach { node: 42 }).unwrap_err();
        assert!(matches!(
            err,
            StepError::Harness(HarnessError::UnknownNode(NodeId(42)))
        ));
    }

    #[test]
    fn test_reattach_of_attached_node_is_refused() {
        let topology = fixtures::laptop_two_cables();
        let tree = DeviceTree::instantiate(&topology);
        let mut runner =
            ScenarioRunner::new(tree, HarnessConfig::default(), vec![0xAA; 16]).unwrap();

        runner.run_step(&ScenarioStep::Attach).unwrap();
        let err = runner.run_step(&ScenarioStep::Reattach { node: 1 }).unwrap_err();
        assert!(matches!(
            err,
            StepError::Harness(HarnessError::AlreadyAttached(NodeId(1)))
        ));

        runner.run_step(&ScenarioStep::Sync { timeout_ms: 100 }).unwrap();
        assert!(runner.tree().for_all(&HasComponentDevice));
        runner.finish();
    }

    #[test]
    fn test_step_error_messages() {
        let failed = StepError::Failed("expected an error".to_string());
        assert_eq!(failed.to_string(), "expected an error");

        let harness: StepError = HarnessError::UnknownNode(NodeId(7)).into();
        assert_eq!(
            harness.to_string(),
            HarnessError::UnknownNode(NodeId(7)).to_string()
        );
    }
}
