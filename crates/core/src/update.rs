// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Simulated firmware update cycle.
//!
//! ```text
//! Watching --changed("1...")--> Verifying --verified--> Detached
//! Watching --changed(other)---> Watching (disarmed)
//! Detached --outcome applied--> TerminalNoReappear   (no-reappear)
//!                           \-> Detached + reattach timer
//! Detached --reattach due-----> Reattaching
//! ```

use crate::event_loop::TimerId;
use crate::testbed::{BusHandle, WatchId};
use crate::tree::NodeId;
use hotplug_config::UpdateOutcome;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UpdateId(pub(crate) u64);

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "update#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Watching,
    Verifying,
    Detached,
    Reattaching,
    TerminalNoReappear,
}

impl UpdatePhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdatePhase::Reattaching | UpdatePhase::TerminalNoReappear
        )
    }
}

/// What drives the machine forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTrigger {
    /// The watched attribute changed; `accepted` if the content starts with `1`.
    Changed { accepted: bool },
    /// The non-active region matched the expected image.
    Verified,
    /// The subtree is gone and the outcome has been recorded on the node.
    OutcomeApplied,
    ReattachDue,
}

/// Side effect the harness performs after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStep {
    Disarm,
    Verify,
    Detach,
    ScheduleReattach,
    Reattach,
    Halt,
    Ignore,
}

pub fn transition(
    phase: UpdatePhase,
    outcome: UpdateOutcome,
    trigger: UpdateTrigger,
) -> (UpdatePhase, UpdateStep) {
    use UpdatePhase::*;
    use UpdateTrigger::*;

    match (phase, trigger) {
        (Watching, Changed { accepted: true }) => (Verifying, UpdateStep::Verify),
        (Watching, Changed { accepted: false }) => (Watching, UpdateStep::Disarm),
        (Verifying, Verified) => (Detached, UpdateStep::Detach),
        (Detached, OutcomeApplied) => match outcome {
            UpdateOutcome::NoReappear => (TerminalNoReappear, UpdateStep::Halt),
            _ => (Detached, UpdateStep::ScheduleReattach),
        },
        (Detached, ReattachDue) => (Reattaching, UpdateStep::Reattach),
        (phase, _) => (phase, UpdateStep::Ignore),
    }
}

/// Parameters of one simulated update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePlan {
    /// Version the device reports after a successful update.
    pub version: String,
    /// Image the component is expected to write.
    pub firmware: Vec<u8>,
    pub reattach_delay: Duration,
    pub outcome: UpdateOutcome,
}

impl UpdatePlan {
    pub fn new(version: impl Into<String>, firmware: impl Into<Vec<u8>>) -> Self {
        Self {
            version: version.into(),
            firmware: firmware.into(),
            reattach_delay: Duration::from_millis(1000),
            outcome: UpdateOutcome::Success,
        }
    }

    pub fn with_outcome(mut self, outcome: UpdateOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_reattach_delay(mut self, delay: Duration) -> Self {
        self.reattach_delay = delay;
        self
    }
}

/// Live state of one update. Holds the bus until the cycle completes.
#[derive(Debug)]
pub struct UpdateContext {
    pub(crate) id: UpdateId,
    pub(crate) target: NodeId,
    pub(crate) plan: UpdatePlan,
    pub(crate) phase: UpdatePhase,
    pub(crate) watch: Option<WatchId>,
    pub(crate) reattach_timer: Option<TimerId>,
    pub(crate) bus: Option<BusHandle>,
}

impl UpdateContext {
    pub(crate) fn new(
        id: UpdateId,
        target: NodeId,
        plan: UpdatePlan,
        watch: WatchId,
        bus: BusHandle,
    ) -> Self {
        Self {
            id,
            target,
            plan,
            phase: UpdatePhase::Watching,
            watch: Some(watch),
            reattach_timer: None,
            bus: Some(bus),
        }
    }

    pub fn id(&self) -> UpdateId {
        self.id
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn plan(&self) -> &UpdatePlan {
        &self.plan
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    pub fn is_armed(&self) -> bool {
        self.watch.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(outcome: UpdateOutcome, triggers: &[UpdateTrigger]) -> Vec<(UpdatePhase, UpdateStep)> {
        let mut phase = UpdatePhase::Watching;
        triggers
            .iter()
            .map(|t| {
                let (next, step) = transition(phase, outcome, *t);
                phase = next;
                (next, step)
            })
            .collect()
    }

    #[test]
    fn test_success_cycle() {
        let steps = run(
            UpdateOutcome::Success,
            &[
                UpdateTrigger::Changed { accepted: true },
                UpdateTrigger::Verified,
                UpdateTrigger::OutcomeApplied,
                UpdateTrigger::ReattachDue,
            ],
        );
        assert_eq!(
            steps,
            vec![
                (UpdatePhase::Verifying, UpdateStep::Verify),
                (UpdatePhase::Detached, UpdateStep::Detach),
                (UpdatePhase::Detached, UpdateStep::ScheduleReattach),
                (UpdatePhase::Reattaching, UpdateStep::Reattach),
            ]
        );
    }

    #[test]
    fn test_no_reappear_halts() {
        let steps = run(
            UpdateOutcome::NoReappear,
            &[
                UpdateTrigger::Changed { accepted: true },
                UpdateTrigger::Verified,
                UpdateTrigger::OutcomeApplied,
                UpdateTrigger::ReattachDue,
            ],
        );
        assert_eq!(steps[2], (UpdatePhase::TerminalNoReappear, UpdateStep::Halt));
        assert_eq!(steps[3], (UpdatePhase::TerminalNoReappear, UpdateStep::Ignore));
        assert!(UpdatePhase::TerminalNoReappear.is_terminal());
    }

    #[test]
    fn test_rejected_change_stays_watching() {
        let (phase, step) = transition(
            UpdatePhase::Watching,
            UpdateOutcome::Success,
            UpdateTrigger::Changed { accepted: false },
        );
        assert_eq!(phase, UpdatePhase::Watching);
        assert_eq!(step, UpdateStep::Disarm);
    }

    #[test]
    fn test_out_of_order_triggers_are_ignored() {
        let (phase, step) = transition(
            UpdatePhase::Watching,
            UpdateOutcome::Success,
            UpdateTrigger::ReattachDue,
        );
        assert_eq!((phase, step), (UpdatePhase::Watching, UpdateStep::Ignore));

        let (phase, step) = transition(
            UpdatePhase::Reattaching,
            UpdateOutcome::Success,
            UpdateTrigger::Changed { accepted: true },
        );
        assert_eq!((phase, step), (UpdatePhase::Reattaching, UpdateStep::Ignore));
    }

    #[test]
    fn test_plan_defaults() {
        let plan = UpdatePlan::new("42.23", vec![1, 2, 3]);
        assert_eq!(plan.outcome, UpdateOutcome::Success);
        assert_eq!(plan.reattach_delay, Duration::from_millis(1000));
    }
}
