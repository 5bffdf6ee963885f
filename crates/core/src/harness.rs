// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::barrier::{self, BarrierError};
use crate::component::{Component, ComponentContext, ComponentError, WriteFlags};
use crate::event_loop::{EventLoop, SimTime, Task};
use crate::signals::{Notification, NotificationHub, NotificationRecord};
use crate::testbed::{BusEvent, BusHandle, Testbed, Uevent, UeventAction, WatchId};
use crate::tree::{DeviceTree, NodeId};
use crate::update::{
    self, UpdateContext, UpdateId, UpdatePhase, UpdatePlan, UpdateStep, UpdateTrigger,
};
use crate::{scheduler, HarnessError, HarnessResult};
use hotplug_config::{HarnessConfig, UpdateOutcome};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Result of one turn of the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A bus event or a timer was processed.
    Handled,
    /// Timers remain, but none is due before the limit.
    LimitReached,
    /// Nothing left to process at all.
    Idle,
}

/// Drives a [`Component`] against a simulated bus.
///
/// The harness owns the testbed handle, the event loop and the update
/// contexts. Trees are passed in by the caller, who owns them.
pub struct Harness<C: Component> {
    bus: BusHandle,
    events: EventLoop,
    component: C,
    hub: NotificationHub,
    updates: BTreeMap<UpdateId, UpdateContext>,
    next_update: u64,
    tracked_adds: u64,
    config: HarnessConfig,
    nvm_capacity: usize,
}

impl<C: Component> Harness<C> {
    pub fn new(component: C, config: HarnessConfig) -> HarnessResult<Self> {
        config
            .validate()
            .map_err(|e| HarnessError::Config(format!("{:#}", e)))?;
        let nvm_capacity = config
            .nvm_capacity_bytes()
            .map_err(|e| HarnessError::Config(format!("{:#}", e)))? as usize;

        info!(
            "harness for '{}' (subsystems {:?}, NVM capacity {} bytes)",
            component.name(),
            config.subsystems,
            nvm_capacity
        );

        Ok(Self {
            bus: BusHandle::new(Testbed::new()),
            events: EventLoop::new(),
            component,
            hub: NotificationHub::new(),
            updates: BTreeMap::new(),
            next_update: 0,
            tracked_adds: 0,
            config,
            nvm_capacity,
        })
    }

    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    pub fn now(&self) -> SimTime {
        self.events.now()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn component(&self) -> &C {
        &self.component
    }

    /// Every notification the component has emitted so far.
    pub fn notifications(&self) -> &[NotificationRecord] {
        self.hub.history()
    }

    pub fn pending_timers(&self) -> usize {
        self.events.pending()
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.config.settle_timeout_ms)
    }

    pub(crate) fn hub_mut(&mut self) -> &mut NotificationHub {
        &mut self.hub
    }

    pub(crate) fn tracked_adds(&self) -> u64 {
        self.tracked_adds
    }

    pub(crate) fn advance_to(&mut self, at: SimTime) {
        self.events.advance_to(at);
    }

    /// Create the port the root attaches to, if it is not there yet.
    pub fn ensure_port(&mut self) -> HarnessResult<String> {
        Ok(scheduler::ensure_port(&self.bus, &self.config.port_name)?)
    }

    /// Create the port and schedule the root, without waiting.
    ///
    /// # Panics
    ///
    /// If the port cannot be created.
    pub fn attach_root(&mut self, tree: &mut DeviceTree<'_>) {
        let port = self
            .ensure_port()
            .unwrap_or_else(|e| panic!("failed to create port: {}", e));
        let root = tree.root_mut();
        root.attach_point = Some(port);
        scheduler::schedule_attach(&mut self.events, root);
    }

    /// Attach the whole tree and wait for the component to report every node.
    pub fn attach(&mut self, tree: &mut DeviceTree<'_>) -> Result<Duration, BarrierError> {
        self.attach_root(tree);
        self.settle(tree)
    }

    /// Schedule a detached node whose attach point is known, e.g. after a
    /// manual [`Harness::detach`]. Nodes that are attached, or already on
    /// their way, are refused.
    pub fn schedule_attach(&mut self, tree: &DeviceTree<'_>, id: NodeId) -> HarnessResult<()> {
        let node = tree.node(id).ok_or(HarnessError::UnknownNode(id))?;
        if node.is_attached() || self.events.is_scheduled(Task::Attach(id)) {
            return Err(HarnessError::AlreadyAttached(id));
        }
        if node.attach_point().is_none() {
            return Err(HarnessError::NoAttachPoint(id));
        }
        scheduler::schedule_attach(&mut self.events, node);
        Ok(())
    }

    pub fn detach(&mut self, tree: &mut DeviceTree<'_>, id: NodeId) -> HarnessResult<()> {
        let node = tree.node_mut(id).ok_or(HarnessError::UnknownNode(id))?;
        scheduler::detach_subtree(node);
        Ok(())
    }

    pub fn settle(&mut self, tree: &mut DeviceTree<'_>) -> Result<Duration, BarrierError> {
        barrier::settle(self, tree)
    }

    pub fn sync_for(&mut self, tree: &mut DeviceTree<'_>, timeout: Duration) {
        barrier::sync_for(self, tree, timeout)
    }

    /// Write a bus attribute of an attached node.
    pub fn set_attribute(
        &mut self,
        tree: &DeviceTree<'_>,
        id: NodeId,
        name: &str,
        value: &str,
    ) -> HarnessResult<()> {
        let path = self.attached_path(tree, id)?;
        self.bus.borrow_mut().set_attribute(&path, name, value)?;
        Ok(())
    }

    /// Queue a uevent for an attached node.
    pub fn uevent(
        &mut self,
        tree: &DeviceTree<'_>,
        id: NodeId,
        action: UeventAction,
    ) -> HarnessResult<()> {
        let path = self.attached_path(tree, id)?;
        self.bus.borrow_mut().uevent(&path, action)?;
        Ok(())
    }

    fn attached_path(&self, tree: &DeviceTree<'_>, id: NodeId) -> HarnessResult<String> {
        let node = tree.node(id).ok_or(HarnessError::UnknownNode(id))?;
        node.sysfs_path()
            .map(str::to_string)
            .ok_or(HarnessError::NotAttached(id))
    }

    /// Arm the update watch on an attached node.
    pub fn prepare_for_update(
        &mut self,
        tree: &DeviceTree<'_>,
        id: NodeId,
        plan: UpdatePlan,
    ) -> HarnessResult<UpdateId> {
        let path = self.attached_path(tree, id)?;
        let watch = self
            .bus
            .borrow_mut()
            .watch_attribute(&path, "nvm_authenticate")?;

        let update = UpdateId(self.next_update);
        self.next_update += 1;
        debug!(
            "{} prepared for {} -> {} ({:?})",
            update, id, plan.version, plan.outcome
        );
        self.updates.insert(
            update,
            UpdateContext::new(update, id, plan, watch, self.bus.clone()),
        );
        Ok(update)
    }

    pub fn set_outcome(&mut self, update: UpdateId, outcome: UpdateOutcome) -> HarnessResult<()> {
        let ctx = self
            .updates
            .get_mut(&update)
            .ok_or(HarnessError::UnknownUpdate(update))?;
        ctx.plan.outcome = outcome;
        Ok(())
    }

    /// Re-arm a watch that was consumed by a non-qualifying change.
    pub fn rearm(&mut self, tree: &DeviceTree<'_>, update: UpdateId) -> HarnessResult<()> {
        let target = self
            .updates
            .get(&update)
            .ok_or(HarnessError::UnknownUpdate(update))?
            .target;
        let path = self.attached_path(tree, target)?;

        let ctx = self
            .updates
            .get_mut(&update)
            .ok_or(HarnessError::UnknownUpdate(update))?;
        if ctx.phase != UpdatePhase::Watching || ctx.watch.is_some() {
            return Ok(());
        }
        ctx.watch = Some(
            self.bus
                .borrow_mut()
                .watch_attribute(&path, "nvm_authenticate")?,
        );
        debug!("{} re-armed", update);
        Ok(())
    }

    pub fn update(&self, update: UpdateId) -> Option<&UpdateContext> {
        self.updates.get(&update)
    }

    pub fn update_phase(&self, update: UpdateId) -> Option<UpdatePhase> {
        self.updates.get(&update).map(|ctx| ctx.phase)
    }

    /// Drop an update context, cancelling its watch and pending reattach.
    pub fn release_update(&mut self, update: UpdateId) -> bool {
        let ctx = match self.updates.remove(&update) {
            Some(ctx) => ctx,
            None => return false,
        };
        if let Some(watch) = ctx.watch {
            self.bus.borrow_mut().cancel_watch(watch);
        }
        if let Some(timer) = ctx.reattach_timer {
            self.events.cancel(timer);
        }
        true
    }

    /// Ask the component to write `firmware` to the node's device.
    pub fn write_firmware(
        &mut self,
        tree: &mut DeviceTree<'_>,
        id: NodeId,
        firmware: &[u8],
        flags: WriteFlags,
    ) -> Result<(), ComponentError> {
        let device = tree
            .node(id)
            .and_then(|n| n.device().cloned())
            .ok_or_else(|| ComponentError::NotFound(format!("no component device for {}", id)))?;

        let mut ctx = ComponentContext::new(self.bus.clone());
        let result = self
            .component
            .write_firmware(&mut ctx, &device, firmware, flags);
        self.deliver(tree, ctx.into_notifications());
        result
    }

    /// Ask the component to activate whatever was written to the node.
    pub fn attach_device(
        &mut self,
        tree: &mut DeviceTree<'_>,
        id: NodeId,
    ) -> Result<(), ComponentError> {
        let device = tree
            .node(id)
            .and_then(|n| n.device().cloned())
            .ok_or_else(|| ComponentError::NotFound(format!("no component device for {}", id)))?;

        let mut ctx = ComponentContext::new(self.bus.clone());
        let result = self.component.attach(&mut ctx, &device);
        self.deliver(tree, ctx.into_notifications());
        result
    }

    /// Process one bus event, or failing that the next timer due by `limit`.
    ///
    /// Bus events are always drained before the clock moves.
    pub fn dispatch_next(&mut self, tree: &mut DeviceTree<'_>, limit: SimTime) -> Dispatch {
        let event = self.bus.borrow_mut().pop_event();
        if let Some(event) = event {
            match event {
                BusEvent::Uevent(uevent) => self.route_uevent(tree, uevent),
                BusEvent::AttributeChanged {
                    watch, sysfs_path, ..
                } => self.on_watch(tree, watch, &sysfs_path),
            }
            return Dispatch::Handled;
        }

        if let Some((_, task)) = self.events.pop_due(limit) {
            trace!("{}: running {:?}", self.events.now(), task);
            match task {
                Task::Attach(id) => {
                    let node = tree
                        .node_mut(id)
                        .unwrap_or_else(|| panic!("timer for unknown {}", id));
                    scheduler::materialize(node, &self.bus, self.nvm_capacity, &mut self.events);
                }
                Task::Reattach(update) => {
                    if let Some(ctx) = self.updates.get_mut(&update) {
                        ctx.reattach_timer = None;
                    }
                    self.advance_update(tree, update, UpdateTrigger::ReattachDue);
                }
            }
            return Dispatch::Handled;
        }

        if self.events.next_due().is_some() {
            Dispatch::LimitReached
        } else {
            Dispatch::Idle
        }
    }

    fn route_uevent(&mut self, tree: &mut DeviceTree<'_>, uevent: Uevent) {
        if !self.config.subsystems.iter().any(|s| *s == uevent.subsystem) {
            trace!("ignoring {} of {} ({})", uevent.action, uevent.sysfs_path, uevent.subsystem);
            return;
        }
        debug!("uevent {} {}", uevent.action, uevent.sysfs_path);

        let mut ctx = ComponentContext::new(self.bus.clone());
        match uevent.action {
            UeventAction::Add => match self.component.probe(&mut ctx, &uevent.sysfs_path) {
                Ok(device) => {
                    if let Err(e) = self.component.device_added(&mut ctx, device) {
                        debug!("failed to add {}: {}", uevent.sysfs_path, e);
                    }
                }
                Err(e) => warn!("failed to probe {}: {}", uevent.sysfs_path, e),
            },
            UeventAction::Remove => self.component.device_removed(&mut ctx, &uevent.sysfs_path),
            UeventAction::Change => {
                let unique_id = self
                    .bus
                    .borrow()
                    .attribute(&uevent.sysfs_path, "unique_id")
                    .map(str::to_string)
                    .unwrap_or_else(|| panic!("{} has no unique_id", uevent.sysfs_path));
                let node = tree
                    .find_by_identity(&unique_id)
                    .unwrap_or_else(|| panic!("no tree node for {}", unique_id));
                let device = node
                    .device()
                    .cloned()
                    .unwrap_or_else(|| panic!("{} has no component device", node.id()));
                self.component.device_changed(&mut ctx, &device);
            }
        }
        self.deliver(tree, ctx.into_notifications());
    }

    fn deliver(&mut self, tree: &mut DeviceTree<'_>, notifications: Vec<Notification>) {
        let now = self.events.now();
        for notification in notifications {
            if !self.hub.record(now, &notification) {
                continue;
            }
            match &notification {
                Notification::DeviceAdded(device) => {
                    if barrier::track_added(tree, device) {
                        self.tracked_adds += 1;
                    }
                }
                Notification::DeviceRemoved(device) => {
                    barrier::track_removed(tree, device);
                }
            }
        }
    }

    fn on_watch(&mut self, tree: &mut DeviceTree<'_>, watch: WatchId, sysfs_path: &str) {
        let update = match self
            .updates
            .values()
            .find(|ctx| ctx.watch == Some(watch))
            .map(|ctx| ctx.id)
        {
            Some(update) => update,
            None => {
                trace!("stale {} on {}", watch, sysfs_path);
                return;
            }
        };

        debug!("Got update trigger for {}", update);
        let content = self
            .bus
            .borrow()
            .attribute(sysfs_path, "nvm_authenticate")
            .unwrap_or_default()
            .to_string();

        // one-shot: consumed whatever the content
        let cancelled = self.bus.borrow_mut().cancel_watch(watch);
        assert!(cancelled, "{} was not armed", watch);
        if let Some(ctx) = self.updates.get_mut(&update) {
            ctx.watch = None;
        }

        let accepted = content.starts_with('1');
        self.advance_update(tree, update, UpdateTrigger::Changed { accepted });
    }

    fn advance_update(
        &mut self,
        tree: &mut DeviceTree<'_>,
        update: UpdateId,
        trigger: UpdateTrigger,
    ) {
        let mut next = Some(trigger);
        while let Some(trigger) = next.take() {
            let ctx = match self.updates.get_mut(&update) {
                Some(ctx) => ctx,
                None => return,
            };
            let (phase, step) = update::transition(ctx.phase, ctx.plan.outcome, trigger);
            trace!("{}: {:?} --{:?}--> {:?} ({:?})", update, ctx.phase, trigger, phase, step);
            ctx.phase = phase;

            let node = tree
                .node_mut(ctx.target)
                .unwrap_or_else(|| panic!("{} targets unknown {}", update, ctx.target));

            match step {
                UpdateStep::Ignore => {
                    warn!("{}: ignoring {:?} in {:?}", update, trigger, phase);
                }
                UpdateStep::Disarm => {
                    debug!("{}: change did not start with '1', watch disarmed", update);
                }
                UpdateStep::Verify => {
                    let region = node
                        .nvm_non_active()
                        .unwrap_or_else(|| panic!("{} lost its NVM before verification", node.id()))
                        .to_string();
                    let bed = self.bus.borrow();
                    let nvm = bed
                        .region(&region)
                        .unwrap_or_else(|e| panic!("cannot read {}: {}", region, e));
                    assert!(
                        nvm.verify(&ctx.plan.firmware),
                        "firmware checksum mismatch on {}: expected {}, found {}",
                        region,
                        crate::nvm::checksum(&ctx.plan.firmware),
                        nvm.checksum()
                    );
                    next = Some(UpdateTrigger::Verified);
                }
                UpdateStep::Detach => {
                    debug!(
                        "Removing tree below and including: {}",
                        node.sysfs_path().unwrap_or("<detached>")
                    );
                    scheduler::detach_subtree(node);
                    node.nvm_authenticate = ctx.plan.outcome.code();
                    if ctx.plan.outcome == UpdateOutcome::Success {
                        node.nvm_version = ctx.plan.version.clone();
                    }
                    info!(
                        "Simulating update to '{}' with result: 0x{:x}",
                        ctx.plan.version, node.nvm_authenticate
                    );
                    next = Some(UpdateTrigger::OutcomeApplied);
                }
                UpdateStep::Halt => {
                    info!("{}: device tree will not reappear", update);
                    ctx.bus = None;
                }
                UpdateStep::ScheduleReattach => {
                    debug!(
                        "Device tree reattachment in {:?}",
                        ctx.plan.reattach_delay
                    );
                    ctx.reattach_timer = Some(
                        self.events
                            .add_timeout(ctx.plan.reattach_delay, Task::Reattach(update)),
                    );
                }
                UpdateStep::Reattach => {
                    debug!("Mock update done, reattaching tree...");
                    scheduler::schedule_attach(&mut self.events, node);
                    ctx.bus = None;
                }
            }
        }
    }
}
