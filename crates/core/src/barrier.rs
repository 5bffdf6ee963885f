// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Waits that hand control to the event loop until the tree converges.

use crate::component::{Component, DeviceRef};
use crate::event_loop::SimTime;
use crate::harness::{Dispatch, Harness};
use crate::signals::Interest;
use crate::tree::{DeviceTree, HasComponentDevice};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BarrierError {
    #[error("tree did not settle within {0:?}")]
    Timeout(Duration),
    #[error("tree cannot settle: no pending events at {0}")]
    Stalled(SimTime),
}

/// Record an added device on the node with the same identity.
pub(crate) fn track_added(tree: &mut DeviceTree<'_>, device: &DeviceRef) -> bool {
    match tree.find_by_identity_mut(device.physical_id()) {
        Some(node) => {
            node.device = Some(device.clone());
            true
        }
        None => {
            warn!("Got device that could not be matched: {}", device.physical_id());
            false
        }
    }
}

/// Drop the component reference of the node with the same identity.
pub(crate) fn track_removed(tree: &mut DeviceTree<'_>, device: &DeviceRef) -> bool {
    match tree.find_by_identity_mut(device.physical_id()) {
        None => {
            warn!("Got device that could not be matched: {}", device.physical_id());
            false
        }
        Some(node) if node.device.is_none() => {
            warn!(
                "Got remove event for out-of-tree device {}",
                device.physical_id()
            );
            false
        }
        Some(node) => {
            node.device = None;
            true
        }
    }
}

/// Process events for exactly `timeout` of virtual time, tracking both added
/// and removed devices into the tree.
pub fn sync_for<C: Component>(
    harness: &mut Harness<C>,
    tree: &mut DeviceTree<'_>,
    timeout: Duration,
) {
    let sub = harness.hub_mut().subscribe(Interest::ADDED | Interest::REMOVED);
    let deadline = harness.now() + timeout;

    while let Dispatch::Handled = harness.dispatch_next(tree, deadline) {}
    harness.advance_to(deadline);

    harness.hub_mut().unsubscribe(sub);
    debug!("sync finished at {}", harness.now());
}

/// Process events until a device has been added and every node has a
/// component device. Returns the virtual time it took.
///
/// Bounded by the harness's `settle_timeout_ms`; gives up early with
/// [`BarrierError::Stalled`] when neither the bus nor the timers have
/// anything left that could complete it.
pub fn settle<C: Component>(
    harness: &mut Harness<C>,
    tree: &mut DeviceTree<'_>,
) -> Result<Duration, BarrierError> {
    let sub = harness.hub_mut().subscribe(Interest::ADDED);
    let start = harness.now();
    let timeout = harness.settle_timeout();
    let deadline = start + timeout;
    let adds_before = harness.tracked_adds();

    let result = loop {
        if harness.tracked_adds() > adds_before && tree.for_all(&HasComponentDevice) {
            break Ok(harness.now().saturating_sub(start));
        }
        match harness.dispatch_next(tree, deadline) {
            Dispatch::Handled => {}
            Dispatch::LimitReached => {
                harness.advance_to(deadline);
                break Err(BarrierError::Timeout(timeout));
            }
            Dispatch::Idle => break Err(BarrierError::Stalled(harness.now())),
        }
    };

    harness.hub_mut().unsubscribe(sub);
    match &result {
        Ok(took) => debug!("settled after {:?}", took),
        Err(e) => warn!("settle failed: {}", e),
    }
    result
}
