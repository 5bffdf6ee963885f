// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Root-to-leaf materialization of tree nodes on the testbed.
//!
//! A node's delay is measured from the moment its own attach is scheduled,
//! and children are only scheduled once their parent is on the bus. Sibling
//! subtrees interleave freely.

use crate::event_loop::{EventLoop, Task, TimerId};
use crate::nvm::{self, NvmBank};
use crate::testbed::{BusHandle, TestbedError, UeventAction};
use crate::tree::{Attachment, TreeNode};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEVICE_SUBSYSTEM: &str = "thunderbolt";
pub const DEVTYPE_DEVICE: &str = "thunderbolt_device";
pub const DEVTYPE_PORT: &str = "thunderbolt_usb4_port";

/// Arm the attach timer for `node`.
pub fn schedule_attach(events: &mut EventLoop, node: &TreeNode<'_>) -> TimerId {
    let delay = Duration::from_millis(node.descriptor.delay_ms);
    debug!("scheduling {} ({}) in {:?}", node.name(), node.id, delay);
    events.add_timeout(delay, Task::Attach(node.id))
}

/// Create the synthetic port the root device hangs off, unless it exists.
pub fn ensure_port(bus: &BusHandle, name: &str) -> Result<String, TestbedError> {
    let mut bed = bus.borrow_mut();
    let existing = bed
        .devices_in(DEVICE_SUBSYSTEM)
        .into_iter()
        .find(|d| d.parent.is_none() && d.name == name)
        .map(|d| d.sysfs_path.clone());
    match existing {
        Some(path) => Ok(path),
        None => bed.add_device(
            DEVICE_SUBSYSTEM,
            name,
            None,
            &[("security", "secure")],
            &[("DEVTYPE", DEVTYPE_PORT)],
        ),
    }
}

/// Put `node` on the bus and schedule its children. Returns the device path.
///
/// # Panics
///
/// If the node is already attached, has no attach point, or the testbed
/// refuses any of the registrations. All of these mean the harness itself
/// is broken.
pub fn materialize(
    node: &mut TreeNode<'_>,
    bus: &BusHandle,
    nvm_capacity: usize,
    events: &mut EventLoop,
) -> String {
    assert!(!node.is_attached(), "{} is already attached", node.id);
    let parent = node
        .attach_point
        .clone()
        .unwrap_or_else(|| panic!("{} has no attach point", node.id));

    let name = format!("{}-{}", node.descriptor.domain_id, node.id.0);
    let status = format!("0x{:x}", node.nvm_authenticate);
    let sysfs_id = node.id.0;

    let attachment = {
        let mut bed = bus.borrow_mut();
        let sysfs_path = bed
            .add_device(
                DEVICE_SUBSYSTEM,
                &name,
                Some(&parent),
                &[
                    ("device_name", node.descriptor.name.as_str()),
                    ("device", node.descriptor.id.as_str()),
                    ("vendor", "042"),
                    ("vendor_name", "GNOME.org"),
                    ("authorized", "1"),
                    ("nvm_authenticate", status.as_str()),
                    ("nvm_version", node.nvm_version.as_str()),
                    ("unique_id", node.uuid.as_str()),
                ],
                &[("DEVTYPE", DEVTYPE_DEVICE)],
            )
            .unwrap_or_else(|e| panic!("failed to add {}: {}", name, e));

        let nvm_non_active =
            nvm::add_region(&mut bed, &sysfs_path, NvmBank::NonActive, sysfs_id, nvm_capacity)
                .unwrap_or_else(|e| panic!("failed to add non-active NVM for {}: {}", name, e));
        let nvm_active =
            nvm::add_region(&mut bed, &sysfs_path, NvmBank::Active, sysfs_id, nvm_capacity)
                .unwrap_or_else(|e| panic!("failed to add active NVM for {}: {}", name, e));

        bed.region_mut(&nvm_active)
            .and_then(|r| r.append(&nvm::controller_image(node.descriptor)).map_err(Into::into))
            .unwrap_or_else(|e| panic!("failed to write controller image for {}: {}", name, e));

        Attachment {
            sysfs_path,
            nvm_active,
            nvm_non_active,
            bus: bus.clone(),
        }
    };

    let path = attachment.sysfs_path.clone();
    debug!("attached {} [{}] at {}", node.name(), node.uuid, path);
    node.attachment = Some(attachment);

    for child in &mut node.children {
        child.attach_point = Some(path.clone());
        schedule_attach(events, child);
    }
    path
}

/// Take `node` and everything below it off the bus, leaves first.
///
/// Each device announces its NVM regions and then itself with a `remove`
/// uevent before it is unregistered. Nodes that are already detached are
/// skipped.
pub fn detach_subtree(node: &mut TreeNode<'_>) {
    let attachment = match node.attachment.take() {
        Some(a) => a,
        None => return,
    };

    for child in &mut node.children {
        detach_subtree(child);
        child.attach_point = None;
    }

    let mut bed = attachment.bus.borrow_mut();
    for region in [&attachment.nvm_active, &attachment.nvm_non_active] {
        if let Err(e) = nvm::remove_region(&mut bed, region) {
            warn!("failed to remove {}: {}", region, e);
        }
    }
    let removed = bed
        .uevent(&attachment.sysfs_path, UeventAction::Remove)
        .and_then(|_| bed.remove_device(&attachment.sysfs_path));
    if let Err(e) = removed {
        warn!("failed to remove {}: {}", attachment.sysfs_path, e);
    }
    debug!("detached {} from {}", node.name(), attachment.sysfs_path);
}
