// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Contract between the harness and the device manager under test.

pub mod reference;

use crate::signals::Notification;
use crate::testbed::BusHandle;
use bitflags::bitflags;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub use reference::ReferenceComponent;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        const UPDATABLE = 1 << 0;
        /// Written firmware takes effect on the next disconnect.
        const NEEDS_ACTIVATION = 1 << 1;
        const USABLE_DURING_UPDATE = 1 << 2;
        /// The device does not re-enumerate after a write.
        const SKIPS_RESTART = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        const NO_SEARCH = 1 << 0;
        const FORCE = 1 << 1;
    }
}

/// Component-side view of a bus device.
///
/// Shared between the component and the tree node that tracked it, so the
/// mutable parts live behind interior mutability.
#[derive(Debug)]
pub struct ComponentDevice {
    physical_id: String,
    sysfs_path: String,
    name: String,
    version: RefCell<String>,
    flags: Cell<DeviceFlags>,
}

pub type DeviceRef = Rc<ComponentDevice>;

impl ComponentDevice {
    pub fn new(
        physical_id: impl Into<String>,
        sysfs_path: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            physical_id: physical_id.into(),
            sysfs_path: sysfs_path.into(),
            name: name.into(),
            version: RefCell::new(String::new()),
            flags: Cell::new(DeviceFlags::empty()),
        }
    }

    /// Stable identity; matches the `unique_id` attribute.
    pub fn physical_id(&self) -> &str {
        &self.physical_id
    }

    pub fn sysfs_path(&self) -> &str {
        &self.sysfs_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> String {
        self.version.borrow().clone()
    }

    pub fn set_version(&self, version: impl Into<String>) {
        *self.version.borrow_mut() = version.into();
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags.get()
    }

    pub fn has_flag(&self, flag: DeviceFlags) -> bool {
        self.flags.get().contains(flag)
    }

    pub fn add_flag(&self, flag: DeviceFlags) {
        self.flags.set(self.flags.get() | flag);
    }

    pub fn remove_flag(&self, flag: DeviceFlags) {
        self.flags.set(self.flags.get() - flag);
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ComponentError {
    #[error("Not supported: {0}")]
    NotSupported(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Read failed: {0}")]
    Read(String),
    #[error("Write failed: {0}")]
    Write(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl ComponentError {
    pub fn is_internal(&self) -> bool {
        matches!(self, ComponentError::Internal(_))
    }
}

/// What a component sees during one call: the bus, and a place to post
/// notifications. The harness delivers them as soon as the call returns.
pub struct ComponentContext {
    bus: BusHandle,
    outbox: Vec<Notification>,
}

impl ComponentContext {
    pub fn new(bus: BusHandle) -> Self {
        Self {
            bus,
            outbox: Vec::new(),
        }
    }

    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    pub fn emit(&mut self, notification: Notification) {
        self.outbox.push(notification);
    }

    pub fn into_notifications(self) -> Vec<Notification> {
        self.outbox
    }
}

/// A device manager driven by bus events.
///
/// The harness calls `probe` then `device_added` for every `add` uevent it
/// routes, `device_removed` for `remove`, and `device_changed` for `change`.
/// Implementations report devices they adopt or drop through
/// [`ComponentContext::emit`].
pub trait Component {
    fn name(&self) -> &str;

    fn probe(&mut self, ctx: &mut ComponentContext, sysfs_path: &str)
        -> Result<DeviceRef, ComponentError>;

    fn device_added(
        &mut self,
        ctx: &mut ComponentContext,
        device: DeviceRef,
    ) -> Result<(), ComponentError>;

    fn device_removed(&mut self, ctx: &mut ComponentContext, sysfs_path: &str);

    fn device_changed(&mut self, ctx: &mut ComponentContext, device: &DeviceRef);

    fn write_firmware(
        &mut self,
        ctx: &mut ComponentContext,
        device: &DeviceRef,
        firmware: &[u8],
        flags: WriteFlags,
    ) -> Result<(), ComponentError>;

    /// Called once a written image should have been activated.
    fn attach(&mut self, ctx: &mut ComponentContext, device: &DeviceRef)
        -> Result<(), ComponentError>;
}
