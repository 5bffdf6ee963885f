// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::nvm::{NvmError, NvmRegion};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;

const SYSFS_ROOT: &str = "/sys/devices";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UeventAction {
    Add,
    Remove,
    Change,
}

impl fmt::Display for UeventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UeventAction::Add => "add",
            UeventAction::Remove => "remove",
            UeventAction::Change => "change",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub action: UeventAction,
    pub sysfs_path: String,
    pub subsystem: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// Something the testbed wants delivered by the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Uevent(Uevent),
    /// A watched attribute was written.
    AttributeChanged {
        watch: WatchId,
        sysfs_path: String,
        attribute: String,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TestbedError {
    #[error("Device already exists at {0}")]
    AlreadyExists(String),
    #[error("No device at {0}")]
    NoSuchDevice(String),
    #[error("Parent device {0} does not exist")]
    MissingParent(String),
    #[error("Device {0} has no NVM region")]
    NoRegion(String),
    #[error(transparent)]
    Nvm(#[from] NvmError),
}

pub type TestbedResult<T> = Result<T, TestbedError>;

/// One registered bus device.
#[derive(Debug)]
pub struct DeviceEntry {
    pub sysfs_path: String,
    pub name: String,
    pub subsystem: String,
    pub parent: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub properties: BTreeMap<String, String>,
    pub region: Option<NvmRegion>,
}

#[derive(Debug)]
struct Watch {
    sysfs_path: String,
    attribute: String,
}

/// In-memory stand-in for the sysfs device hierarchy and its uevent socket.
///
/// Adding a device queues an `add` uevent, like udev would. Removal is silent;
/// callers announce it with [`Testbed::uevent`] first, which is how a real
/// device disappearance looks from userspace.
#[derive(Debug, Default)]
pub struct Testbed {
    devices: BTreeMap<String, DeviceEntry>,
    pending: VecDeque<BusEvent>,
    watches: BTreeMap<WatchId, Watch>,
    next_watch: u64,
    emitted: Vec<Uevent>,
}

impl Testbed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and queue its `add` uevent. Returns the sysfs path.
    pub fn add_device(
        &mut self,
        subsystem: &str,
        name: &str,
        parent: Option<&str>,
        attributes: &[(&str, &str)],
        properties: &[(&str, &str)],
    ) -> TestbedResult<String> {
        let sysfs_path = match parent {
            Some(parent) => {
                if !self.devices.contains_key(parent) {
                    return Err(TestbedError::MissingParent(parent.to_string()));
                }
                format!("{}/{}", parent, name)
            }
            None => format!("{}/{}", SYSFS_ROOT, name),
        };

        if self.devices.contains_key(&sysfs_path) {
            return Err(TestbedError::AlreadyExists(sysfs_path));
        }

        let entry = DeviceEntry {
            sysfs_path: sysfs_path.clone(),
            name: name.to_string(),
            subsystem: subsystem.to_string(),
            parent: parent.map(str::to_string),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            properties: properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            region: None,
        };
        self.devices.insert(sysfs_path.clone(), entry);
        tracing::trace!("testbed: added {} ({})", sysfs_path, subsystem);

        self.uevent(&sysfs_path, UeventAction::Add)?;
        Ok(sysfs_path)
    }

    /// Remove a device and everything below it. No uevent is emitted.
    pub fn remove_device(&mut self, sysfs_path: &str) -> TestbedResult<()> {
        if self.devices.remove(sysfs_path).is_none() {
            return Err(TestbedError::NoSuchDevice(sysfs_path.to_string()));
        }
        let prefix = format!("{}/", sysfs_path);
        self.devices.retain(|path, _| !path.starts_with(&prefix));
        tracing::trace!("testbed: removed {}", sysfs_path);
        Ok(())
    }

    /// Queue a uevent for an existing device.
    pub fn uevent(&mut self, sysfs_path: &str, action: UeventAction) -> TestbedResult<()> {
        let device = self
            .devices
            .get(sysfs_path)
            .ok_or_else(|| TestbedError::NoSuchDevice(sysfs_path.to_string()))?;
        let event = Uevent {
            action,
            sysfs_path: sysfs_path.to_string(),
            subsystem: device.subsystem.clone(),
        };
        self.emitted.push(event.clone());
        self.pending.push_back(BusEvent::Uevent(event));
        Ok(())
    }

    /// Write an attribute. Armed watches on it fire, whatever the value.
    pub fn set_attribute(
        &mut self,
        sysfs_path: &str,
        name: &str,
        value: &str,
    ) -> TestbedResult<()> {
        let device = self
            .devices
            .get_mut(sysfs_path)
            .ok_or_else(|| TestbedError::NoSuchDevice(sysfs_path.to_string()))?;
        device
            .attributes
            .insert(name.to_string(), value.to_string());

        for (id, watch) in &self.watches {
            if watch.sysfs_path == sysfs_path && watch.attribute == name {
                self.pending.push_back(BusEvent::AttributeChanged {
                    watch: *id,
                    sysfs_path: sysfs_path.to_string(),
                    attribute: name.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn attribute(&self, sysfs_path: &str, name: &str) -> Option<&str> {
        self.devices
            .get(sysfs_path)
            .and_then(|d| d.attributes.get(name))
            .map(String::as_str)
    }

    pub fn property(&self, sysfs_path: &str, key: &str) -> Option<&str> {
        self.devices
            .get(sysfs_path)
            .and_then(|d| d.properties.get(key))
            .map(String::as_str)
    }

    pub fn device(&self, sysfs_path: &str) -> Option<&DeviceEntry> {
        self.devices.get(sysfs_path)
    }

    pub fn contains(&self, sysfs_path: &str) -> bool {
        self.devices.contains_key(sysfs_path)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Devices whose parent is `sysfs_path`, in path order.
    pub fn children(&self, sysfs_path: &str) -> Vec<&DeviceEntry> {
        self.devices
            .values()
            .filter(|d| d.parent.as_deref() == Some(sysfs_path))
            .collect()
    }

    pub fn devices_in(&self, subsystem: &str) -> Vec<&DeviceEntry> {
        self.devices
            .values()
            .filter(|d| d.subsystem == subsystem)
            .collect()
    }

    pub(crate) fn set_region(&mut self, sysfs_path: &str, region: NvmRegion) -> TestbedResult<()> {
        let device = self
            .devices
            .get_mut(sysfs_path)
            .ok_or_else(|| TestbedError::NoSuchDevice(sysfs_path.to_string()))?;
        device.region = Some(region);
        Ok(())
    }

    pub fn region(&self, sysfs_path: &str) -> TestbedResult<&NvmRegion> {
        let device = self
            .devices
            .get(sysfs_path)
            .ok_or_else(|| TestbedError::NoSuchDevice(sysfs_path.to_string()))?;
        device
            .region
            .as_ref()
            .ok_or_else(|| TestbedError::NoRegion(sysfs_path.to_string()))
    }

    pub fn region_mut(&mut self, sysfs_path: &str) -> TestbedResult<&mut NvmRegion> {
        let device = self
            .devices
            .get_mut(sysfs_path)
            .ok_or_else(|| TestbedError::NoSuchDevice(sysfs_path.to_string()))?;
        device
            .region
            .as_mut()
            .ok_or_else(|| TestbedError::NoRegion(sysfs_path.to_string()))
    }

    /// Arm a change watch on an attribute file. It stays armed until cancelled.
    pub fn watch_attribute(&mut self, sysfs_path: &str, attribute: &str) -> TestbedResult<WatchId> {
        if !self.devices.contains_key(sysfs_path) {
            return Err(TestbedError::NoSuchDevice(sysfs_path.to_string()));
        }
        let id = WatchId(self.next_watch);
        self.next_watch += 1;
        self.watches.insert(
            id,
            Watch {
                sysfs_path: sysfs_path.to_string(),
                attribute: attribute.to_string(),
            },
        );
        Ok(id)
    }

    /// Returns false if the watch was not armed.
    pub fn cancel_watch(&mut self, id: WatchId) -> bool {
        self.watches.remove(&id).is_some()
    }

    pub fn is_watch_armed(&self, id: WatchId) -> bool {
        self.watches.contains_key(&id)
    }

    pub fn pop_event(&mut self) -> Option<BusEvent> {
        self.pending.pop_front()
    }

    pub fn has_pending_events(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Every uevent queued so far, in order.
    pub fn uevent_log(&self) -> &[Uevent] {
        &self.emitted
    }
}

/// Shared, reference-counted handle to the testbed.
///
/// Every attached tree node holds one, as do the harness and live update
/// contexts; the testbed goes away with the last holder.
#[derive(Debug, Clone, Default)]
pub struct BusHandle(Rc<RefCell<Testbed>>);

impl BusHandle {
    pub fn new(testbed: Testbed) -> Self {
        Self(Rc::new(RefCell::new(testbed)))
    }

    pub fn borrow(&self) -> Ref<'_, Testbed> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Testbed> {
        self.0.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &BusHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live holders of this handle.
    pub fn holders(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}
