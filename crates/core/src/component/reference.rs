// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::{
    Component, ComponentContext, ComponentDevice, ComponentError, DeviceFlags, DeviceRef,
    WriteFlags,
};
use crate::nvm::NVM_SUBSYSTEM;
use crate::signals::Notification;
use crate::testbed::Testbed;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, info};

const DEVTYPE_DEVICE: &str = "thunderbolt_device";
/// Present on devices that only authenticate new firmware once unplugged.
const ON_DISCONNECT: &str = "nvm_authenticate_on_disconnect";

/// Minimal Thunderbolt device manager.
///
/// Adopts every `thunderbolt_device` it is told about, keyed by sysfs path,
/// and implements the write / authenticate / attach cycle through the
/// `nvm_non_active*` region and the `nvm_authenticate` attribute.
#[derive(Debug, Default)]
pub struct ReferenceComponent {
    devices: BTreeMap<String, DeviceRef>,
}

impl ReferenceComponent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRef> {
        self.devices.values()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn lookup(&self, physical_id: &str) -> Option<&DeviceRef> {
        self.devices
            .values()
            .find(|d| d.physical_id() == physical_id)
    }
}

/// Turn a raw `nvm_version` such as `20.2` into the `20.02` form.
///
/// Each component is read as a hex byte and printed as two hex digits, which
/// is how the controller encodes its BCD version.
pub fn parse_version(raw: &str) -> Result<String, ComponentError> {
    let (major, minor) = raw
        .trim()
        .split_once('.')
        .ok_or_else(|| ComponentError::Read(format!("malformed nvm_version '{}'", raw)))?;
    let major = u8::from_str_radix(major, 16)
        .map_err(|e| ComponentError::Read(format!("bad major in '{}': {}", raw, e)))?;
    let minor = u8::from_str_radix(minor, 16)
        .map_err(|e| ComponentError::Read(format!("bad minor in '{}': {}", raw, e)))?;
    Ok(format!("{:02x}.{:02x}", major, minor))
}

fn parse_status(raw: &str) -> Result<u32, ComponentError> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16)
        .map_err(|e| ComponentError::Read(format!("bad nvm_authenticate '{}': {}", raw, e)))
}

fn read_attribute(bed: &Testbed, path: &str, name: &str) -> Result<String, ComponentError> {
    bed.attribute(path, name)
        .map(str::to_string)
        .ok_or_else(|| ComponentError::Read(format!("{} has no attribute '{}'", path, name)))
}

fn non_active_region(bed: &Testbed, path: &str) -> Option<String> {
    bed.children(path)
        .into_iter()
        .find(|d| d.subsystem == NVM_SUBSYSTEM && d.name.starts_with("nvm_non_active"))
        .map(|d| d.sysfs_path.clone())
}

impl Component for ReferenceComponent {
    fn name(&self) -> &str {
        "thunderbolt"
    }

    fn probe(
        &mut self,
        ctx: &mut ComponentContext,
        sysfs_path: &str,
    ) -> Result<DeviceRef, ComponentError> {
        let bus = ctx.bus().clone();
        let bed = bus.borrow();
        let entry = bed
            .device(sysfs_path)
            .ok_or_else(|| ComponentError::NotFound(sysfs_path.to_string()))?;

        let physical_id = entry
            .attributes
            .get("unique_id")
            .cloned()
            .unwrap_or_else(|| sysfs_path.to_string());
        let name = entry
            .attributes
            .get("device_name")
            .cloned()
            .unwrap_or_else(|| entry.name.clone());

        let device = Rc::new(ComponentDevice::new(physical_id, sysfs_path, name));
        if let Some(raw) = entry.attributes.get("nvm_version") {
            device.set_version(parse_version(raw)?);
        }
        Ok(device)
    }

    fn device_added(
        &mut self,
        ctx: &mut ComponentContext,
        device: DeviceRef,
    ) -> Result<(), ComponentError> {
        let path = device.sysfs_path().to_string();
        {
            let bus = ctx.bus().clone();
            let bed = bus.borrow();
            match bed.property(&path, "DEVTYPE") {
                Some(DEVTYPE_DEVICE) => {}
                other => {
                    return Err(ComponentError::NotSupported(format!(
                        "{} has DEVTYPE {:?}",
                        path, other
                    )))
                }
            }
            if non_active_region(&bed, &path).is_some() {
                device.add_flag(DeviceFlags::UPDATABLE);
            }
            if bed.attribute(&path, ON_DISCONNECT).is_some() {
                device.add_flag(DeviceFlags::USABLE_DURING_UPDATE);
            }
        }

        if let Some(stale) = self.devices.insert(path, device.clone()) {
            debug!("{}: replacing stale {}", self.name(), stale.physical_id());
            ctx.emit(Notification::DeviceRemoved(stale));
        }
        debug!(
            "{}: added {} ({}) version {}",
            self.name(),
            device.name(),
            device.physical_id(),
            device.version()
        );
        ctx.emit(Notification::DeviceAdded(device));
        Ok(())
    }

    fn device_removed(&mut self, ctx: &mut ComponentContext, sysfs_path: &str) {
        if let Some(device) = self.devices.remove(sysfs_path) {
            debug!("{}: removed {}", self.name(), device.physical_id());
            ctx.emit(Notification::DeviceRemoved(device));
        }
    }

    fn device_changed(&mut self, ctx: &mut ComponentContext, device: &DeviceRef) {
        let bus = ctx.bus().clone();
        let bed = bus.borrow();
        if bed.attribute(device.sysfs_path(), ON_DISCONNECT).is_some() {
            device.add_flag(DeviceFlags::USABLE_DURING_UPDATE);
        }
        let raw = match bed.attribute(device.sysfs_path(), "nvm_version") {
            Some(raw) => raw,
            None => return,
        };
        match parse_version(raw) {
            Ok(version) => {
                debug!("{}: {} now at {}", self.name(), device.physical_id(), version);
                device.set_version(version);
            }
            Err(e) => debug!("{}: ignoring change: {}", self.name(), e),
        }
    }

    fn write_firmware(
        &mut self,
        ctx: &mut ComponentContext,
        device: &DeviceRef,
        firmware: &[u8],
        flags: WriteFlags,
    ) -> Result<(), ComponentError> {
        if firmware.is_empty() && !flags.contains(WriteFlags::FORCE) {
            return Err(ComponentError::Write("refusing empty image".to_string()));
        }

        let bus = ctx.bus().clone();
        let mut bed = bus.borrow_mut();
        let path = device.sysfs_path();
        let region = non_active_region(&bed, path)
            .ok_or_else(|| ComponentError::NotFound(format!("{} has no non-active NVM", path)))?;
        bed.region_mut(&region)
            .and_then(|r| r.write(firmware).map_err(Into::into))
            .map_err(|e| ComponentError::Write(e.to_string()))?;
        info!(
            "{}: wrote {} bytes to {}",
            self.name(),
            firmware.len(),
            region
        );

        let delayed = device.has_flag(DeviceFlags::USABLE_DURING_UPDATE);
        let trigger = if delayed {
            ON_DISCONNECT
        } else {
            "nvm_authenticate"
        };
        bed.set_attribute(path, trigger, "1")
            .map_err(|e| ComponentError::Write(e.to_string()))?;

        if delayed {
            device.add_flag(DeviceFlags::NEEDS_ACTIVATION);
        }
        Ok(())
    }

    fn attach(
        &mut self,
        ctx: &mut ComponentContext,
        device: &DeviceRef,
    ) -> Result<(), ComponentError> {
        let bus = ctx.bus().clone();
        let bed = bus.borrow();
        let path = device.sysfs_path();
        if !bed.contains(path) {
            return Err(ComponentError::NotFound(path.to_string()));
        }

        let status = parse_status(&read_attribute(&bed, path, "nvm_authenticate")?)?;
        if status != 0 {
            return Err(ComponentError::Internal(format!(
                "update failed (status 0x{:x})",
                status
            )));
        }

        let version = parse_version(&read_attribute(&bed, path, "nvm_version")?)?;
        device.set_version(version);
        device.remove_flag(DeviceFlags::NEEDS_ACTIVATION);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvm::{add_region, NvmBank};
    use crate::testbed::BusHandle;

    fn bus_with_device(status: &str) -> (BusHandle, String) {
        let mut bed = Testbed::new();
        let port = bed
            .add_device("thunderbolt", "usb4_port1", None, &[], &[])
            .unwrap();
        let dev = bed
            .add_device(
                "thunderbolt",
                "0-0",
                Some(&port),
                &[
                    ("device_name", "Laptop"),
                    ("unique_id", "uuid-0"),
                    ("nvm_version", "20.2"),
                    ("nvm_authenticate", status),
                ],
                &[("DEVTYPE", DEVTYPE_DEVICE)],
            )
            .unwrap();
        add_region(&mut bed, &dev, NvmBank::NonActive, 0, 1024).unwrap();
        add_region(&mut bed, &dev, NvmBank::Active, 0, 1024).unwrap();
        (BusHandle::new(bed), dev)
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("20.2").unwrap(), "20.02");
        assert_eq!(parse_version("5.0").unwrap(), "05.00");
        assert_eq!(parse_version("42.23").unwrap(), "42.23");
        assert!(parse_version("twenty").is_err());
        assert!(parse_version("1.zz").is_err());
    }

    #[test]
    fn test_probe_and_add() {
        let (bus, dev) = bus_with_device("0x0");
        let mut component = ReferenceComponent::new();
        let mut ctx = ComponentContext::new(bus);

        let device = component.probe(&mut ctx, &dev).unwrap();
        assert_eq!(device.physical_id(), "uuid-0");
        assert_eq!(device.name(), "Laptop");
        assert_eq!(device.version(), "20.02");

        component.device_added(&mut ctx, device).unwrap();
        assert_eq!(component.device_count(), 1);
        let ids: Vec<&str> = component.devices().map(|d| d.physical_id()).collect();
        assert_eq!(ids, vec!["uuid-0"]);
        assert!(component
            .lookup("uuid-0")
            .unwrap()
            .has_flag(DeviceFlags::UPDATABLE));
        let out = ctx.into_notifications();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Notification::DeviceAdded(_)));
    }

    #[test]
    fn test_port_is_not_supported() {
        let (bus, _) = bus_with_device("0x0");
        let mut component = ReferenceComponent::new();
        let mut ctx = ComponentContext::new(bus);
        let port = component.probe(&mut ctx, "/sys/devices/usb4_port1").unwrap();
        let err = component.device_added(&mut ctx, port).unwrap_err();
        assert!(matches!(err, ComponentError::NotSupported(_)));
        assert!(ctx.into_notifications().is_empty());
    }

    #[test]
    fn test_write_then_attach_reports_status() {
        let (bus, dev) = bus_with_device("0x1");
        let mut component = ReferenceComponent::new();
        let mut ctx = ComponentContext::new(bus.clone());
        let device = component.probe(&mut ctx, &dev).unwrap();

        component
            .write_firmware(&mut ctx, &device, b"image", WriteFlags::NO_SEARCH)
            .unwrap();
        let region = format!("{}/nvm_non_active0", dev);
        assert_eq!(bus.borrow().region(&region).unwrap().contents(), b"image");
        assert_eq!(bus.borrow().attribute(&dev, "nvm_authenticate"), Some("1"));

        bus.borrow_mut()
            .set_attribute(&dev, "nvm_authenticate", "0x1")
            .unwrap();
        let err = component.attach(&mut ctx, &device).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_empty_image_needs_force() {
        let (bus, dev) = bus_with_device("0x0");
        let mut component = ReferenceComponent::new();
        let mut ctx = ComponentContext::new(bus);
        let device = component.probe(&mut ctx, &dev).unwrap();
        assert!(matches!(
            component.write_firmware(&mut ctx, &device, &[], WriteFlags::empty()),
            Err(ComponentError::Write(_))
        ));
        assert!(component
            .write_firmware(&mut ctx, &device, &[], WriteFlags::FORCE)
            .is_ok());
    }

    #[test]
    fn test_removed_emits_notification_once() {
        let (bus, dev) = bus_with_device("0x0");
        let mut component = ReferenceComponent::new();
        let mut ctx = ComponentContext::new(bus);
        let device = component.probe(&mut ctx, &dev).unwrap();
        component.device_added(&mut ctx, device).unwrap();
        component.device_removed(&mut ctx, &dev);
        component.device_removed(&mut ctx, &dev);
        let out = ctx.into_notifications();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Notification::DeviceRemoved(_)));
    }

    #[test]
    fn test_on_disconnect_devices_delay_activation() {
        let (bus, dev) = bus_with_device("0x0");
        let mut component = ReferenceComponent::new();
        let mut ctx = ComponentContext::new(bus.clone());
        let device = component.probe(&mut ctx, &dev).unwrap();
        component.device_added(&mut ctx, device.clone()).unwrap();
        assert!(!device.has_flag(DeviceFlags::USABLE_DURING_UPDATE));

        bus.borrow_mut()
            .set_attribute(&dev, ON_DISCONNECT, "0")
            .unwrap();
        component.device_changed(&mut ctx, &device);
        assert!(device.has_flag(DeviceFlags::USABLE_DURING_UPDATE));

        component
            .write_firmware(&mut ctx, &device, b"image", WriteFlags::NO_SEARCH)
            .unwrap();
        assert_eq!(bus.borrow().attribute(&dev, ON_DISCONNECT), Some("1"));
        assert_eq!(bus.borrow().attribute(&dev, "nvm_authenticate"), Some("0x0"));
        assert!(device.has_flag(DeviceFlags::NEEDS_ACTIVATION));
    }
}
