// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::component::DeviceRef;
use crate::event_loop::SimTime;
use bitflags::bitflags;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

bitflags! {
    /// Notification kinds a subscriber wants to see.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const ADDED = 0b01;
        const REMOVED = 0b10;
    }
}

/// Something the component under test announced.
#[derive(Debug, Clone)]
pub enum Notification {
    DeviceAdded(DeviceRef),
    DeviceRemoved(DeviceRef),
}

impl Notification {
    pub fn device(&self) -> &DeviceRef {
        match self {
            Notification::DeviceAdded(dev) | Notification::DeviceRemoved(dev) => dev,
        }
    }

    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::DeviceAdded(_) => NotificationKind::Added,
            Notification::DeviceRemoved(_) => NotificationKind::Removed,
        }
    }

    fn interest(&self) -> Interest {
        match self {
            Notification::DeviceAdded(_) => Interest::ADDED,
            Notification::DeviceRemoved(_) => Interest::REMOVED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Added,
    Removed,
}

/// History entry; kept after the device itself is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationRecord {
    pub at_ms: u64,
    pub kind: NotificationKind,
    pub physical_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Explicit subscriptions to component notifications.
///
/// Whoever subscribes owns the handle and must give it back with
/// [`NotificationHub::unsubscribe`]; there is no process-wide default handler.
#[derive(Debug, Default)]
pub struct NotificationHub {
    subscriptions: BTreeMap<SubscriptionId, Interest>,
    next_id: u64,
    history: Vec<NotificationRecord>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, interest: Interest) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscriptions.insert(id, interest);
        tracing::trace!("{} subscribed to {:?}", id, interest);
        id
    }

    /// Returns false if the handle was already released.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Union of what all live subscribers asked for.
    pub fn active_interest(&self) -> Interest {
        self.subscriptions
            .values()
            .fold(Interest::empty(), |acc, i| acc | *i)
    }

    /// Log a notification and report whether any subscriber wants it.
    pub fn record(&mut self, at: SimTime, notification: &Notification) -> bool {
        self.history.push(NotificationRecord {
            at_ms: at.as_millis(),
            kind: notification.kind(),
            physical_id: notification.device().physical_id().to_string(),
        });
        self.active_interest().intersects(notification.interest())
    }

    pub fn history(&self) -> &[NotificationRecord] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentDevice;
    use std::rc::Rc;

    fn device(id: &str) -> DeviceRef {
        Rc::new(ComponentDevice::new(id, "/sys/devices/usb4_port1/0-0", "Laptop"))
    }

    #[test]
    fn test_interest_follows_subscriptions() {
        let mut hub = NotificationHub::new();
        assert!(hub.active_interest().is_empty());

        let added = hub.subscribe(Interest::ADDED);
        let both = hub.subscribe(Interest::ADDED | Interest::REMOVED);
        assert_eq!(hub.active_interest(), Interest::all());

        assert!(hub.unsubscribe(both));
        assert!(!hub.unsubscribe(both));
        assert_eq!(hub.active_interest(), Interest::ADDED);

        assert!(hub.unsubscribe(added));
        assert_eq!(hub.subscription_count(), 0);
    }

    #[test]
    fn test_record_keeps_history_without_subscribers() {
        let mut hub = NotificationHub::new();
        let dev = device("uuid-a");
        assert!(!hub.record(SimTime::ZERO, &Notification::DeviceAdded(dev.clone())));

        let sub = hub.subscribe(Interest::ADDED);
        assert!(hub.record(SimTime::ZERO, &Notification::DeviceAdded(dev.clone())));
        assert!(!hub.record(SimTime::ZERO, &Notification::DeviceRemoved(dev)));
        hub.unsubscribe(sub);

        assert_eq!(hub.history().len(), 3);
        assert_eq!(hub.history()[2].kind, NotificationKind::Removed);
        assert_eq!(hub.history()[0].physical_id, "uuid-a");
    }
}
