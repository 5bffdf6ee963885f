// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

#[cfg(test)]
mod integration_tests {
    use crate::component::{ReferenceComponent, WriteFlags};
    use crate::fixtures;
    use crate::scheduler::DEVTYPE_DEVICE;
    use crate::testbed::UeventAction;
    use crate::tree::{DeviceTree, HasComponentDevice, NodeId};
    use crate::update::UpdatePlan;
    use crate::{Harness, HarnessConfig};
    use std::time::Duration;

    fn attached_harness<'t>(
        topology: &'t hotplug_config::Topology,
    ) -> (Harness<ReferenceComponent>, DeviceTree<'t>) {
        let mut harness =
            Harness::new(ReferenceComponent::new(), HarnessConfig::default()).unwrap();
        let mut tree = DeviceTree::instantiate(topology);
        harness.attach(&mut tree).unwrap();
        (harness, tree)
    }

    #[test]
    #[should_panic(expected = "firmware checksum mismatch")]
    fn test_corrupted_transfer_is_fatal() {
        let topology = fixtures::laptop_two_cables();
        let (mut harness, mut tree) = attached_harness(&topology);

        let expected = fixtures::firmware_payload(256);
        harness
            .prepare_for_update(&tree, NodeId(0), UpdatePlan::new("42.23", expected))
            .unwrap();

        let corrupted = fixtures::firmware_payload(255);
        harness
            .write_firmware(&mut tree, NodeId(0), &corrupted, WriteFlags::NO_SEARCH)
            .unwrap();
        let _ = harness.settle(&mut tree);
    }

    #[test]
    fn test_unmatched_device_is_logged_and_ignored() {
        let topology = fixtures::laptop_two_cables();
        let (mut harness, mut tree) = attached_harness(&topology);
        let root_path = tree.root().sysfs_path().unwrap().to_string();

        harness
            .bus()
            .borrow_mut()
            .add_device(
                "thunderbolt",
                "0-99",
                Some(&root_path),
                &[("unique_id", "stranger"), ("nvm_version", "1.0")],
                &[("DEVTYPE", DEVTYPE_DEVICE)],
            )
            .unwrap();
        harness.sync_for(&mut tree, Duration::from_millis(50));

        assert!(tree.find_by_identity("stranger").is_none());
        assert!(tree.for_all(&HasComponentDevice));
        assert_eq!(harness.component().device_count(), tree.len() + 1);
        let last = harness.notifications().last().unwrap();
        assert_eq!(last.physical_id, "stranger");
    }

    #[test]
    fn test_remove_without_reference_is_ignored() {
        let topology = fixtures::laptop_two_cables();
        let (mut harness, mut tree) = attached_harness(&topology);
        let cable = tree.node(NodeId(1)).unwrap().device().unwrap().clone();

        harness.detach(&mut tree, NodeId(1)).unwrap();
        harness.sync_for(&mut tree, Duration::from_millis(10));
        assert!(tree.node(NodeId(1)).unwrap().device().is_none());
        assert!(tree.node(NodeId(3)).unwrap().device().is_some());

        // a second removal for the same identity changes nothing
        assert!(!crate::barrier::track_removed(&mut tree, &cable));
        assert!(tree.node(NodeId(0)).unwrap().device().is_some());
    }

    #[test]
    #[should_panic(expected = "no tree node")]
    fn test_change_for_foreign_device_is_fatal() {
        let topology = fixtures::laptop_two_cables();
        let (mut harness, mut tree) = attached_harness(&topology);
        let path = tree.root().sysfs_path().unwrap().to_string();

        harness
            .bus()
            .borrow_mut()
            .set_attribute(&path, "unique_id", "someone-else")
            .unwrap();
        harness
            .bus()
            .borrow_mut()
            .uevent(&path, UeventAction::Change)
            .unwrap();
        harness.sync_for(&mut tree, Duration::from_millis(10));
    }
}
