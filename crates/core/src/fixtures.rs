// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Ready-made topologies and payloads.

use hotplug_config::{Topology, TopologyNode};

/// A laptop with two cables plugged in: one ends in a dock, the other in an
/// external SSD. Devices show up 10 to 50 ms after their parent.
pub fn laptop_two_cables() -> Topology {
    let dock_cable = TopologyNode::new("Thunderbolt Cable", "0x24", "20.0", "20.00")
        .with_delay_ms(20)
        .with_child(
            TopologyNode::new("Thunderbolt Dock", "0x25", "10.0", "10.00").with_delay_ms(10),
        );
    let ssd_cable = TopologyNode::new("Thunderbolt Cable", "0x24", "23.0", "23.00")
        .with_delay_ms(20)
        .with_child(
            TopologyNode::new("Thunderbolt SSD", "0x26", "5.0", "05.00").with_delay_ms(20),
        );

    let root = TopologyNode::new("Laptop", "0x23", "20.2", "20.02")
        .with_delay_ms(50)
        .with_child(dock_cable)
        .with_child(ssd_cable);

    Topology::new("laptop-two-cables", root)
}

/// Deterministic firmware image of `len` bytes.
pub fn firmware_payload(len: usize) -> Vec<u8> {
    let mut image = Vec::with_capacity(len);
    let mut state: u32 = 0x2342_0001;
    while image.len() < len {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        image.push((state >> 24) as u8);
    }
    image
}
