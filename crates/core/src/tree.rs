// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::component::DeviceRef;
use crate::scheduler;
use crate::testbed::BusHandle;
use hotplug_config::{Topology, TopologyNode};
use std::fmt;
use tracing::debug;

/// Sequential, depth-first identity of a node within one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Everything a node holds while it is on the bus. Kept as one value so the
/// device path, both NVM paths and the bus handle appear and vanish together.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub sysfs_path: String,
    pub nvm_active: String,
    pub nvm_non_active: String,
    pub bus: BusHandle,
}

#[derive(Debug)]
pub struct TreeNode<'t> {
    pub(crate) descriptor: &'t TopologyNode,
    pub(crate) id: NodeId,
    pub(crate) uuid: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<TreeNode<'t>>,
    /// Where the device is created: the parent's path, or the port for the root.
    pub(crate) attach_point: Option<String>,
    pub(crate) attachment: Option<Attachment>,
    pub(crate) nvm_authenticate: u32,
    pub(crate) nvm_version: String,
    pub(crate) device: Option<DeviceRef>,
}

impl<'t> TreeNode<'t> {
    fn new(descriptor: &'t TopologyNode, parent: Option<NodeId>, next_id: &mut u32) -> Self {
        let id = NodeId(*next_id);
        *next_id += 1;

        let uuid = descriptor
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut node = Self {
            descriptor,
            id,
            uuid,
            parent,
            children: Vec::with_capacity(descriptor.children.len()),
            attach_point: None,
            attachment: None,
            nvm_authenticate: 0,
            nvm_version: descriptor.nvm_version.clone(),
            device: None,
        };
        for child in &descriptor.children {
            let child = TreeNode::new(child, Some(id), next_id);
            node.children.push(child);
        }
        node
    }

    pub fn descriptor(&self) -> &'t TopologyNode {
        self.descriptor
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[TreeNode<'t>] {
        &self.children
    }

    pub fn attach_point(&self) -> Option<&str> {
        self.attach_point.as_deref()
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn sysfs_path(&self) -> Option<&str> {
        self.attachment.as_ref().map(|a| a.sysfs_path.as_str())
    }

    pub fn nvm_active(&self) -> Option<&str> {
        self.attachment.as_ref().map(|a| a.nvm_active.as_str())
    }

    pub fn nvm_non_active(&self) -> Option<&str> {
        self.attachment.as_ref().map(|a| a.nvm_non_active.as_str())
    }

    pub fn bus(&self) -> Option<&BusHandle> {
        self.attachment.as_ref().map(|a| &a.bus)
    }

    /// Status the device reports in `nvm_authenticate` when it next attaches.
    pub fn nvm_authenticate(&self) -> u32 {
        self.nvm_authenticate
    }

    pub fn nvm_version(&self) -> &str {
        &self.nvm_version
    }

    pub fn device(&self) -> Option<&DeviceRef> {
        self.device.as_ref()
    }

    pub fn iter(&self) -> Iter<'_, 't> {
        Iter { stack: vec![self] }
    }

    pub fn for_all<P: NodePredicate + ?Sized>(&self, predicate: &P) -> bool {
        predicate.test(self) && self.children.iter().all(|c| c.for_all(predicate))
    }

    pub fn exists<P: NodePredicate + ?Sized>(&self, predicate: &P) -> Option<&TreeNode<'t>> {
        if predicate.test(self) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.exists(predicate))
    }

    pub fn find_by_identity(&self, uuid: &str) -> Option<&TreeNode<'t>> {
        self.exists(&HasUuid(uuid))
    }

    pub fn find_by_identity_mut(&mut self, uuid: &str) -> Option<&mut TreeNode<'t>> {
        if self.uuid == uuid {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|c| c.find_by_identity_mut(uuid))
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode<'t>> {
        self.exists(&|n: &TreeNode<'_>| n.id == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut TreeNode<'t>> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.node_mut(id))
    }

    pub(crate) fn walk_mut(&mut self, visit: &mut impl FnMut(&mut TreeNode<'t>)) {
        visit(self);
        for child in &mut self.children {
            child.walk_mut(visit);
        }
    }

    fn dump(&self, level: usize) {
        let indent = " ".repeat(level);
        match &self.attachment {
            Some(a) => {
                debug!("{} * {} [{}] at {}", indent, self.name(), self.uuid, a.sysfs_path);
                debug!("{}   non-active nvmem at {}", indent, a.nvm_non_active);
                debug!("{}   active nvmem at {}", indent, a.nvm_active);
            }
            None => debug!("{} * {} [{}] {}", indent, self.name(), self.uuid, self.id.0),
        }
        for child in &self.children {
            child.dump(level + 2);
        }
    }
}

/// Depth-first, pre-order traversal.
pub struct Iter<'a, 't> {
    stack: Vec<&'a TreeNode<'t>>,
}

impl<'a, 't> Iterator for Iter<'a, 't> {
    type Item = &'a TreeNode<'t>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// A capability-typed test over tree nodes.
pub trait NodePredicate {
    fn test(&self, node: &TreeNode<'_>) -> bool;
}

impl<F> NodePredicate for F
where
    F: Fn(&TreeNode<'_>) -> bool,
{
    fn test(&self, node: &TreeNode<'_>) -> bool {
        self(node)
    }
}

/// The component has reported a device for this node.
pub struct HasComponentDevice;

impl NodePredicate for HasComponentDevice {
    fn test(&self, node: &TreeNode<'_>) -> bool {
        node.device.is_some()
    }
}

/// Node is off the bus. Panics if the attachment state is inconsistent.
pub struct IsDetached;

impl NodePredicate for IsDetached {
    fn test(&self, node: &TreeNode<'_>) -> bool {
        match &node.attachment {
            None => true,
            Some(a) => {
                assert!(
                    !a.sysfs_path.is_empty()
                        && !a.nvm_active.is_empty()
                        && !a.nvm_non_active.is_empty(),
                    "{} is partially attached: {:?}",
                    node.id,
                    a
                );
                false
            }
        }
    }
}

pub struct IsAttached;

impl NodePredicate for IsAttached {
    fn test(&self, node: &TreeNode<'_>) -> bool {
        !IsDetached.test(node)
    }
}

pub struct HasUuid<'a>(pub &'a str);

impl NodePredicate for HasUuid<'_> {
    fn test(&self, node: &TreeNode<'_>) -> bool {
        node.uuid == self.0
    }
}

/// Live tree instantiated from a [`Topology`].
///
/// Dropping the tree tears it down, so nothing stays registered on the bus
/// after a test case ends.
#[derive(Debug)]
pub struct DeviceTree<'t> {
    topology: &'t Topology,
    root: TreeNode<'t>,
    len: usize,
}

impl<'t> DeviceTree<'t> {
    pub fn instantiate(topology: &'t Topology) -> Self {
        let mut next_id = 0;
        let root = TreeNode::new(&topology.root, None, &mut next_id);
        debug!("instantiated '{}' with {} nodes", topology.name, next_id);
        Self {
            topology,
            root,
            len: next_id as usize,
        }
    }

    pub fn topology(&self) -> &'t Topology {
        self.topology
    }

    pub fn root(&self) -> &TreeNode<'t> {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut TreeNode<'t> {
        &mut self.root
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn iter(&self) -> Iter<'_, 't> {
        self.root.iter()
    }

    pub fn find_by_identity(&self, uuid: &str) -> Option<&TreeNode<'t>> {
        self.root.find_by_identity(uuid)
    }

    pub fn find_by_identity_mut(&mut self, uuid: &str) -> Option<&mut TreeNode<'t>> {
        self.root.find_by_identity_mut(uuid)
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode<'t>> {
        self.root.node(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut TreeNode<'t>> {
        self.root.node_mut(id)
    }

    /// The subtree rooted at `id`; queries on it never look upwards.
    pub fn subtree(&self, id: NodeId) -> Option<&TreeNode<'t>> {
        self.node(id)
    }

    pub fn for_all<P: NodePredicate + ?Sized>(&self, predicate: &P) -> bool {
        self.root.for_all(predicate)
    }

    pub fn exists<P: NodePredicate + ?Sized>(&self, predicate: &P) -> Option<&TreeNode<'t>> {
        self.root.exists(predicate)
    }

    pub fn dump(&self) {
        self.root.dump(0);
    }

    /// Detach everything still on the bus and drop component references.
    /// Safe to call more than once.
    pub fn teardown(&mut self) {
        teardown_node(&mut self.root);
        self.root.walk_mut(&mut |node| node.device = None);
    }
}

fn teardown_node(node: &mut TreeNode<'_>) {
    if node.is_attached() {
        scheduler::detach_subtree(node);
        return;
    }
    for child in &mut node.children {
        teardown_node(child);
    }
}

impl Drop for DeviceTree<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentDevice;
    use crate::fixtures;
    use std::rc::Rc;

    #[test]
    fn test_instantiate_assigns_depth_first_ids() {
        let topology = fixtures::laptop_two_cables();
        let tree = DeviceTree::instantiate(&topology);
        assert_eq!(tree.len(), 5);

        let names: Vec<(u32, &str)> = tree.iter().map(|n| (n.id().0, n.name())).collect();
        assert_eq!(
            names,
            vec![
                (0, "Laptop"),
                (1, "Thunderbolt Cable"),
                (2, "Thunderbolt Dock"),
                (3, "Thunderbolt Cable"),
                (4, "Thunderbolt SSD"),
            ]
        );
        assert_eq!(tree.node(NodeId(2)).unwrap().parent(), Some(NodeId(1)));
        assert_eq!(tree.root().parent(), None);
    }

    #[test]
    fn test_uuids_are_unique_and_findable() {
        let topology = fixtures::laptop_two_cables();
        let tree = DeviceTree::instantiate(&topology);
        let mut uuids: Vec<&str> = tree.iter().map(|n| n.uuid()).collect();
        for uuid in &uuids {
            assert_eq!(tree.find_by_identity(uuid).unwrap().uuid(), *uuid);
        }
        uuids.sort_unstable();
        uuids.dedup();
        assert_eq!(uuids.len(), tree.len());

        assert!(tree.find_by_identity("nonexistent").is_none());
    }

    #[test]
    fn test_fixed_uuid_is_kept() {
        let topology = Topology::new(
            "fixed",
            TopologyNode::new("Laptop", "0x23", "20.2", "20.02").with_uuid("fixed-root"),
        );
        let tree = DeviceTree::instantiate(&topology);
        assert_eq!(tree.root().uuid(), "fixed-root");
    }

    #[test]
    fn test_predicates() {
        let topology = fixtures::laptop_two_cables();
        let mut tree = DeviceTree::instantiate(&topology);
        assert!(tree.for_all(&IsDetached));
        assert!(!tree.for_all(&HasComponentDevice));
        assert!(tree.exists(&IsAttached).is_none());

        let dock = tree.node_mut(NodeId(2)).unwrap();
        let path = "/sys/devices/usb4_port1/0-0/0-1/0-2";
        dock.device = Some(Rc::new(ComponentDevice::new(
            dock.uuid.clone(),
            path,
            "Thunderbolt Dock",
        )));

        let found = tree.exists(&HasComponentDevice).unwrap();
        assert_eq!(found.id(), NodeId(2));
        assert!(tree
            .exists(&|n: &TreeNode<'_>| n.descriptor().id == "0x26")
            .is_some());
        assert!(tree.subtree(NodeId(1)).unwrap().exists(&HasComponentDevice).is_some());
        assert!(tree.subtree(NodeId(3)).unwrap().exists(&HasComponentDevice).is_none());

        tree.teardown();
        assert!(tree.exists(&HasComponentDevice).is_none());
        tree.teardown();
    }
}
