// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::testbed::{Testbed, TestbedResult, UeventAction};
use hotplug_config::TopologyNode;
use sha2::{Digest, Sha256};

pub const NVM_SUBSYSTEM: &str = "nvmem";

/// Which firmware bank a region represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmBank {
    /// Currently running image.
    Active,
    /// Staging area firmware writes land in.
    NonActive,
}

impl NvmBank {
    pub fn region_name(self, id: u32) -> String {
        match self {
            NvmBank::Active => format!("nvm_active{}", id),
            NvmBank::NonActive => format!("nvm_non_active{}", id),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NvmError {
    #[error("Write of {len} bytes at offset {offset} exceeds region capacity {capacity}")]
    Overflow {
        offset: usize,
        len: usize,
        capacity: usize,
    },
}

/// A bounded, memory-backed firmware bank.
#[derive(Debug, Clone)]
pub struct NvmRegion {
    data: Vec<u8>,
    capacity: usize,
}

impl NvmRegion {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Replace the whole region.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), NvmError> {
        if bytes.len() > self.capacity {
            return Err(NvmError::Overflow {
                offset: 0,
                len: bytes.len(),
                capacity: self.capacity,
            });
        }
        self.data.clear();
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), NvmError> {
        if self.data.len() + bytes.len() > self.capacity {
            return Err(NvmError::Overflow {
                offset: self.data.len(),
                len: bytes.len(),
                capacity: self.capacity,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn checksum(&self) -> String {
        checksum(&self.data)
    }

    /// True if the region holds exactly `expected`.
    pub fn verify(&self, expected: &[u8]) -> bool {
        self.checksum() == checksum(expected)
    }
}

/// SHA-256 of `bytes` as lowercase hex.
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Create an empty region as an `nvmem` child of `parent`.
pub fn add_region(
    bed: &mut Testbed,
    parent: &str,
    bank: NvmBank,
    id: u32,
    capacity: usize,
) -> TestbedResult<String> {
    let path = bed.add_device(NVM_SUBSYSTEM, &bank.region_name(id), Some(parent), &[], &[])?;
    bed.set_region(&path, NvmRegion::new(capacity))?;
    Ok(path)
}

/// Announce and remove a region.
pub fn remove_region(bed: &mut Testbed, path: &str) -> TestbedResult<()> {
    bed.uevent(path, UeventAction::Remove)?;
    bed.remove_device(path)
}

/// Deterministic stand-in for the image a controller ships with.
pub fn controller_image(node: &TopologyNode) -> Vec<u8> {
    let mut image = Vec::with_capacity(64);
    image.extend_from_slice(b"TBTFW\0");
    image.extend_from_slice(node.id.as_bytes());
    image.push(0);
    image.extend_from_slice(node.nvm_version.as_bytes());
    image.push(0);
    image.extend_from_slice(node.name.as_bytes());
    image
}
