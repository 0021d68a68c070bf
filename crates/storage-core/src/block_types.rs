// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use crate::raid::RaidLevel;
use crate::table::PartitionTable;
use crate::{ACell, ACellOwner};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub enum BlockNode {
    Disk(Arc<ACell<DiskNode>>),
    Partition(Arc<ACell<PartitionNode>>),
    Array(Arc<ACell<ArrayNode>>),
    DeviceMap(Arc<ACell<DeviceMap>>),
}

#[derive(Clone, Debug, Default)]
pub struct BlockInfo {
    /// A device name could be `/dev/sda1`.
    pub name: String,
    /// Number of 512-byte sectors.
    pub size: u64,
    pub fs: Option<FsSignature>,
    pub children: Vec<String>,
}

impl BlockInfo {
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_owned(),
            size,
            ..Self::default()
        }
    }

    pub fn with_fs(mut self, kind: &str, uuid: &str, label: Option<&str>) -> Self {
        self.fs = Some(FsSignature {
            kind: kind.to_owned(),
            uuid: uuid.to_owned(),
            label: label.map(String::from),
        });
        self
    }

    /// Kernel name without the `/dev/` prefix.
    pub fn short_name(&self) -> &str {
        self.name.trim_start_matches("/dev/")
    }

    pub fn size_mb(&self) -> u64 {
        self.size / 2048
    }
}

/// What blkid found on a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsSignature {
    pub kind: String,
    pub uuid: String,
    pub label: Option<String>,
}

pub struct DiskNode {
    pub device: BlockInfo,
    pub sector_size: u64,
    pub model: String,
    pub serial: String,
    pub removable: bool,
    pub read_only: bool,
    pub table: Option<PartitionTable>,
    /// Names of the partitions on this disk.
    pub partitions: Vec<String>,
}

pub struct PartitionNode {
    pub device: BlockInfo,
    pub disk: String,
    pub number: u32,
    /// First sector, in 512-byte units.
    pub offset: u64,
    pub uuid: String,
}

pub struct ArrayNode {
    pub device: BlockInfo,
    pub level: Option<RaidLevel>,
    pub members: Vec<String>,
}

pub struct DeviceMap {
    pub device: BlockInfo,
    pub name: String,
    pub vg_name: Option<String>,
    pub lv_name: Option<String>,
    /// Devices this map is built on.
    pub parents: Vec<String>,
}

/// Block devices known to the system, keyed by their `DEVNAME`.
#[derive(Default)]
pub struct BlockInventory {
    pub blocks: BTreeMap<String, BlockNode>,
}

impl BlockInventory {
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn get(&self, name: &str) -> Option<&BlockNode> {
        self.blocks.get(name).or_else(|| self.blocks.get(&format!("/dev/{}", name)))
    }

    pub fn insert_disk(&mut self, disk: DiskNode) {
        let name = disk.device.name.clone();
        self.blocks.insert(name, BlockNode::Disk(Arc::new(ACell::new(disk))));
    }

    /// Adds a partition and links it to its disk, which must already be present.
    pub fn insert_partition(&mut self, partition: PartitionNode, t: &mut ACellOwner) {
        let name = partition.device.name.clone();
        let parent = partition.disk.clone();

        self.blocks.insert(name.clone(), BlockNode::Partition(Arc::new(ACell::new(partition))));

        match self.blocks.get(&parent) {
            Some(BlockNode::Disk(disk)) => disk.rw(t).partitions.push(name),
            Some(_) => tracing::warn!("{}: parent {} is not a disk", name, parent),
            None => tracing::warn!("{}: parent {} not found", name, parent),
        }
    }

    pub fn insert_array(&mut self, array: ArrayNode, t: &mut ACellOwner) {
        let name = array.device.name.clone();
        let members = array.members.clone();
        self.blocks.insert(name.clone(), BlockNode::Array(Arc::new(ACell::new(array))));

        for member in members {
            self.link_child(&member, &name, t);
        }
    }

    pub fn insert_map(&mut self, map: DeviceMap, t: &mut ACellOwner) {
        let name = map.device.name.clone();
        let parents = map.parents.clone();
        self.blocks.insert(name.clone(), BlockNode::DeviceMap(Arc::new(ACell::new(map))));

        for parent in parents {
            self.link_child(&parent, &name, t);
        }
    }

    fn link_child(&self, parent: &str, child: &str, t: &mut ACellOwner) {
        match self.blocks.get(parent) {
            Some(block) => block.info_mut(t).children.push(child.to_owned()),
            None => tracing::warn!("{}: could not find parent block {}", child, parent),
        }
    }

    pub fn disks<'a>(&'a self, t: &'a ACellOwner) -> impl Iterator<Item = &'a DiskNode> + 'a {
        self.blocks.values().filter_map(move |block| match block {
            BlockNode::Disk(disk) => Some(disk.ro(t)),
            _ => None,
        })
    }

    pub fn partitions<'a>(&'a self, t: &'a ACellOwner) -> impl Iterator<Item = &'a PartitionNode> + 'a {
        self.blocks.values().filter_map(move |block| match block {
            BlockNode::Partition(partition) => Some(partition.ro(t)),
            _ => None,
        })
    }

    pub fn arrays<'a>(&'a self, t: &'a ACellOwner) -> impl Iterator<Item = &'a ArrayNode> + 'a {
        self.blocks.values().filter_map(move |block| match block {
            BlockNode::Array(array) => Some(array.ro(t)),
            _ => None,
        })
    }

    pub fn maps<'a>(&'a self, t: &'a ACellOwner) -> impl Iterator<Item = &'a DeviceMap> + 'a {
        self.blocks.values().filter_map(move |block| match block {
            BlockNode::DeviceMap(map) => Some(map.ro(t)),
            _ => None,
        })
    }

    /// Locate a device map by `DM_NAME`.
    pub fn map_by_dm_name<'a>(&'a self, dm_name: &str, t: &'a ACellOwner) -> Option<&'a DeviceMap> {
        self.maps(t).find(|map| map.name == dm_name)
    }

    /// Locate a block device by filesystem UUID.
    pub fn by_uuid<'a>(&'a self, uuid: &str, t: &'a ACellOwner) -> Option<&'a BlockInfo> {
        self.blocks
            .values()
            .map(|block| block.info(t))
            .find(|info| info.fs.as_ref().map_or(false, |fs| fs.uuid == uuid))
    }

    /// Names of every device stacked on top of `name`, nearest first.
    pub fn descendants(&self, name: &str, t: &ACellOwner) -> Vec<String> {
        let mut found = Vec::new();
        let mut pending = match self.get(name) {
            Some(block) => block.info(t).children.clone(),
            None => return found,
        };

        while let Some(child) = pending.pop() {
            if found.contains(&child) {
                continue;
            }

            if let Some(block) = self.blocks.get(&child) {
                pending.extend(block.info(t).children.iter().cloned());
            }

            found.push(child);
        }

        found
    }
}

impl BlockNode {
    /// Every block device has a `device` field.
    pub fn info<'a>(&'a self, t: &'a ACellOwner) -> &'a BlockInfo {
        match self {
            BlockNode::Disk(disk) => &disk.ro(t).device,
            BlockNode::Partition(entry) => &entry.ro(t).device,
            BlockNode::Array(array) => &array.ro(t).device,
            BlockNode::DeviceMap(map) => &map.ro(t).device,
        }
    }

    fn info_mut<'a>(&'a self, t: &'a mut ACellOwner) -> &'a mut BlockInfo {
        match self {
            BlockNode::Disk(disk) => &mut disk.rw(t).device,
            BlockNode::Partition(entry) => &mut entry.rw(t).device,
            BlockNode::Array(array) => &mut array.rw(t).device,
            BlockNode::DeviceMap(map) => &mut map.rw(t).device,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn stacked_devices_are_linked() {
        let mut t = owner();
        let mut inventory = BlockInventory::default();

        inventory.insert_disk(disk("/dev/sda", 2048 * 1024, Some(PartitionTable::Gpt)));
        inventory.insert_partition(partition("/dev/sda", 1, 2048, 2048 * 512), &mut t);
        inventory.insert_partition(partition("/dev/sda", 2, 2048 * 513, 2048 * 256), &mut t);
        inventory.insert_map(
            DeviceMap {
                device: BlockInfo::new("/dev/dm-0", 2048 * 512).with_fs("LVM2_member", "pv-uuid", None),
                name: "luks-sda1".into(),
                vg_name: None,
                lv_name: None,
                parents: vec!["/dev/sda1".into()],
            },
            &mut t,
        );
        inventory.insert_map(
            DeviceMap {
                device: BlockInfo::new("/dev/dm-1", 2048 * 500).with_fs("ext4", "root-uuid", Some("root")),
                name: "data-root".into(),
                vg_name: Some("data".into()),
                lv_name: Some("root".into()),
                parents: vec!["/dev/dm-0".into()],
            },
            &mut t,
        );

        let disk = inventory.disks(&t).next().unwrap();
        assert_eq!(disk.partitions, vec!["/dev/sda1", "/dev/sda2"]);

        assert_eq!(inventory.descendants("sda1", &t), vec!["/dev/dm-0", "/dev/dm-1"]);
        assert!(inventory.descendants("/dev/sda2", &t).is_empty());
        assert_eq!(inventory.map_by_dm_name("data-root", &t).unwrap().lv_name.as_deref(), Some("root"));
        assert_eq!(inventory.by_uuid("root-uuid", &t).unwrap().short_name(), "dm-1");
        assert_eq!(inventory.partitions(&t).count(), 2);
    }
}
