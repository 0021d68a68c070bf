// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use crate::block_types::*;
use crate::errors::{OperationError, Result};
use crate::raid::RaidLevel;
use crate::table::PartitionTable;
use crate::ACellOwner;
use libudev::Device as UDevice;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

pub struct UDev {
    pub context: libudev::Context,
    pub enumerator: libudev::Enumerator,
}

impl UDev {
    /// An enumerator over the block subsystem.
    pub fn new() -> Result<Self> {
        let context = libudev::Context::new().map_err(udev_error)?;
        let mut enumerator = libudev::Enumerator::new(&context).map_err(udev_error)?;
        enumerator.match_subsystem("block").map_err(udev_error)?;

        Ok(Self { context, enumerator })
    }

    /// Rebuilds `inventory` from the devices udev currently knows.
    pub fn scan(&mut self, inventory: &mut BlockInventory, t: &mut ACellOwner) -> Result<()> {
        inventory.clear();

        let mut devices = self.enumerator.scan_devices().map_err(udev_error)?.collect::<Vec<_>>();

        // Parents before the devices stacked upon them.
        devices.sort_by_key(|device| (stacking_rank(device), device.sysnum()));

        for device in &devices {
            self.append(inventory, device, t);
        }

        tracing::debug!("udev reported {} block devices", inventory.blocks.len());
        Ok(())
    }

    /// Appends relevant information about this device to the inventory.
    pub fn append(&self, inventory: &mut BlockInventory, device: &UDevice, t: &mut ACellOwner) {
        match device.devtype().and_then(OsStr::to_str) {
            Some("disk") => match property(device, "DM_NAME") {
                Some(dm_name) => self.append_dm(inventory, device, dm_name.to_owned(), t),
                None if property(device, "MD_LEVEL").is_some() => self.append_array(inventory, device, t),
                None => self.append_disk(inventory, device),
            },
            Some("partition") => self.append_partition(inventory, device, t),
            _ => (),
        }
    }

    /// Append a device which we have determined to be a physical disk.
    fn append_disk(&self, inventory: &mut BlockInventory, device: &UDevice) {
        let dev = ward::ward!(block_info(device), else { return });

        if dev.name.contains("loop") || dev.name.contains("/dev/ram") {
            return;
        }

        let table = property(device, "ID_PART_TABLE_TYPE").and_then(|table| match table {
            "gpt" => Some(PartitionTable::Gpt),
            "dos" | "mbr" => Some(PartitionTable::Mbr),
            _ => None,
        });

        let sector_size = match device
            .attribute_value("queue/logical_block_size")
            .and_then(OsStr::to_str)
        {
            Some(size) => match size.parse::<u64>() {
                Ok(size) => size,
                Err(_) => {
                    tracing::warn!("{}: does not contain a valid sector size: {}", dev.name, size);
                    return;
                }
            },
            None => {
                tracing::warn!("{}: does not contain a sector size", dev.name);
                return;
            }
        };

        inventory.insert_disk(DiskNode {
            device: dev,
            table,
            sector_size,
            removable: attribute_flag(device, "removable"),
            read_only: attribute_flag(device, "ro"),
            model: property(device, "ID_MODEL").unwrap_or_default().to_owned(),
            serial: property(device, "ID_SERIAL").unwrap_or_default().to_owned(),
            partitions: Vec::new(),
        });
    }

    /// Append a device which we have determined to be a physical partition.
    fn append_partition(&self, inventory: &mut BlockInventory, dev: &UDevice, t: &mut ACellOwner) {
        let device = ward::ward!(block_info(dev), else {
            tracing::warn!("partition without device information");
            return;
        });

        let parent_devname = ward::ward!(self.parent_devname(dev, &device.name), else { return });

        // Partitions inside an array are not installation targets.
        if parent_devname.starts_with("/dev/md") {
            return;
        }

        let offset = ward::ward!(property(dev, "ID_PART_ENTRY_OFFSET"), else {
            tracing::warn!("{}: lacks ID_PART_ENTRY_OFFSET", device.name);
            return;
        });

        let number = property(dev, "ID_PART_ENTRY_NUMBER")
            .or_else(|| property(dev, "PARTN"))
            .and_then(|number| number.parse::<u32>().ok())
            .unwrap_or_default();

        inventory.insert_partition(
            PartitionNode {
                offset: offset.parse::<u64>().unwrap_or_default(),
                uuid: property(dev, "ID_PART_ENTRY_UUID").unwrap_or_default().to_owned(),
                disk: parent_devname,
                number,
                device,
            },
            t,
        );
    }

    /// Append a device map, such as an unlocked LUKS volume or a logical volume.
    fn append_dm(&self, inventory: &mut BlockInventory, dev: &UDevice, dm_name: String, t: &mut ACellOwner) {
        let device = ward::ward!(block_info(dev), else {
            tracing::warn!("device map without device information");
            return;
        });

        let parents = self.parent_devnames(dev);

        inventory.insert_map(
            DeviceMap {
                device,
                lv_name: property(dev, "DM_LV_NAME").map(String::from),
                name: dm_name,
                vg_name: property(dev, "DM_VG_NAME").map(String::from),
                parents,
            },
            t,
        );
    }

    /// Arrays are block devices of type disk, whose parents are their members.
    pub fn append_array(&self, inventory: &mut BlockInventory, dev: &UDevice, t: &mut ACellOwner) {
        let device = ward::ward!(block_info(dev), else { return });
        let level = property(dev, "MD_LEVEL").and_then(RaidLevel::parse);
        let members = self.parent_devnames(dev);

        inventory.insert_array(ArrayNode { device, level, members }, t);
    }

    fn parent_devnames(&self, dev: &UDevice) -> Vec<String> {
        let syspath = ward::ward!(dev.syspath(), else { return Vec::new() });

        parents(syspath)
            .filter_map(|parent| match UDevice::from_syspath(&self.context, &parent) {
                Ok(parent) => property(&parent, "DEVNAME").map(String::from),
                Err(why) => {
                    tracing::warn!("{:?}: libudev device without syspath: {}", parent, why);
                    None
                }
            })
            .collect()
    }

    fn parent_devname(&self, dev: &UDevice, name: &str) -> Option<String> {
        let parent = self.parent_devnames(dev).into_iter().next();
        if parent.is_none() {
            tracing::warn!("{}: lacks a parent", name);
        }
        parent
    }
}

fn stacking_rank(device: &UDevice) -> u8 {
    match device.devtype().and_then(OsStr::to_str) {
        Some("disk") if property(device, "DM_NAME").is_some() => 3,
        Some("disk") if property(device, "MD_LEVEL").is_some() => 2,
        Some("disk") => 0,
        _ => 1,
    }
}

fn udev_error(why: libudev::Error) -> OperationError {
    OperationError::Invariant(format!("udev: {}", why))
}

/// Automatically convert `UDevice` properties to Rust strings.
fn property<'a>(device: &'a UDevice, property: &str) -> Option<&'a str> {
    device.property_value(property).and_then(OsStr::to_str)
}

fn attribute_flag(device: &UDevice, attribute: &str) -> bool {
    device.attribute_value(attribute).and_then(OsStr::to_str) == Some("1")
}

/// Get device-specific information from a `UDevice`.
fn block_info(device: &UDevice) -> Option<BlockInfo> {
    let name = device.property_value("DEVNAME")?.to_str()?;
    let size = device.attribute_value("size")?.to_str()?.parse::<u64>().ok()?;

    let mut info = BlockInfo::new(name, size);
    if let Some(kind) = property(device, "ID_FS_TYPE") {
        info = info.with_fs(
            kind,
            property(device, "ID_FS_UUID").unwrap_or_default(),
            property(device, "ID_FS_LABEL"),
        );
    }

    Some(info)
}

/// Locate the parents of the given device.
///
/// Some devices define their parents under `{DEV}/slaves`, while others can be determined
/// by checking if the parent directory contains a `queue` sub-directory.
pub fn parents(device_path: &Path) -> impl Iterator<Item = PathBuf> {
    let parents: Box<dyn Iterator<Item = PathBuf>> = match device_path.join("slaves").read_dir() {
        Ok(parents) => {
            let iterator = parents
                .filter_map(|entry| entry.ok())
                .filter_map(|parent| parent.path().canonicalize().ok())
                .filter(|path| path.components().any(|c| c.as_os_str() == "block"));

            Box::new(iterator)
        }
        Err(_) => Box::new(std::iter::empty()),
    };

    let parent = device_path
        .parent()
        .filter(|parent| parent.join("queue").exists())
        .map(Path::to_path_buf);

    parents.chain(parent)
}
