// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: GPL-3.0-only

#[macro_use]
extern crate fomat_macros;

use pop_storage_core::*;

fn main() {
    let ctx = StorageContext::new(StorageConfig::load());
    let mut udev = UDev::new().unwrap();
    let mut t = ACellOwner::new();

    let mut disks = DiskSet::new();
    disks.reload(&mut udev, &mut t).unwrap();
    display(&disks.inventory, &t);

    disks.open_devices(&ctx, &Headless { answer: false }, &t).unwrap();
    let layout = disks.layout(&ctx, &t).unwrap();

    let mut partitions = Partitions::new();
    partitions.set_from_disk(&layout, &ctx.registry).unwrap();

    pintln!("Requests:");
    for request in partitions.requests() {
        pintln!(
            "  " (request.describe()) "\n"
            "    Size: " (partitions.actual_size(request.unique_id.unwrap_or_default()).unwrap_or_default()) " MB"
            if let Some(label) = request.fslabel.as_ref() {
                "\n    Label: " (label)
            }
        );
    }

    for encrypted in disks.encrypted_devices(&t) {
        pintln!("Encrypted: " (encrypted.device) " (" (encrypted.uuid) ") mapped to " [encrypted.mapped]);
    }
}

fn display(inventory: &BlockInventory, t: &ACellOwner) {
    fn display_children(inventory: &BlockInventory, info: &BlockInfo, level: usize, t: &ACellOwner) {
        let indent = "  ".repeat(level);

        for child in &info.children {
            let block = match inventory.get(child) {
                Some(block) => block,
                None => continue,
            };

            let device = block.info(t);
            match block {
                BlockNode::DeviceMap(map) => {
                    let map = map.ro(t);
                    pintln!(
                        (indent) "Child: " (device.name) "\n"
                        (indent) "  Size: " (device.size_mb()) " MB\n"
                        (indent) "  DM Name: " (map.name) "\n"
                        (indent) "  LV Name: " [map.lv_name] "\n"
                        (indent) "  VG Name: " [map.vg_name] "\n"
                        (indent) "  FS: " [device.fs]
                    );
                }
                BlockNode::Array(array) => {
                    pintln!(
                        (indent) "Array: " (device.name) "\n"
                        (indent) "  Level: " [array.ro(t).level] "\n"
                        (indent) "  FS: " [device.fs]
                    );
                }
                _ => continue,
            }

            display_children(inventory, device, level + 1, t);
        }
    }

    for disk in inventory.disks(t) {
        pintln!(
            "Disk: " (disk.device.name) "\n"
            "  Size: " (disk.device.size_mb()) " MB\n"
            "  Sector Size: " (disk.sector_size) "\n"
            "  Model: " (disk.model) "\n"
            "  Serial: " (disk.serial) "\n"
            "  Table: " [disk.table] "\n"
            "  Removable: " (disk.removable)
        );

        display_children(inventory, &disk.device, 2, t);

        for name in &disk.partitions {
            let partition = match inventory.get(name) {
                Some(BlockNode::Partition(partition)) => partition.ro(t),
                _ => continue,
            };

            pintln!(
                "    Partition: " (partition.device.name) "\n"
                "      Number: " (partition.number) "\n"
                "      Size: " (partition.device.size_mb()) " MB\n"
                "      Offset: " (partition.offset) "\n"
                "      PartUUID: " (partition.uuid) "\n"
                "      FS: " [partition.device.fs]
            );

            display_children(inventory, &partition.device, 4, t);
        }
    }
}
