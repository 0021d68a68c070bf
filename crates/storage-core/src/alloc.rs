// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Placement of new partition requests onto the free space of the disks.
//!
//! Pending partition deletes are applied first. Requests with a fixed start are
//! placed next, then the remaining fixed-size requests, largest first, each in
//! the first free region that fits. Growable requests finally split the largest
//! free region of their disk in proportion to their requested sizes.

use crate::arch::Platform;
use crate::errors::{OperationError, Result};
use crate::fs_types::FilesystemTypeRegistry;
use crate::requests::{DeleteRequest, Partitions, RequestSpec};
use crate::table::{DiskTable, FreeRegion, PartitionTable};
use std::collections::BTreeMap;

struct Placement {
    id: u32,
    drive: String,
    number: u32,
}

/// Places every new partition request, writing the chosen disk, device name
/// and sectors back into the request.
pub fn allocate(
    partitions: &mut Partitions,
    tables: &mut BTreeMap<String, DiskTable>,
    registry: &FilesystemTypeRegistry,
) -> Result<()> {
    apply_deletes(partitions, tables)?;

    let mut fixed = Vec::new();
    let mut sized = Vec::new();
    let mut growing = Vec::new();

    for request in partitions.requests() {
        let spec = match request.as_partition() {
            Some(spec) if !request.preexist && spec.device.is_none() => spec,
            _ => continue,
        };

        let id = request
            .unique_id
            .ok_or_else(|| OperationError::Invariant(format!("{} has no id", request.describe())))?;

        if spec.start.is_some() {
            fixed.push(id);
        } else if spec.grow {
            growing.push(id);
        } else {
            sized.push((spec.size_mb, id));
        }
    }

    sized.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let mut placed = Vec::new();

    for id in fixed {
        placed.push(place_fixed(partitions.get(id)?, id, tables, registry)?);
    }

    for (_, id) in sized {
        placed.push(place_first_fit(partitions.get(id)?, id, tables, registry)?);
    }

    placed.extend(place_growing(partitions, &growing, tables, registry)?);

    for placement in placed {
        let table = tables
            .get(&placement.drive)
            .ok_or_else(|| unknown_drive(&placement.drive))?;
        let entry = table
            .entry(placement.number)
            .ok_or_else(|| OperationError::Invariant(format!("partition {} vanished", placement.number)))?;

        let size_mb = table.size_mb(entry.sectors());
        let (start, end) = (entry.start, entry.end);
        let device = table.partition_name(placement.number);

        let request = partitions.get_mut(placement.id)?;
        tracing::info!("placed {} on {} as {} ({} MB)", request.describe(), placement.drive, device, size_mb);

        if let Some(spec) = request.as_partition_mut() {
            spec.device = Some(device);
            spec.drive = Some(placement.drive);
            spec.start = Some(start);
            spec.end = Some(end);
            spec.size_mb = size_mb;
        }
    }

    Ok(())
}

/// Sets the boot flag on the MBR partitions the boot loader starts from.
pub fn mark_bootable(
    partitions: &Partitions,
    tables: &mut BTreeMap<String, DiskTable>,
    platform: &Platform,
) -> Result<()> {
    for id in partitions.bootable_request(platform) {
        let spec = match partitions.get(id)?.as_partition() {
            Some(spec) => spec,
            None => continue,
        };

        let (drive, start) = match (spec.drive.as_deref(), spec.start) {
            (Some(drive), Some(start)) => (drive, start),
            _ => continue,
        };

        let table = tables.get_mut(drive).ok_or_else(|| unknown_drive(drive))?;
        if table.kind != PartitionTable::Mbr {
            continue;
        }

        if let Some(number) = table.entry_at(start).map(|entry| entry.number) {
            table.set_bootable(number)?;
        }
    }

    Ok(())
}

fn apply_deletes(partitions: &Partitions, tables: &mut BTreeMap<String, DiskTable>) -> Result<()> {
    for delete in partitions.deletes() {
        let spec = match delete {
            DeleteRequest::Partition(spec) => spec,
            _ => continue,
        };

        let table = tables.get_mut(&spec.drive).ok_or_else(|| unknown_drive(&spec.drive))?;
        let number = table.entry_at(spec.start).map(|entry| entry.number).ok_or_else(|| {
            OperationError::Allocation(format!(
                "no partition starts at sector {} of {}",
                spec.start, spec.drive
            ))
        })?;

        tracing::info!("removing partition {} from {}", number, spec.drive);
        table.remove(number)?;
    }

    Ok(())
}

fn unknown_drive(drive: &str) -> OperationError {
    OperationError::Allocation(format!("the disk {} is not available", drive))
}

fn partition_types(request: &RequestSpec, registry: &FilesystemTypeRegistry) -> Result<(u8, String)> {
    let kind = registry.get(&request.fstype)?;
    Ok((kind.mbr_type, kind.gpt_type.clone()))
}

/// Disks a request may be placed on, in search order.
fn candidates(request: &RequestSpec, tables: &BTreeMap<String, DiskTable>) -> Vec<String> {
    match request.as_partition() {
        Some(spec) if !spec.drives.is_empty() => spec.drives.clone(),
        _ => tables.keys().cloned().collect(),
    }
}

fn has_slot(table: &DiskTable) -> bool {
    table.kind != PartitionTable::Mbr || table.entries().len() < 4
}

fn place_fixed(
    request: &RequestSpec,
    id: u32,
    tables: &mut BTreeMap<String, DiskTable>,
    registry: &FilesystemTypeRegistry,
) -> Result<Placement> {
    let spec = request
        .as_partition()
        .ok_or_else(|| OperationError::Invariant(format!("{} is not a partition", request.describe())))?;

    let drive = spec
        .drives
        .first()
        .or(spec.drive.as_ref())
        .ok_or_else(|| {
            OperationError::Allocation(format!("{} has a fixed start but no disk", request.describe()))
        })?
        .clone();

    let table = tables.get_mut(&drive).ok_or_else(|| unknown_drive(&drive))?;
    let start = spec.start.unwrap_or(table.first_usable);
    let end = match spec.end {
        Some(end) => end,
        None => start + spec.size_mb.max(1) * table.sectors_per_mb() - 1,
    };

    let (mbr_type, gpt_type) = partition_types(request, registry)?;
    let number = table.add(start, end, mbr_type, &gpt_type)?;

    Ok(Placement { id, drive, number })
}

fn place_first_fit(
    request: &RequestSpec,
    id: u32,
    tables: &mut BTreeMap<String, DiskTable>,
    registry: &FilesystemTypeRegistry,
) -> Result<Placement> {
    let size_mb = request.as_partition().map_or(0, |spec| spec.size_mb).max(1);
    let (mbr_type, gpt_type) = partition_types(request, registry)?;

    for drive in candidates(request, tables) {
        let table = tables.get_mut(&drive).ok_or_else(|| unknown_drive(&drive))?;
        if !has_slot(table) {
            continue;
        }

        let needed = size_mb * table.sectors_per_mb();
        let region = table
            .free_regions()
            .into_iter()
            .find(|region| region.sectors() >= needed);

        if let Some(region) = region {
            let number = table.add(region.start, region.start + needed - 1, mbr_type, &gpt_type)?;
            return Ok(Placement { id, drive, number });
        }
    }

    Err(OperationError::Allocation(format!(
        "not enough free space for {} ({} MB)",
        request.describe(),
        size_mb
    )))
}

fn largest_region(table: &DiskTable) -> Option<FreeRegion> {
    table.free_regions().into_iter().max_by_key(FreeRegion::sectors)
}

fn place_growing(
    partitions: &Partitions,
    growing: &[u32],
    tables: &mut BTreeMap<String, DiskTable>,
    registry: &FilesystemTypeRegistry,
) -> Result<Vec<Placement>> {
    // Pick a disk for each request, reserving its minimum size there.
    let mut by_drive: BTreeMap<String, Vec<(u32, u64, Option<u64>)>> = BTreeMap::new();

    for &id in growing {
        let request = partitions.get(id)?;
        let spec = request
            .as_partition()
            .ok_or_else(|| OperationError::Invariant(format!("{} is not a partition", request.describe())))?;

        let drive = candidates(request, tables).into_iter().find(|drive| {
            let table = match tables.get(drive) {
                Some(table) => table,
                None => return false,
            };

            let reserved: u64 = by_drive
                .get(drive)
                .map_or(0, |queued| queued.iter().map(|(_, base, _)| (*base).max(1)).sum());
            let queued = by_drive.get(drive).map_or(0, Vec::len);
            let slots = table.kind != PartitionTable::Mbr || table.entries().len() + queued < 4;

            slots
                && largest_region(table).map_or(false, |region| {
                    table.size_mb(region.sectors()) >= reserved + spec.size_mb.max(1)
                })
        });

        let drive = drive.ok_or_else(|| {
            OperationError::Allocation(format!(
                "not enough free space for {} ({} MB)",
                request.describe(),
                spec.size_mb
            ))
        })?;

        by_drive
            .entry(drive)
            .or_default()
            .push((id, spec.size_mb, spec.max_size_mb));
    }

    let mut placed = Vec::new();

    for (drive, requests) in by_drive {
        let table = tables.get_mut(&drive).ok_or_else(|| unknown_drive(&drive))?;
        let region = largest_region(table).ok_or_else(|| {
            OperationError::Allocation(format!("no free space is left on {}", drive))
        })?;

        let spm = table.sectors_per_mb();
        let sizes = grow_sizes(table.size_mb(region.sectors()), &requests);

        let mut cursor = region.start;
        for ((id, _, _), size_mb) in requests.iter().zip(sizes) {
            let request = partitions.get(*id)?;
            let (mbr_type, gpt_type) = partition_types(request, registry)?;

            let end = cursor + size_mb * spm - 1;
            let number = table.add(cursor, end, mbr_type, &gpt_type)?;
            placed.push(Placement {
                id: *id,
                drive: drive.clone(),
                number,
            });

            cursor = end + 1;
        }
    }

    Ok(placed)
}

/// Splits `available` MB between requests of `(id, base, max)`, in proportion to
/// their base sizes. Space a capped request cannot take goes to the others.
fn grow_sizes(available: u64, requests: &[(u32, u64, Option<u64>)]) -> Vec<u64> {
    let bases: Vec<u64> = requests.iter().map(|(_, base, _)| (*base).max(1)).collect();
    let mut sizes = bases.clone();
    let mut open: Vec<usize> = (0..requests.len()).collect();
    let mut extra = available.saturating_sub(bases.iter().sum());

    while extra > 0 && !open.is_empty() {
        let weight: u64 = open.iter().map(|&i| bases[i]).sum();
        let mut granted = 0;
        let mut capped = Vec::new();

        for &i in &open {
            let room = requests[i].2.map_or(u64::MAX, |max| max.saturating_sub(sizes[i]));
            let grant = (extra * bases[i] / weight).min(room);
            sizes[i] += grant;
            granted += grant;
            if grant == room {
                capped.push(i);
            }
        }

        open.retain(|i| !capped.contains(i));
        if granted == 0 {
            break;
        }
        extra -= granted;
    }

    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::fs_types::KernelFilesystems;
    use crate::requests::DeleteSpec;
    use std::path::Path;

    const GB_SECTORS: u64 = 2 * 1024 * 1024;

    fn registry() -> FilesystemTypeRegistry {
        FilesystemTypeRegistry::with_kernel(KernelFilesystems::preset(vec!["ext4"]))
    }

    fn disks(kind: PartitionTable) -> BTreeMap<String, DiskTable> {
        ["sda", "sdb"]
            .iter()
            .map(|name| {
                let path = Path::new("/dev").join(name);
                (name.to_string(), DiskTable::in_memory(&path, kind, 512, GB_SECTORS))
            })
            .collect()
    }

    fn on(drives: &[&str], request: RequestSpec) -> RequestSpec {
        let mut request = request;
        request.as_partition_mut().unwrap().drives = drives.iter().map(|d| d.to_string()).collect();
        request
    }

    fn growing(size_mb: u64, max: Option<u64>) -> RequestSpec {
        let mut request = RequestSpec::partition("ext4", size_mb);
        let spec = request.as_partition_mut().unwrap();
        spec.grow = true;
        spec.max_size_mb = max;
        request
    }

    #[test]
    fn largest_requests_are_placed_first() {
        let registry = registry();
        let mut tables = disks(PartitionTable::Gpt);
        let mut partitions = Partitions::new();
        let small = partitions.add_request(RequestSpec::partition("swap", 100));
        let large = partitions.add_request(RequestSpec::partition("ext4", 900).with_mountpoint("/"));
        let pinned = partitions.add_request(on(&["sdb"], RequestSpec::partition("ext4", 50)));

        allocate(&mut partitions, &mut tables, &registry).unwrap();

        let root = partitions.get(large).unwrap().as_partition().unwrap();
        assert_eq!(root.device.as_deref(), Some("sda1"));
        assert_eq!(root.start, Some(2048));
        assert_eq!(root.size_mb, 900);

        // The swap request still fits behind it.
        let swap = partitions.get(small).unwrap().as_partition().unwrap();
        assert_eq!(swap.drive.as_deref(), Some("sda"));
        assert_eq!(swap.device.as_deref(), Some("sda2"));
        assert_eq!(swap.start, Some(2048 + 900 * 2048));

        let pinned = partitions.get(pinned).unwrap().as_partition().unwrap();
        assert_eq!(pinned.device.as_deref(), Some("sdb1"));

        let swap_entry = tables["sda"].entry(2).unwrap();
        assert_eq!(swap_entry.gpt_type.as_deref(), Some("0657FD6D-A4AB-43C4-84E5-0933C84B4F4F"));
    }

    #[test]
    fn requests_that_do_not_fit_fail() {
        let registry = registry();
        let mut tables = disks(PartitionTable::Gpt);
        let mut partitions = Partitions::new();
        partitions.add_request(RequestSpec::partition("ext4", 2000).with_mountpoint("/"));

        let error = allocate(&mut partitions, &mut tables, &registry).unwrap_err();
        assert!(error.to_string().contains("not enough free space for / (2000 MB)"));
    }

    #[test]
    fn growable_requests_share_the_remaining_space() {
        let registry = registry();
        let mut tables = disks(PartitionTable::Gpt);
        tables.remove("sdb");

        let mut partitions = Partitions::new();
        let boot = partitions.add_request(RequestSpec::partition("ext4", 200).with_mountpoint("/boot"));
        let root = partitions.add_request(growing(100, None).with_mountpoint("/"));
        let home = partitions.add_request(growing(300, None).with_mountpoint("/home"));

        allocate(&mut partitions, &mut tables, &registry).unwrap();

        let size = |id| partitions.get(id).unwrap().as_partition().unwrap().size_mb;
        assert_eq!(size(boot), 200);

        // 822 whole megabytes remain after /boot.
        let extra = 822 - 400;
        assert_eq!(size(root), 100 + extra / 4);
        assert_eq!(size(home), 300 + extra * 3 / 4);
        assert!(size(root) + size(home) <= 822);
    }

    #[test]
    fn growth_is_capped() {
        assert_eq!(grow_sizes(1000, &[(0, 100, Some(150)), (1, 100, None)]), vec![150, 850]);
        assert_eq!(grow_sizes(1000, &[(0, 0, None), (1, 0, None)]), vec![500, 500]);
        assert_eq!(grow_sizes(50, &[(0, 100, None)]), vec![100]);
    }

    #[test]
    fn deletes_free_space_first() {
        let registry = registry();
        let mut tables = disks(PartitionTable::Mbr);
        tables.remove("sdb");
        let table = tables.get_mut("sda").unwrap();
        for n in 0..4 {
            let start = 2048 + n * 200 * 2048;
            table.add(start, start + 200 * 2048 - 1, 0x83, "").unwrap();
        }

        let mut partitions = Partitions::new();
        let id = partitions.add_request(RequestSpec::partition("ext4", 150).with_mountpoint("/"));
        assert!(allocate(&mut partitions.clone(), &mut tables.clone(), &registry).is_err());

        partitions.add_delete(DeleteRequest::Partition(DeleteSpec {
            drive: "sda".into(),
            start: 2048 + 200 * 2048,
            end: 2048 + 400 * 2048 - 1,
            device: Some("sda2".into()),
        }));

        allocate(&mut partitions, &mut tables, &registry).unwrap();
        let spec = partitions.get(id).unwrap().as_partition().unwrap();
        assert_eq!(spec.device.as_deref(), Some("sda2"));
        assert_eq!(spec.start, Some(2048 + 200 * 2048));
        assert_eq!(tables["sda"].entry(2).unwrap().mbr_type, 0x83);
    }

    #[test]
    fn fixed_placements_and_boot_flags() {
        let registry = registry();
        let mut tables = disks(PartitionTable::Mbr);
        let mut partitions = Partitions::new();

        let mut pinned = on(&["sdb"], RequestSpec::partition("ext4", 0).with_mountpoint("/boot"));
        let spec = pinned.as_partition_mut().unwrap();
        spec.start = Some(4096);
        spec.end = Some(4096 + 200 * 2048 - 1);
        let boot = partitions.add_request(pinned);
        partitions.add_request(RequestSpec::partition("ext4", 500).with_mountpoint("/"));

        allocate(&mut partitions, &mut tables, &registry).unwrap();
        let spec = partitions.get(boot).unwrap().as_partition().unwrap();
        assert_eq!(spec.device.as_deref(), Some("sdb1"));
        assert_eq!(spec.size_mb, 200);

        mark_bootable(&partitions, &mut tables, &Platform::new(Arch::X86_64)).unwrap();
        assert!(tables["sdb"].entry(1).unwrap().bootable);
        assert!(!tables["sda"].entry(1).unwrap().bootable);
    }
}
