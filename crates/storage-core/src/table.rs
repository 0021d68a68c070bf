// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! In-memory partition tables, loaded from and written back to disk with
//! `gptman` and `mbrman`.

use crate::command::{run_checked, ToolCommand};
use crate::context::StorageContext;
use crate::errors::{OperationError, Result};
use crate::MEGABYTE;
use gptman::{GPTPartitionEntry, GPT};
use mbrman::MBR;
use rand::Rng;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

const DEFAULT_SECTOR_SIZE: u64 = 512;
const MBR_PRIMARY_LIMIT: usize = 4;
const GPT_ENTRY_LIMIT: u32 = 128;
/// Sectors reserved at the end of a GPT disk for the backup header and entries.
const GPT_BACKUP_SECTORS: u64 = 33;
/// Legacy BIOS bootable attribute.
const GPT_LEGACY_BOOT: u64 = 1 << 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionTable {
    Mbr,
    Gpt,
}

impl fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartitionTable::Mbr => "msdos",
            PartitionTable::Gpt => "gpt",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub number: u32,
    /// First sector.
    pub start: u64,
    /// Last sector, inclusive.
    pub end: u64,
    pub mbr_type: u8,
    /// Partition type GUID on GPT disks.
    pub gpt_type: Option<String>,
    pub bootable: bool,
}

impl TableEntry {
    pub fn sectors(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// A run of unallocated sectors, aligned to a megabyte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeRegion {
    pub start: u64,
    pub end: u64,
}

impl FreeRegion {
    pub fn sectors(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// The partition table of one disk, edited in memory until committed.
#[derive(Clone, Debug)]
pub struct DiskTable {
    pub device: PathBuf,
    pub kind: PartitionTable,
    pub sector_size: u64,
    pub first_usable: u64,
    pub last_usable: u64,
    entries: Vec<TableEntry>,
    /// A new label, which replaces whatever the disk held.
    fresh: bool,
    dirty: bool,
}

fn table_error(device: &Path, why: impl fmt::Display) -> OperationError {
    OperationError::Table {
        device: device.display().to_string(),
        why: why.to_string(),
    }
}

impl DiskTable {
    /// An empty label for a disk of `total_sectors`.
    pub fn in_memory(device: &Path, kind: PartitionTable, sector_size: u64, total_sectors: u64) -> Self {
        let (first_usable, last_usable) = match kind {
            PartitionTable::Gpt => (
                2 + GPT_BACKUP_SECTORS - 1,
                total_sectors.saturating_sub(GPT_BACKUP_SECTORS + 1),
            ),
            PartitionTable::Mbr => (1, total_sectors.saturating_sub(1)),
        };

        Self {
            device: device.to_path_buf(),
            kind,
            sector_size,
            first_usable,
            last_usable,
            entries: Vec::new(),
            fresh: true,
            dirty: true,
        }
    }

    /// Replaces the label of `device` with an empty one of `kind`, in memory.
    pub fn initialize(device: &Path, kind: PartitionTable) -> Result<Self> {
        let mut file = File::open(device).map_err(|why| OperationError::io(device, why))?;
        let bytes = file
            .seek(SeekFrom::End(0))
            .map_err(|why| OperationError::io(device, why))?;

        tracing::info!("initializing {} with a {} label", device.display(), kind);
        Ok(Self::in_memory(device, kind, DEFAULT_SECTOR_SIZE, bytes / DEFAULT_SECTOR_SIZE))
    }

    /// Reads the label of `device`. A disk without a readable GPT or MBR label
    /// is an error, which callers may answer by initializing the disk.
    pub fn open(device: &Path) -> Result<Self> {
        let mut file = File::open(device).map_err(|why| OperationError::io(device, why))?;

        if let Ok(gpt) = GPT::find_from(&mut file) {
            let entries = gpt
                .iter()
                .filter(|(_, entry)| entry.is_used())
                .map(|(number, entry)| TableEntry {
                    number,
                    start: entry.starting_lba,
                    end: entry.ending_lba,
                    mbr_type: 0,
                    gpt_type: Some(guid_to_string(&entry.partition_type_guid)),
                    bootable: entry.attribute_bits & GPT_LEGACY_BOOT != 0,
                })
                .collect();

            return Ok(Self {
                device: device.to_path_buf(),
                kind: PartitionTable::Gpt,
                sector_size: gpt.sector_size,
                first_usable: gpt.header.first_usable_lba,
                last_usable: gpt.header.last_usable_lba,
                entries,
                fresh: false,
                dirty: false,
            });
        }

        let bytes = file
            .seek(SeekFrom::End(0))
            .map_err(|why| OperationError::io(device, why))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|why| OperationError::io(device, why))?;

        let mbr = MBR::read_from(&mut file, DEFAULT_SECTOR_SIZE as u32)
            .map_err(|why| table_error(device, format!("no readable disk label: {}", why)))?;

        if mbr.iter().any(|(_, entry)| entry.sys == 0xee) {
            return Err(table_error(device, "the GUID partition table is damaged"));
        }

        let entries = mbr
            .iter()
            .filter(|(_, entry)| entry.is_used())
            .map(|(number, entry)| TableEntry {
                number: number as u32,
                start: u64::from(entry.starting_lba),
                end: u64::from(entry.starting_lba) + u64::from(entry.sectors) - 1,
                mbr_type: entry.sys,
                gpt_type: None,
                // The active flag is owned by sfdisk, see `commit`.
                bootable: false,
            })
            .collect();

        Ok(Self {
            device: device.to_path_buf(),
            kind: PartitionTable::Mbr,
            sector_size: DEFAULT_SECTOR_SIZE,
            first_usable: 1,
            last_usable: (bytes / DEFAULT_SECTOR_SIZE).saturating_sub(1),
            entries,
            fresh: false,
            dirty: false,
        })
    }

    /// Kernel name of the disk, such as `sda`.
    pub fn name(&self) -> String {
        self.device
            .file_name()
            .map_or_else(String::new, |name| name.to_string_lossy().into_owned())
    }

    pub fn entries(&self) -> &[TableEntry] {
        &self.entries
    }

    pub fn entry(&self, number: u32) -> Option<&TableEntry> {
        self.entries.iter().find(|entry| entry.number == number)
    }

    /// The partition that begins at `start`.
    pub fn entry_at(&self, start: u64) -> Option<&TableEntry> {
        self.entries.iter().find(|entry| entry.start == start)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn sectors_per_mb(&self) -> u64 {
        (MEGABYTE / self.sector_size).max(1)
    }

    pub fn size_mb(&self, sectors: u64) -> u64 {
        sectors / self.sectors_per_mb()
    }

    fn align_up(&self, sector: u64) -> u64 {
        let align = self.sectors_per_mb();
        (sector + align - 1) / align * align
    }

    /// Unallocated space, with each region starting on a megabyte boundary.
    pub fn free_regions(&self) -> Vec<FreeRegion> {
        let mut used: Vec<&TableEntry> = self.entries.iter().collect();
        used.sort_by_key(|entry| entry.start);

        let mut regions = Vec::new();
        let mut cursor = self.align_up(self.first_usable);

        for entry in used {
            if entry.start > cursor {
                regions.push(FreeRegion {
                    start: cursor,
                    end: entry.start - 1,
                });
            }
            cursor = cursor.max(self.align_up(entry.end + 1));
        }

        if cursor <= self.last_usable {
            regions.push(FreeRegion {
                start: cursor,
                end: self.last_usable,
            });
        }

        regions
    }

    /// Adds a partition spanning `start..=end`, returning its number.
    pub fn add(&mut self, start: u64, end: u64, mbr_type: u8, gpt_type: &str) -> Result<u32> {
        if start > end || start < self.first_usable || end > self.last_usable {
            return Err(table_error(
                &self.device,
                format!("sectors {}..{} are outside of the usable area", start, end),
            ));
        }

        if let Some(overlap) = self.entries.iter().find(|e| start <= e.end && e.start <= end) {
            return Err(table_error(
                &self.device,
                format!("sectors {}..{} overlap partition {}", start, end, overlap.number),
            ));
        }

        let number = match self.kind {
            PartitionTable::Mbr => {
                if self.entries.len() >= MBR_PRIMARY_LIMIT {
                    return Err(table_error(&self.device, "no primary partitions are left"));
                }

                if end > u64::from(u32::MAX) {
                    return Err(table_error(&self.device, "the partition ends beyond 2TB"));
                }

                self.next_number(MBR_PRIMARY_LIMIT as u32)
            }
            PartitionTable::Gpt => self.next_number(GPT_ENTRY_LIMIT),
        }
        .ok_or_else(|| table_error(&self.device, "the partition table is full"))?;

        self.entries.push(TableEntry {
            number,
            start,
            end,
            mbr_type,
            gpt_type: match self.kind {
                PartitionTable::Gpt => Some(gpt_type.to_owned()),
                PartitionTable::Mbr => None,
            },
            bootable: false,
        });

        self.entries.sort_by_key(|entry| entry.number);
        self.dirty = true;

        tracing::debug!("{}: added partition {} at {}..{}", self.name(), number, start, end);
        Ok(number)
    }

    fn next_number(&self, limit: u32) -> Option<u32> {
        (1..=limit).find(|number| self.entry(*number).is_none())
    }

    pub fn remove(&mut self, number: u32) -> Result<TableEntry> {
        let pos = self
            .entries
            .iter()
            .position(|entry| entry.number == number)
            .ok_or_else(|| table_error(&self.device, format!("partition {} does not exist", number)))?;

        self.dirty = true;
        Ok(self.entries.remove(pos))
    }

    /// Marks `number` as the partition the firmware boots. An MBR disk has
    /// only one active partition.
    pub fn set_bootable(&mut self, number: u32) -> Result<()> {
        if self.entry(number).is_none() {
            return Err(table_error(&self.device, format!("partition {} does not exist", number)));
        }

        for entry in &mut self.entries {
            if entry.number == number {
                entry.bootable = true;
            } else if self.kind == PartitionTable::Mbr {
                entry.bootable = false;
            }
        }

        self.dirty = true;
        Ok(())
    }

    /// Kernel name of partition `number` on this disk.
    pub fn partition_name(&self, number: u32) -> String {
        partition_name(&self.name(), number)
    }

    /// Writes the table to the disk and has the kernel re-read it.
    pub fn commit(&mut self, ctx: &StorageContext) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        tracing::info!("writing the {} label of {}", self.kind, self.device.display());

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device)
            .map_err(|why| OperationError::io(&self.device, why))?;

        match self.kind {
            PartitionTable::Gpt => self.write_gpt(&mut file)?,
            PartitionTable::Mbr => self.write_mbr(&mut file)?,
        }

        file.sync_all()
            .map_err(|why| OperationError::io(&self.device, why))?;

        let block_device = file
            .metadata()
            .map(|meta| meta.file_type().is_block_device())
            .unwrap_or(false);

        if block_device {
            gptman::linux::reread_partition_table(&mut file)
                .map_err(|why| table_error(&self.device, format!("kernel did not re-read the table: {}", why)))?;
        }

        if self.kind == PartitionTable::Mbr {
            if let Some(active) = self.entries.iter().find(|entry| entry.bootable) {
                let activate = ToolCommand::new("sfdisk")
                    .arg("--activate")
                    .path_arg(&self.device)
                    .arg(active.number.to_string());
                run_checked(ctx.runner(), &activate)?;
            }
        }

        self.fresh = false;
        self.dirty = false;
        Ok(())
    }

    fn write_gpt(&self, file: &mut File) -> Result<()> {
        let device = &self.device;
        let mut gpt = if self.fresh {
            let gpt = GPT::new_from(file, self.sector_size, random_guid())
                .map_err(|why| table_error(device, why))?;
            GPT::write_protective_mbr_into(file, self.sector_size)
                .map_err(|why| table_error(device, why))?;
            gpt
        } else {
            GPT::find_from(file).map_err(|why| table_error(device, why))?
        };

        let stale: Vec<u32> = gpt
            .iter()
            .filter(|(number, entry)| {
                entry.is_used()
                    && !self.entries.iter().any(|wanted| {
                        wanted.number == *number
                            && wanted.start == entry.starting_lba
                            && wanted.end == entry.ending_lba
                    })
            })
            .map(|(number, _)| number)
            .collect();

        for number in stale {
            gpt.remove(number).map_err(|why| table_error(device, why))?;
        }

        for wanted in &self.entries {
            let attributes = if wanted.bootable { GPT_LEGACY_BOOT } else { 0 };

            if gpt[wanted.number].is_used() {
                let entry = &mut gpt[wanted.number];
                entry.attribute_bits = (entry.attribute_bits & !GPT_LEGACY_BOOT) | attributes;
                continue;
            }

            let kind = wanted.gpt_type.as_deref().unwrap_or(LINUX_DATA_GUID);
            gpt[wanted.number] = GPTPartitionEntry {
                partition_type_guid: guid_from_str(kind)
                    .ok_or_else(|| table_error(device, format!("invalid partition type {}", kind)))?,
                unique_partition_guid: random_guid(),
                starting_lba: wanted.start,
                ending_lba: wanted.end,
                attribute_bits: attributes,
                partition_name: "".into(),
            };
        }

        gpt.write_into(file).map_err(|why| table_error(device, why))?;
        Ok(())
    }

    fn write_mbr(&self, file: &mut File) -> Result<()> {
        let device = &self.device;
        let sector_size = self.sector_size as u32;
        let mut mbr = if self.fresh {
            MBR::new_from(file, sector_size, rand::thread_rng().gen())
                .map_err(|why| table_error(device, why))?
        } else {
            file.seek(SeekFrom::Start(0))
                .map_err(|why| OperationError::io(device, why))?;
            MBR::read_from(file, sector_size).map_err(|why| table_error(device, why))?
        };

        for number in 1..=MBR_PRIMARY_LIMIT {
            let entry = &mut mbr[number];
            match self.entry(number as u32) {
                Some(wanted) => {
                    entry.sys = wanted.mbr_type;
                    entry.starting_lba = wanted.start as u32;
                    entry.sectors = wanted.sectors() as u32;
                }
                None => {
                    entry.sys = 0;
                    entry.starting_lba = 0;
                    entry.sectors = 0;
                }
            }
        }

        mbr.write_into(file).map_err(|why| table_error(device, why))
    }
}

const LINUX_DATA_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

/// Kernel name of partition `number` of the disk `disk`: `sda1`, `nvme0n1p1`.
pub fn partition_name(disk: &str, number: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, number)
    } else {
        format!("{}{}", disk, number)
    }
}

fn random_guid() -> [u8; 16] {
    rand::thread_rng().gen()
}

/// Parses a textual GUID into its on-disk, mixed-endian byte order.
pub fn guid_from_str(guid: &str) -> Option<[u8; 16]> {
    let hex: Vec<char> = guid.chars().filter(|&c| c != '-').collect();
    if hex.len() != 32 {
        return None;
    }

    let mut digits = hex
        .chunks(2)
        .map(|pair| u8::from_str_radix(&pair.iter().collect::<String>(), 16).ok())
        .collect::<Option<Vec<u8>>>()?;

    let mut reordered = Vec::with_capacity(16);
    reordered.extend(digits.drain(..4).rev());
    reordered.extend(digits.drain(..2).rev());
    reordered.extend(digits.drain(..2).rev());
    reordered.extend(digits.drain(..));

    let mut bytes = [0; 16];
    bytes.copy_from_slice(&reordered);
    Some(bytes)
}

pub fn guid_to_string(bytes: &[u8; 16]) -> String {
    format!(
        "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        bytes[3], bytes[2], bytes[1], bytes[0],
        bytes[5], bytes[4],
        bytes[7], bytes[6],
        bytes[8], bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::context::testing::{context, scratch_dir};
    use std::sync::Arc;

    const GB_SECTORS: u64 = 2 * 1024 * 1024;

    fn disk(size: u64) -> PathBuf {
        let path = scratch_dir("table").join("disk.img");
        File::create(&path).unwrap().set_len(size).unwrap();
        path
    }

    #[test]
    fn guids_are_mixed_endian() {
        let efi = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
        let bytes = guid_from_str(efi).unwrap();
        assert_eq!(
            bytes,
            [
                0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9,
                0x3e, 0xc9, 0x3b
            ]
        );
        assert_eq!(guid_to_string(&bytes), efi);
        assert!(guid_from_str("C12A7328-F81F").is_none());
        assert!(guid_from_str("ZZ2A7328-F81F-11D2-BA4B-00A0C93EC93B").is_none());
    }

    #[test]
    fn partition_names() {
        assert_eq!(partition_name("sda", 3), "sda3");
        assert_eq!(partition_name("nvme0n1", 1), "nvme0n1p1");
        assert_eq!(partition_name("mmcblk0", 2), "mmcblk0p2");
    }

    #[test]
    fn free_space_is_aligned() {
        let mut table = DiskTable::in_memory(Path::new("/dev/sda"), PartitionTable::Gpt, 512, GB_SECTORS);
        assert_eq!(table.last_usable, GB_SECTORS - 34);
        assert_eq!(
            table.free_regions(),
            vec![FreeRegion { start: 2048, end: GB_SECTORS - 34 }]
        );

        let first = table.add(2048, 206_847, 0xef, LINUX_DATA_GUID).unwrap();
        let second = table.add(411_648, 616_447, 0x83, LINUX_DATA_GUID).unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(table.size_mb(table.entry(1).unwrap().sectors()), 100);

        assert_eq!(
            table.free_regions(),
            vec![
                FreeRegion { start: 206_848, end: 411_647 },
                FreeRegion { start: 616_448, end: GB_SECTORS - 34 },
            ]
        );

        table.remove(1).unwrap();
        assert_eq!(table.add(4096, 8191, 0x83, LINUX_DATA_GUID).unwrap(), 1);
    }

    #[test]
    fn invalid_placements_are_refused() {
        let mut table = DiskTable::in_memory(Path::new("/dev/sda"), PartitionTable::Mbr, 512, GB_SECTORS);
        table.add(2048, 4095, 0x83, "").unwrap();

        assert!(table.add(4000, 8191, 0x83, "").is_err());
        assert!(table.add(8192, 4096, 0x83, "").is_err());
        assert!(table.add(8192, GB_SECTORS, 0x83, "").is_err());

        table.add(8192, 10_239, 0x83, "").unwrap();
        table.add(10_240, 12_287, 0x83, "").unwrap();
        table.add(12_288, 14_335, 0x83, "").unwrap();
        let error = table.add(16_384, 18_431, 0x83, "").unwrap_err();
        assert!(error.to_string().contains("no primary partitions are left"));
    }

    #[test]
    fn only_one_active_mbr_partition() {
        let mut table = DiskTable::in_memory(Path::new("/dev/sda"), PartitionTable::Mbr, 512, GB_SECTORS);
        table.add(2048, 4095, 0x83, "").unwrap();
        table.add(4096, 8191, 0x83, "").unwrap();

        table.set_bootable(1).unwrap();
        table.set_bootable(2).unwrap();
        assert!(!table.entry(1).unwrap().bootable);
        assert!(table.entry(2).unwrap().bootable);
        assert!(table.set_bootable(3).is_err());
    }

    #[test]
    fn gpt_tables_are_written_and_read_back() {
        let path = disk(64 * MEGABYTE);
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner.clone());

        let mut table = DiskTable::initialize(&path, PartitionTable::Gpt).unwrap();
        let efi = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
        table.add(2048, 51_199, 0xef, efi).unwrap();
        table.add(53_248, 102_399, 0x83, LINUX_DATA_GUID).unwrap();
        table.set_bootable(2).unwrap();
        table.commit(&ctx).unwrap();
        assert!(!table.is_dirty());

        let mut read = DiskTable::open(&path).unwrap();
        assert_eq!(read.kind, PartitionTable::Gpt);
        assert_eq!(read.entries().len(), 2);
        assert_eq!(read.entry(1).unwrap().gpt_type.as_deref(), Some(efi));
        assert_eq!(read.entry(2).unwrap().start, 53_248);
        assert!(read.entry(2).unwrap().bootable);

        read.remove(1).unwrap();
        read.commit(&ctx).unwrap();
        let read = DiskTable::open(&path).unwrap();
        assert_eq!(read.entries().len(), 1);
        assert_eq!(read.entry(2).unwrap().end, 102_399);

        assert!(runner.lines().is_empty());
    }

    #[test]
    fn mbr_tables_activate_the_boot_partition() {
        let path = disk(64 * MEGABYTE);
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner.clone());

        let mut table = DiskTable::initialize(&path, PartitionTable::Mbr).unwrap();
        table.add(2048, 104_447, 0x83, "").unwrap();
        table.add(104_448, 120_831, 0x82, "").unwrap();
        table.set_bootable(1).unwrap();
        table.commit(&ctx).unwrap();

        let read = DiskTable::open(&path).unwrap();
        assert_eq!(read.kind, PartitionTable::Mbr);
        assert_eq!(read.entry(2).unwrap().mbr_type, 0x82);
        assert_eq!(read.entry(2).unwrap().end, 120_831);

        assert_eq!(runner.lines(), vec![format!("sfdisk --activate {} 1", path.display())]);
    }

    #[test]
    fn unlabelled_disks_are_reported() {
        let path = disk(8 * MEGABYTE);
        let error = DiskTable::open(&path).unwrap_err();
        assert!(error.to_string().contains("no readable disk label"));
    }
}
