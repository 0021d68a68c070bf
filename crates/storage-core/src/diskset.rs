// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use crate::block_types::*;
use crate::config::StorageConfig;
use crate::context::StorageContext;
use crate::dmraid::{self, DmRaidSet};
use crate::errors::{OperationError, Result};
use crate::interface::{Interface, MessageKind};
use crate::os_probe::{self, ExistingRoot};
use crate::raid::{self, ArrayInfo};
use crate::requests::{
    DiskLayout, Partitions, ProbedArray, ProbedLogicalVolume, ProbedPartition, ProbedVolumeGroup,
    SanityEnv,
};
use crate::table::DiskTable;
use crate::udev::UDev;
use crate::{alloc, luks, lvm, ACellOwner};
use secstr::SecStr;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

const LUKS_SIGNATURE: &str = "crypto_LUKS";

/// How many rescans to wait for a freshly unlocked device map to appear.
const SETTLE_ATTEMPTS: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedDevice {
    pub device: String,
    pub uuid: String,
    /// The device map it is unlocked as.
    pub mapped: Option<String>,
}

/// Everything that must be torn down to close an encrypted device.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LockPlan {
    pub volume_groups: Vec<String>,
    /// `DM_NAME`s to close, innermost first.
    pub mappings: Vec<String>,
}

/// The disks of the system and their partition tables.
#[derive(Default)]
pub struct DiskSet {
    pub inventory: BlockInventory,
    tables: BTreeMap<String, DiskTable>,
    multipath: Vec<String>,
    dmraid: Vec<DmRaidSet>,
    arrays: Vec<ArrayInfo>,
    started: bool,
}

impl DiskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload block device information from the system.
    pub fn reload(&mut self, udev: &mut UDev, t: &mut ACellOwner) -> Result<()> {
        udev.scan(&mut self.inventory, t)
    }

    /// Activates multipath and firmware RAID before assembling software RAID on
    /// top of them, then activates every volume group.
    pub fn start_all(&mut self, ctx: &StorageContext) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.multipath = dmraid::start_multipath(ctx)?;
        self.dmraid = dmraid::start_all(ctx)?;
        self.arrays = raid::start_all(ctx)?;

        if let Err(why) = lvm::vg_activate_all(ctx) {
            tracing::warn!("failed to activate volume groups: {}", why);
        }

        self.started = true;
        Ok(())
    }

    /// Tears down what `start_all` created, in the reverse order.
    pub fn stop_all(&mut self, ctx: &StorageContext) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        if let Err(why) = lvm::vg_deactivate_all(ctx) {
            tracing::warn!("failed to deactivate volume groups: {}", why);
        }

        // Anything left running stays recorded, so a retry resumes from it.
        raid::stop_all(ctx, &mut self.arrays)?;

        dmraid::stop_all(ctx, &self.dmraid)?;
        self.dmraid.clear();

        dmraid::stop_multipath(ctx, &self.multipath)?;
        self.multipath.clear();

        self.started = false;
        Ok(())
    }

    /// Disks which may be partitioned, by device path.
    pub fn drive_list(&self, config: &StorageConfig, t: &ACellOwner) -> Vec<String> {
        self.inventory
            .disks(t)
            .filter(|disk| !disk.read_only)
            .filter(|disk| !is_protected(config, disk.device.short_name()))
            .map(|disk| disk.device.name.clone())
            .collect()
    }

    /// Opens the partition table of every drive which has not been opened yet.
    ///
    /// A drive whose label cannot be read is only relabelled once the user agrees,
    /// or when running unattended with every drive to be initialized.
    pub fn open_devices(&mut self, ctx: &StorageContext, intf: &dyn Interface, t: &ACellOwner) -> Result<()> {
        for drive in self.drive_list(&ctx.config, t) {
            let path = Path::new(&drive);
            let name = drive_name(&drive);

            if self.tables.contains_key(name) {
                continue;
            }

            let table = match DiskTable::open(path) {
                Ok(table) => table,
                Err(OperationError::Table { why, .. }) => {
                    tracing::warn!("{}: {}", drive, why);
                    if !should_initialize(&ctx.config, intf, name) {
                        tracing::info!("leaving {} untouched", drive);
                        continue;
                    }

                    DiskTable::initialize(path, ctx.platform.default_table())?
                }
                Err(why) => {
                    tracing::warn!("unable to open {}: {}", drive, why);
                    continue;
                }
            };

            self.tables.insert(name.to_owned(), table);
        }

        Ok(())
    }

    /// Forgets every open table, discarding uncommitted edits.
    pub fn close_devices(&mut self) {
        self.tables.clear();
    }

    pub fn tables(&self) -> &BTreeMap<String, DiskTable> {
        &self.tables
    }

    pub fn tables_mut(&mut self) -> &mut BTreeMap<String, DiskTable> {
        &mut self.tables
    }

    pub fn table(&self, drive: &str) -> Option<&DiskTable> {
        self.tables.get(drive_name(drive))
    }

    /// Places new partition requests onto the open tables and flags the boot
    /// partition. Nothing is written until `commit`.
    pub fn allocate(&mut self, ctx: &StorageContext, partitions: &mut Partitions) -> Result<()> {
        alloc::allocate(partitions, &mut self.tables, &ctx.registry)?;
        alloc::mark_bootable(partitions, &mut self.tables, &ctx.platform)
    }

    /// Writes every modified table to its disk.
    pub fn commit(&mut self, ctx: &StorageContext) -> Result<()> {
        for table in self.tables.values_mut().filter(|table| table.is_dirty()) {
            table.commit(ctx)?;
        }

        Ok(())
    }

    /// The facts about this system which the layout is validated against.
    pub fn sanity_env<'a>(&self, ctx: &'a StorageContext) -> SanityEnv<'a> {
        SanityEnv {
            registry: &ctx.registry,
            platform: ctx.platform,
            memory_mb: ctx.memory_mb(),
            disk_labels: self.tables.iter().map(|(name, table)| (name.clone(), table.kind)).collect(),
        }
    }

    /// Filesystem labels already present on the system.
    pub fn labels(&self, t: &ACellOwner) -> Vec<String> {
        let labels: BTreeSet<String> = self
            .inventory
            .blocks
            .values()
            .filter_map(|block| block.info(t).fs.as_ref()?.label.clone())
            .filter(|label| !label.is_empty())
            .collect();

        labels.into_iter().collect()
    }

    /// Describes the partitions of the open tables, with the arrays and volumes
    /// built on top of them.
    pub fn layout(&self, ctx: &StorageContext, t: &ACellOwner) -> Result<DiskLayout> {
        let mut layout = DiskLayout::default();

        for (drive, table) in &self.tables {
            for entry in table.entries() {
                let name = table.partition_name(entry.number);
                let fs = self.inventory.get(&name).and_then(|block| block.info(t).fs.clone());

                layout.partitions.push(ProbedPartition {
                    protected: is_protected(&ctx.config, &name) || is_protected(&ctx.config, drive),
                    drive: drive.clone(),
                    number: entry.number,
                    start: entry.start,
                    end: entry.end,
                    size_mb: table.size_mb(entry.sectors()),
                    signature: fs.as_ref().map(|fs| fs.kind.clone()),
                    label: fs.and_then(|fs| fs.label),
                    primary: true,
                    name,
                });
            }
        }

        for array in self.inventory.arrays(t) {
            let (minor, level) = match (raid::md_minor(Path::new(&array.device.name)), array.level) {
                (Some(minor), Some(level)) => (minor, level),
                _ => {
                    tracing::debug!("{}: skipping array of unknown minor or level", array.device.name);
                    continue;
                }
            };

            layout.arrays.push(ProbedArray {
                minor,
                level,
                members: array.members.iter().map(|member| short_name(member).to_owned()).collect(),
                signature: array.device.fs.as_ref().map(|fs| fs.kind.clone()),
            });
        }

        let pvs = lvm::pv_list(ctx)?;
        for group in lvm::vg_list(ctx)? {
            layout.volume_groups.push(ProbedVolumeGroup {
                pvs: pvs
                    .iter()
                    .filter(|pv| pv.vg.as_deref() == Some(group.name.as_str()))
                    .map(|pv| short_name(&pv.device.to_string_lossy()).to_owned())
                    .collect(),
                name: group.name,
                pe_kb: group.pe_kb,
            });
        }

        for volume in lvm::lv_list(ctx)? {
            let fs = self
                .inventory
                .maps(t)
                .find(|map| {
                    map.vg_name.as_deref() == Some(volume.vg.as_str())
                        && map.lv_name.as_deref() == Some(volume.name.as_str())
                })
                .and_then(|map| map.device.fs.clone());

            layout.logical_volumes.push(ProbedLogicalVolume {
                size_mb: volume.size_kb / 1024,
                signature: fs.as_ref().map(|fs| fs.kind.clone()),
                label: fs.and_then(|fs| fs.label),
                vg: volume.vg,
                name: volume.name,
            });
        }

        Ok(layout)
    }

    /// Every LUKS device on the system, and where it is mapped if unlocked.
    pub fn encrypted_devices(&self, t: &ACellOwner) -> Vec<EncryptedDevice> {
        self.inventory
            .blocks
            .iter()
            .filter_map(|(devname, block)| {
                let device = block.info(t);
                let fs = device.fs.as_ref().filter(|fs| fs.kind == LUKS_SIGNATURE)?;

                Some(EncryptedDevice {
                    device: devname.clone(),
                    uuid: fs.uuid.clone(),
                    mapped: device.children.first().cloned(),
                })
            })
            .collect()
    }

    /// Filesystems which may hold an installed system.
    pub fn root_candidates(&self, ctx: &StorageContext, t: &ACellOwner) -> Vec<(String, String)> {
        self.inventory
            .blocks
            .iter()
            .filter(|(_, block)| !matches!(block, BlockNode::Disk(_)))
            .filter_map(|(devname, block)| {
                let device = block.info(t);
                let fs = device.fs.as_ref()?;
                let kind = ctx.registry.kind_for_signature(&fs.kind)?;

                let eligible = kind.linux_native()
                    && kind.is_mounted_kind()
                    && !kind.is_swap()
                    && device.children.is_empty()
                    && !is_protected(&ctx.config, device.short_name());

                if eligible {
                    Some((devname.clone(), kind.fstab_type().to_owned()))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Mounts each candidate read-only and reports those carrying a release marker.
    pub fn find_existing_root_partitions(&self, ctx: &StorageContext, t: &ACellOwner) -> Vec<ExistingRoot> {
        self.root_candidates(ctx, t)
            .into_iter()
            .filter_map(|(device, fstype)| match os_probe::probe(ctx, &device, &fstype) {
                Ok(found) => found,
                Err(why) => {
                    tracing::debug!("{}: not probed: {}", device, why);
                    None
                }
            })
            .collect()
    }

    /// Unlock a LUKS partition, and activate its volumes.
    pub fn luks_unlock(
        &mut self,
        ctx: &StorageContext,
        device: &str,
        dm_name: &str,
        key: &SecStr,
        udev: &mut UDev,
        t: &mut ACellOwner,
    ) -> Result<()> {
        if self.inventory.get(device).is_none() {
            return Err(OperationError::UnknownDevice(device.to_owned()));
        }

        luks::open(ctx, Path::new(device), dm_name, key)?;

        // Volume groups may have been on this partition.
        if let Err(why) = lvm::vg_activate_all(ctx) {
            tracing::warn!("failed to activate volume groups on {}: {}", dm_name, why);
        }

        for _ in 0..SETTLE_ATTEMPTS {
            self.reload(udev, t)?;
            if self.inventory.map_by_dm_name(dm_name, t).is_some() {
                return Ok(());
            }

            std::thread::sleep(Duration::from_secs(1));
        }

        Err(OperationError::NotMaterialized {
            device: luks::mapper_path(dm_name).display().to_string(),
        })
    }

    /// What must be deactivated, and in which order, to close `device`.
    pub fn lock_plan(&self, device: &str, t: &ACellOwner) -> Result<LockPlan> {
        if self.inventory.get(device).is_none() {
            return Err(OperationError::UnknownDevice(device.to_owned()));
        }

        let mut plan = LockPlan::default();

        for child in self.inventory.descendants(device, t) {
            let map = match self.inventory.get(&child) {
                Some(BlockNode::DeviceMap(map)) => map.ro(t),
                _ => continue,
            };

            match map.vg_name.as_ref() {
                Some(vg) if !plan.volume_groups.contains(vg) => plan.volume_groups.push(vg.clone()),
                Some(_) => (),
                None => plan.mappings.push(map.name.clone()),
            }
        }

        plan.mappings.reverse();
        Ok(plan)
    }

    /// Close a LUKS partition, deactivating its volumes first.
    pub fn luks_lock(
        &mut self,
        ctx: &StorageContext,
        device: &str,
        udev: &mut UDev,
        t: &mut ACellOwner,
    ) -> Result<()> {
        let plan = self.lock_plan(device, t)?;

        for vg in &plan.volume_groups {
            lvm::vg_deactivate(ctx, vg)?;
        }

        for name in &plan.mappings {
            luks::close(ctx, name)?;
        }

        self.reload(udev, t)
    }
}

fn short_name(device: &str) -> &str {
    device.trim_start_matches("/dev/")
}

/// Tables are keyed by the kernel name of their disk.
fn drive_name(device: &str) -> &str {
    Path::new(device).file_name().and_then(OsStr::to_str).unwrap_or(device)
}

fn is_protected(config: &StorageConfig, name: &str) -> bool {
    config.protected.iter().any(|protected| short_name(protected) == name)
}

/// Whether a drive with an unreadable label may be given a new one.
fn should_initialize(config: &StorageConfig, intf: &dyn Interface, drive: &str) -> bool {
    if !config.interactive {
        return config.initialize_all;
    }

    intf.message_window(
        "Warning",
        &format!(
            "The partition table on device {} was unreadable. To create new partitions \
             it must be initialized, causing the loss of ALL DATA on this drive.\n\n\
             Would you like to initialize this drive, erasing ALL DATA?",
            drive
        ),
        MessageKind::YesNo,
    )
}
