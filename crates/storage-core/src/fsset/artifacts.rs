// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Configuration files written into the installed system.

use super::{EntryState, FileSystemSet, FileSystemSetEntry};
use crate::devices::Device;
use crate::errors::{OperationError, Result};
use crate::raid::{self, ConfArray};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

impl FileSystemSetEntry {
    /// Device column of the mount table.
    fn fstab_device(&self) -> String {
        if let Some(label) = self.label.as_deref() {
            let on_volume = matches!(self.device.unwrapped(), Device::LogicalVolume(_));
            if self.kind.supports_label() && !on_volume {
                return format!("LABEL={}", label);
            }
        }

        self.device.fstab_name()
    }

    fn fstab_mountpoint(&self) -> &str {
        if self.kind.is_swap() {
            "swap"
        } else {
            self.mountpoint.as_deref().unwrap_or("none")
        }
    }
}

impl FileSystemSet {
    /// Contents of `/etc/fstab`.
    pub fn fstab(&self) -> String {
        let mut fstab = String::from("#\n# /etc/fstab\n# Created by the installer\n#\n");

        for entry in self.entries.iter().filter(|e| e.is_mountable()) {
            fstab.push_str(&format!(
                "{:<23} {:<23} {:<7} {:<15} {} {}\n",
                entry.fstab_device(),
                entry.fstab_mountpoint(),
                entry.kind.fstab_type(),
                entry.mount_options(),
                entry.fsck_pass(),
                entry.fsck_order()
            ));
        }

        fstab
    }

    /// Contents of `/etc/mtab`, listing what is currently mounted. Swap is omitted.
    pub fn mtab(&self) -> String {
        let mut mtab = String::new();

        for entry in &self.entries {
            if entry.state != EntryState::Mounted || entry.kind.is_swap() {
                continue;
            }

            if let Some(mountpoint) = entry.mountpoint.as_deref() {
                mtab.push_str(&format!(
                    "{} {} {} rw,{} 0 0\n",
                    entry.device.fstab_name(),
                    mountpoint,
                    entry.kind.fstab_type(),
                    entry.mount_options()
                ));
            }
        }

        mtab
    }

    /// Contents of `/etc/crypttab`, or nothing if no entry is encrypted.
    pub fn crypttab(&self) -> Option<String> {
        let mut lines = Vec::new();
        for entry in &self.entries {
            collect_luks(&entry.device, &mut lines);
        }

        if lines.is_empty() {
            return None;
        }

        lines.sort();
        lines.dedup();
        Some(lines.into_iter().map(|line| line + "\n").collect())
    }

    /// Arrays backing any entry, keyed by minor.
    pub fn raid_arrays(&self) -> Vec<ConfArray> {
        let mut arrays = BTreeMap::new();
        for entry in &self.entries {
            collect_raids(&entry.device, &mut arrays);
        }

        arrays.into_values().collect()
    }

    /// Writes the mount tables, and the md and crypt tables when they are needed,
    /// into `prefix/etc`.
    pub fn write(&self, prefix: &Path) -> Result<()> {
        let etc = prefix.join("etc");
        fs::create_dir_all(&etc).map_err(|why| OperationError::io(&etc, why))?;

        write_file(&etc.join("fstab"), &self.fstab())?;
        write_file(&etc.join("mtab"), &self.mtab())?;

        let arrays = self.raid_arrays();
        if !arrays.is_empty() {
            write_file(&etc.join("mdadm.conf"), &raid::mdadm_conf(&arrays))?;
        }

        if let Some(crypttab) = self.crypttab() {
            write_file(&etc.join("crypttab"), &crypttab)?;
        }

        Ok(())
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    tracing::debug!("writing {:?}", path);
    fs::write(path, contents).map_err(|why| OperationError::io(path, why))
}

fn collect_raids(device: &Device, arrays: &mut BTreeMap<u32, ConfArray>) {
    match device {
        Device::Raid(array) => {
            arrays.insert(
                array.minor,
                ConfArray {
                    minor: array.minor,
                    level: array.level,
                    // Spares are not counted in the superblock's device count.
                    members: array.members.len() - array.spares.min(array.members.len()),
                },
            );

            for member in &array.members {
                collect_raids(member, arrays);
            }
        }
        Device::VolumeGroup(vg) => vg.pvs.iter().for_each(|pv| collect_raids(pv, arrays)),
        Device::LogicalVolume(lv) => lv.vg.pvs.iter().for_each(|pv| collect_raids(pv, arrays)),
        Device::Luks(luks) => collect_raids(&luks.inner, arrays),
        _ => (),
    }
}

fn collect_luks(device: &Device, lines: &mut Vec<String>) {
    match device {
        Device::Luks(luks) => {
            lines.push(luks.crypttab_line());
            collect_luks(&luks.inner, lines);
        }
        Device::Raid(array) => array.members.iter().for_each(|m| collect_luks(m, lines)),
        Device::VolumeGroup(vg) => vg.pvs.iter().for_each(|pv| collect_luks(pv, lines)),
        Device::LogicalVolume(lv) => lv.vg.pvs.iter().for_each(|pv| collect_luks(pv, lines)),
        _ => (),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::context::testing::{context, scratch_dir};
    use crate::devices::{LuksDevice, RaidDevice};
    use crate::raid::RaidLevel;
    use std::sync::Arc;

    #[test]
    fn fstab_columns_are_fixed_width() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner);
        let mut set = FileSystemSet::new(&ctx.registry).unwrap();
        let ext3 = ctx.registry.get("ext3").unwrap().clone();
        let swap = ctx.registry.get("swap").unwrap().clone();

        set.add(FileSystemSetEntry::new(Device::partition("sda1"), Some("/"), ext3).with_label("/"));
        set.add(FileSystemSetEntry::new(Device::partition("sda2"), None, swap));

        let fstab = set.fstab();
        let lines: Vec<&str> = fstab.lines().filter(|l| !l.starts_with('#')).collect();

        assert_eq!(
            lines[0],
            "/dev/sda2               swap                    swap    defaults        0 0"
        );
        assert_eq!(
            lines[1],
            "LABEL=/                 /                       ext3    defaults        1 1"
        );
        assert_eq!(
            lines[2],
            "devpts                  /dev/pts                devpts  gid=5,mode=620  0 0"
        );
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn mtab_lists_mounted_filesystems_only() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner);
        let mut set = FileSystemSet::new(&ctx.registry).unwrap();
        let ext3 = ctx.registry.get("ext3").unwrap().clone();
        let swap = ctx.registry.get("swap").unwrap().clone();

        set.add(FileSystemSetEntry::new(Device::partition("sda1"), Some("/"), ext3.clone()));
        set.add(FileSystemSetEntry::new(Device::partition("sda3"), Some("/home"), ext3));
        set.add(FileSystemSetEntry::new(Device::partition("sda2"), None, swap));

        for entry in set.entries.iter_mut() {
            if entry.mountpoint.as_deref() != Some("/home") {
                entry.state = EntryState::Mounted;
            }
        }

        let mtab = set.mtab();
        assert!(mtab.contains("/dev/sda1 / ext3 rw,defaults 0 0\n"));
        assert!(mtab.contains("proc /proc proc rw,defaults 0 0\n"));
        assert!(!mtab.contains("sda2"));
        assert!(!mtab.contains("/home"));
    }

    #[test]
    fn raid_and_crypt_tables() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner);
        let mut set = FileSystemSet::new(&ctx.registry).unwrap();
        let ext3 = ctx.registry.get("ext3").unwrap().clone();

        let members = vec![Device::partition("sda1"), Device::partition("sdb1")];
        let md0 = Device::Raid(RaidDevice::new(0, RaidLevel::Raid1, members, 0, None, false));
        set.add(FileSystemSetEntry::new(md0, Some("/boot"), ext3.clone()));

        let md1 = Device::Raid(RaidDevice::new(
            1,
            RaidLevel::Raid5,
            vec![Device::partition("sda2"), Device::partition("sdb2"), Device::partition("sdc2")],
            0,
            Some(64),
            false,
        ));
        let luks = Device::Luks(LuksDevice::new(md1, "luks-md1", None, true));
        set.add(FileSystemSetEntry::new(luks, Some("/"), ext3));

        let prefix = scratch_dir("artifacts");
        set.write(&prefix).unwrap();

        let mdadm = fs::read_to_string(prefix.join("etc/mdadm.conf")).unwrap();
        assert!(mdadm.contains("DEVICE partitions\nMAILADDR root\n"));
        assert!(mdadm.contains("ARRAY /dev/md0 super-minor=0 level=raid1 num-devices=2\n"));
        assert!(mdadm.contains("ARRAY /dev/md1 super-minor=1 level=raid5 num-devices=3\n"));

        let crypttab = fs::read_to_string(prefix.join("etc/crypttab")).unwrap();
        assert_eq!(crypttab, "luks-md1 /dev/md1 none\n");

        let fstab = fs::read_to_string(prefix.join("etc/fstab")).unwrap();
        assert!(fstab.contains("/dev/mapper/luks-md1"));
        assert!(prefix.join("etc/mtab").exists());
    }

    #[test]
    fn md_table_counts_active_devices_only() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner);
        let mut set = FileSystemSet::new(&ctx.registry).unwrap();
        let ext4 = ctx.registry.get("ext4").unwrap().clone();

        let members = ["sda1", "sdb1", "sdc1", "sdd1"].iter().map(|name| Device::partition(name)).collect();
        let md0 = Device::Raid(RaidDevice::new(0, RaidLevel::Raid5, members, 1, None, false));
        set.add(FileSystemSetEntry::new(md0, Some("/"), ext4));

        let arrays = set.raid_arrays();
        assert_eq!(arrays.len(), 1);
        assert_eq!(arrays[0].members, 3);

        let prefix = scratch_dir("artifacts-spares");
        set.write(&prefix).unwrap();

        let mdadm = fs::read_to_string(prefix.join("etc/mdadm.conf")).unwrap();
        assert!(mdadm.contains("ARRAY /dev/md0 super-minor=0 level=raid5 num-devices=3\n"));
    }
}
