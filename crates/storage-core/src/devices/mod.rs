// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Block devices that requests turn into, and that filesystems are placed on.
//!
//! Every variant knows how to bring itself into existence beneath a root prefix.
//! Materializing an already materialized device returns its path without invoking
//! any tool. Composite devices materialize what they are built from first.

mod file;
mod luks;
mod lvm;
mod raid;

pub use self::file::{BindMountDevice, LoopbackDevice, SwapFileDevice};
pub use self::luks::LuksDevice;
pub use self::lvm::{LogicalVolumeDevice, VolumeGroupDevice};
pub use self::raid::RaidDevice;

use crate::context::StorageContext;
use crate::errors::Result;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub enum Device {
    Partition(PartitionDevice),
    Raid(RaidDevice),
    VolumeGroup(VolumeGroupDevice),
    LogicalVolume(LogicalVolumeDevice),
    Luks(LuksDevice),
    Loopback(LoopbackDevice),
    SwapFile(SwapFileDevice),
    BindMount(BindMountDevice),
    /// Kernel filesystems such as proc, which have no backing device.
    Pseudo(PseudoDevice),
}

impl Device {
    pub fn partition(name: &str) -> Self {
        Device::Partition(PartitionDevice::new(name))
    }

    pub fn pseudo(source: &str) -> Self {
        Device::Pseudo(PseudoDevice {
            source: source.to_owned(),
        })
    }

    /// Creates whatever is missing for this device to exist, returning its path.
    pub fn materialize(&mut self, ctx: &StorageContext, root: &Path) -> Result<PathBuf> {
        match self {
            Device::Partition(dev) => dev.materialize(root),
            Device::Raid(dev) => dev.materialize(ctx, root),
            Device::VolumeGroup(dev) => dev.materialize(ctx, root),
            Device::LogicalVolume(dev) => dev.materialize(ctx),
            Device::Luks(dev) => dev.materialize(ctx, root),
            Device::Loopback(dev) => dev.materialize(ctx),
            Device::SwapFile(dev) => dev.materialize(root),
            Device::BindMount(dev) => dev.materialize(),
            Device::Pseudo(dev) => Ok(PathBuf::from(&dev.source)),
        }
    }

    /// Deactivates this device and then what it was built from.
    pub fn teardown(&mut self, ctx: &StorageContext) -> Result<()> {
        match self {
            Device::Raid(dev) => dev.teardown(ctx),
            Device::VolumeGroup(dev) => dev.teardown(ctx),
            Device::LogicalVolume(dev) => dev.teardown(ctx),
            Device::Luks(dev) => dev.teardown(ctx),
            Device::Loopback(dev) => dev.teardown(ctx),
            Device::Partition(_) | Device::SwapFile(_) | Device::BindMount(_) | Device::Pseudo(_) => {
                Ok(())
            }
        }
    }

    /// The path this device is, or will be, reachable at.
    pub fn path(&self) -> PathBuf {
        match self {
            Device::Partition(dev) => dev.path(),
            Device::Raid(dev) => dev.path(),
            Device::VolumeGroup(dev) => dev.path(),
            Device::LogicalVolume(dev) => dev.path(),
            Device::Luks(dev) => dev.mapped_path(),
            Device::Loopback(dev) => dev.path(),
            Device::SwapFile(dev) => dev.path.clone(),
            Device::BindMount(dev) => dev.source.clone(),
            Device::Pseudo(dev) => PathBuf::from(&dev.source),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Device::Partition(dev) => dev.name.clone(),
            Device::Raid(dev) => format!("md{}", dev.minor),
            Device::VolumeGroup(dev) => dev.name.clone(),
            Device::LogicalVolume(dev) => format!("{}/{}", dev.vg.name, dev.name),
            Device::Luks(dev) => dev.name.clone(),
            Device::Loopback(dev) => dev.name.clone(),
            Device::SwapFile(dev) => dev.path.display().to_string(),
            Device::BindMount(dev) => dev.source.display().to_string(),
            Device::Pseudo(dev) => dev.source.clone(),
        }
    }

    /// Name written in the device column of the mount table.
    pub fn fstab_name(&self) -> String {
        match self {
            Device::Pseudo(dev) => dev.source.clone(),
            _ => self.path().display().to_string(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Device::Luks(_))
    }

    /// The device a LUKS wrapper encrypts, or the device itself.
    pub fn unwrapped(&self) -> &Device {
        match self {
            Device::Luks(dev) => dev.inner.as_ref(),
            _ => self,
        }
    }
}

/// A partition named by its kernel device name, such as `sda1`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionDevice {
    pub name: String,
}

impl PartitionDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim_start_matches("/dev/").to_owned(),
        }
    }

    pub fn path(&self) -> PathBuf {
        Path::new("/dev").join(&self.name)
    }

    fn materialize(&self, root: &Path) -> Result<PathBuf> {
        if root != Path::new("/") {
            ensure_node(&self.name, &root.join("dev").join(&self.name));
        }

        Ok(self.path())
    }
}

/// Creates a block node for `name` at `target`, if the kernel knows of the device.
fn ensure_node(name: &str, target: &Path) {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    if target.exists() {
        return;
    }

    let numbers = match fs::read_to_string(Path::new("/sys/class/block").join(name).join("dev")) {
        Ok(numbers) => numbers,
        Err(_) => return,
    };

    let (major, minor) = match numbers.trim().split_once(':') {
        Some((major, minor)) => match (major.parse::<u64>(), minor.parse::<u64>()) {
            (Ok(major), Ok(minor)) => (major, minor),
            _ => return,
        },
        None => return,
    };

    if let Some(parent) = target.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let mode = Mode::from_bits_truncate(0o600);
    if let Err(why) = mknod(target, SFlag::S_IFBLK, mode, makedev(major, minor)) {
        tracing::warn!("unable to create device node {:?}: {}", target, why);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PseudoDevice {
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::context::testing::context;
    use crate::errors::{LuksError, OperationError};
    use crate::raid::RaidLevel;
    use secstr::SecStr;
    use std::sync::Arc;

    fn members() -> Vec<Device> {
        vec![Device::partition("vdz1"), Device::partition("vdz2")]
    }

    #[test]
    fn empty_passphrase_fails_before_any_tool() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner.clone());

        let raid = Device::Raid(RaidDevice::new(0, RaidLevel::Raid1, members(), 0, None, false));
        let mut luks = Device::Luks(LuksDevice::new(raid, "luks-md0", Some(SecStr::from("")), true));

        match luks.materialize(&ctx, Path::new("/")) {
            Err(OperationError::Luks(LuksError::NoPassphrase(_))) => (),
            other => panic!("expected a missing passphrase, got {:?}", other),
        }

        assert!(runner.calls().is_empty());
    }

    #[test]
    fn volume_groups_precede_their_volumes() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner.clone());

        let vg = VolumeGroupDevice::new("VolGroup00", members(), 32768, false);
        let mut lv = Device::LogicalVolume(LogicalVolumeDevice::new(
            Arc::new(vg.clone()),
            "LogVol00",
            480,
            false,
        ));

        match lv.materialize(&ctx, Path::new("/")) {
            Err(OperationError::NotMaterialized { .. }) => (),
            other => panic!("expected an unmaterialized group, got {:?}", other),
        }
        assert!(runner.calls().is_empty());

        let mut vg = Device::VolumeGroup(vg);
        assert_eq!(vg.materialize(&ctx, Path::new("/")).unwrap(), PathBuf::from("/dev/VolGroup00"));
        assert_eq!(
            lv.materialize(&ctx, Path::new("/")).unwrap(),
            PathBuf::from("/dev/VolGroup00/LogVol00")
        );

        assert_eq!(
            runner.lines(),
            vec![
                "mdadm --zero-superblock /dev/vdz1",
                "lvm pvcreate -ff -y -v /dev/vdz1",
                "mdadm --zero-superblock /dev/vdz2",
                "lvm pvcreate -ff -y -v /dev/vdz2",
                "lvm vgcreate -v -An -s 32768k VolGroup00 /dev/vdz1 /dev/vdz2",
                "lvm lvcreate -v -L 480M -n LogVol00 -An VolGroup00",
            ]
        );

        // A second pass finds everything in place.
        vg.materialize(&ctx, Path::new("/")).unwrap();
        lv.materialize(&ctx, Path::new("/")).unwrap();
        assert_eq!(runner.calls().len(), 6);

        lv.teardown(&ctx).unwrap();
        vg.teardown(&ctx).unwrap();
        let lines = runner.lines();
        assert_eq!(lines[6], "lvm lvchange -an VolGroup00/LogVol00");
        assert_eq!(lines[7], "lvm vgchange -an VolGroup00");
    }

    #[test]
    fn arrays_need_enough_members() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner.clone());

        let mut raid = Device::Raid(RaidDevice::new(
            3,
            RaidLevel::Raid5,
            members(),
            0,
            Some(64),
            false,
        ));

        match raid.materialize(&ctx, Path::new("/")) {
            Err(OperationError::Assembly(error)) => {
                assert_eq!(error.required, 3);
                assert_eq!(error.available, 2);
            }
            other => panic!("expected an assembly failure, got {:?}", other),
        }

        assert!(runner.calls().is_empty());
        assert!(!ctx.minors.in_use(3));
    }

    #[test]
    fn arrays_claim_their_minor() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner.clone());

        let mut raid = Device::Raid(RaidDevice::new(1, RaidLevel::Raid1, members(), 0, None, false));
        assert_eq!(raid.materialize(&ctx, Path::new("/")).unwrap(), PathBuf::from("/dev/md1"));
        assert!(ctx.minors.in_use(1));
        assert_eq!(runner.calls().len(), 1);

        raid.teardown(&ctx).unwrap();
        assert!(!ctx.minors.in_use(1));

        // Once created, the array is reassembled rather than recreated.
        raid.materialize(&ctx, Path::new("/")).unwrap();
        assert!(runner.lines()[2].starts_with("mdadm --assemble /dev/md1 --run"));
    }

    #[test]
    fn new_arrays_need_every_member() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner.clone());

        let unopenable = Device::Luks(LuksDevice::new(
            Device::partition("vdz4"),
            "luks-vdz4",
            Some(SecStr::from("")),
            true,
        ));

        let mut members = members();
        members.push(Device::partition("vdz3"));
        members.push(unopenable);

        let mut raid = RaidDevice::new(2, RaidLevel::Raid5, members, 0, None, false);
        match raid.materialize(&ctx, Path::new("/")) {
            Err(OperationError::Assembly(error)) => {
                assert_eq!(error.required, 4);
                assert_eq!(error.available, 3);
            }
            other => panic!("expected an assembly failure, got {:?}", other),
        }
        assert!(runner.calls().is_empty());
        assert!(!ctx.minors.in_use(2));

        // An array already on disk may start without the missing member.
        raid.existing = true;
        assert_eq!(raid.materialize(&ctx, Path::new("/")).unwrap(), PathBuf::from("/dev/md2"));
        assert_eq!(
            runner.lines(),
            vec!["mdadm --assemble /dev/md2 --run /dev/vdz1 /dev/vdz2 /dev/vdz3"]
        );
    }
}
