// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Descriptions of the storage the installation wants, before any of it is applied.

mod bootable;
mod delete;
mod from_disk;
mod partitions;
mod sanity;

pub use self::bootable::bootable_mountpoints;
pub use self::delete::{
    DeleteLogicalVolumeSpec, DeleteRaidSpec, DeleteRequest, DeleteSpec, DeleteVolumeGroupSpec,
};
pub use self::from_disk::{
    DiskLayout, ProbedArray, ProbedLogicalVolume, ProbedPartition, ProbedVolumeGroup,
};
pub use self::partitions::{Applied, Partitions};
pub use self::sanity::{SanityEnv, SanityReport};

use crate::lvm::DEFAULT_PE_SIZE_KB;
use crate::raid::RaidLevel;
use secstr::SecStr;

pub const RAID_MEMBER_KIND: &str = "software RAID";
pub const PHYSICAL_VOLUME_KIND: &str = "physical volume (LVM)";
pub const VOLUME_GROUP_KIND: &str = "volume group (LVM)";

/// Encryption layered on top of the request's device.
#[derive(Clone, Debug, Default)]
pub struct Encryption {
    pub passphrase: Option<SecStr>,
    /// Create a new LUKS header rather than open an existing one.
    pub format: bool,
}

impl Encryption {
    pub fn new(passphrase: SecStr) -> Self {
        Self {
            passphrase: Some(passphrase),
            format: true,
        }
    }

    /// An existing LUKS device, to be unlocked with `passphrase`.
    pub fn existing(passphrase: Option<SecStr>) -> Self {
        Self {
            passphrase,
            format: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionSpec {
    pub size_mb: u64,
    /// Take a share of the remaining space on the disk.
    pub grow: bool,
    pub max_size_mb: Option<u64>,
    /// First sector, when placement is fixed.
    pub start: Option<u64>,
    /// Last sector, when placement is fixed.
    pub end: Option<u64>,
    /// Disks the partition may be placed on. Empty means any.
    pub drives: Vec<String>,
    pub primary: bool,
    /// Kernel name of the partition, once it has been placed.
    pub device: Option<String>,
    /// Disk the partition was placed on.
    pub drive: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaidRequestSpec {
    pub level: RaidLevel,
    /// Unique ids of the member requests. Spares are the last `spares` of them.
    pub members: Vec<u32>,
    pub spares: usize,
    pub minor: Option<u32>,
    pub chunk_kb: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeGroupRequestSpec {
    pub name: String,
    pub pvs: Vec<u32>,
    pub pe_kb: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalVolumeRequestSpec {
    /// Unique id of the volume group request.
    pub vg: u32,
    pub name: String,
    pub size_mb: u64,
    /// Size as a share of the group, which takes precedence over `size_mb`.
    pub percent: Option<u32>,
    pub grow: bool,
    pub max_size_mb: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Partition(PartitionSpec),
    Raid(RaidRequestSpec),
    VolumeGroup(VolumeGroupRequestSpec),
    LogicalVolume(LogicalVolumeRequestSpec),
}

impl RequestKind {
    /// Requests are kept in this order, so that anything a request refers to
    /// precedes it.
    fn rank(&self) -> u8 {
        match self {
            RequestKind::Partition(_) => 0,
            RequestKind::Raid(_) => 1,
            RequestKind::VolumeGroup(_) => 2,
            RequestKind::LogicalVolume(_) => 3,
        }
    }

    /// Ids of the requests this one is built on.
    fn references(&self) -> Vec<u32> {
        match self {
            RequestKind::Partition(_) => Vec::new(),
            RequestKind::Raid(spec) => spec.members.clone(),
            RequestKind::VolumeGroup(spec) => spec.pvs.clone(),
            RequestKind::LogicalVolume(spec) => vec![spec.vg],
        }
    }
}

/// A new or existing storage object.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    /// Assigned by [`Partitions::add_request`].
    pub unique_id: Option<u32>,
    pub fstype: String,
    /// Kind found on disk, for existing requests.
    pub origfstype: Option<String>,
    pub mountpoint: Option<String>,
    format: bool,
    migrate: bool,
    pub preexist: bool,
    /// Holds the installation media, and must not be modified.
    pub protected: bool,
    pub badblocks: bool,
    pub fslabel: Option<String>,
    pub encryption: Option<Encryption>,
    pub kind: RequestKind,
}

impl RequestSpec {
    fn with_kind(fstype: &str, kind: RequestKind) -> Self {
        Self {
            unique_id: None,
            fstype: fstype.to_owned(),
            origfstype: None,
            mountpoint: None,
            format: true,
            migrate: false,
            preexist: false,
            protected: false,
            badblocks: false,
            fslabel: None,
            encryption: None,
            kind,
        }
    }

    /// A new partition of `size_mb`, to be placed on any disk.
    pub fn partition(fstype: &str, size_mb: u64) -> Self {
        Self::with_kind(
            fstype,
            RequestKind::Partition(PartitionSpec {
                size_mb,
                ..PartitionSpec::default()
            }),
        )
    }

    pub fn raid(fstype: &str, level: RaidLevel, members: Vec<u32>, spares: usize) -> Self {
        Self::with_kind(
            fstype,
            RequestKind::Raid(RaidRequestSpec {
                level,
                members,
                spares,
                minor: None,
                chunk_kb: None,
            }),
        )
    }

    pub fn volume_group(name: &str, pvs: Vec<u32>, pe_kb: Option<u64>) -> Self {
        let mut request = Self::with_kind(
            VOLUME_GROUP_KIND,
            RequestKind::VolumeGroup(VolumeGroupRequestSpec {
                name: name.to_owned(),
                pvs,
                pe_kb: pe_kb.unwrap_or(DEFAULT_PE_SIZE_KB),
            }),
        );
        request.format = false;
        request
    }

    pub fn logical_volume(fstype: &str, vg: u32, name: &str, size_mb: u64) -> Self {
        Self::with_kind(
            fstype,
            RequestKind::LogicalVolume(LogicalVolumeRequestSpec {
                vg,
                name: name.to_owned(),
                size_mb,
                percent: None,
                grow: false,
                max_size_mb: None,
            }),
        )
    }

    pub fn with_mountpoint(mut self, mountpoint: &str) -> Self {
        self.mountpoint = Some(mountpoint.to_owned());
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.fslabel = Some(label.to_owned());
        self
    }

    pub fn with_encryption(mut self, encryption: Encryption) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Marks the request as describing something already on disk, which is
    /// kept as-is unless told otherwise.
    pub fn preexisting(mut self) -> Self {
        self.preexist = true;
        self.format = false;
        self.origfstype = Some(self.fstype.clone());
        self
    }

    pub fn format(&self) -> bool {
        self.format
    }

    pub fn migrate(&self) -> bool {
        self.migrate
    }

    /// Formatting and migrating are mutually exclusive. Enabling one disables the other.
    pub fn set_format(&mut self, format: bool) {
        self.format = format;
        if format {
            self.migrate = false;
        }
    }

    pub fn set_migrate(&mut self, migrate: bool) {
        self.migrate = migrate;
        if migrate {
            self.format = false;
        }
    }

    pub fn as_partition(&self) -> Option<&PartitionSpec> {
        match &self.kind {
            RequestKind::Partition(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_partition_mut(&mut self) -> Option<&mut PartitionSpec> {
        match &mut self.kind {
            RequestKind::Partition(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_raid(&self) -> Option<&RaidRequestSpec> {
        match &self.kind {
            RequestKind::Raid(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_volume_group(&self) -> Option<&VolumeGroupRequestSpec> {
        match &self.kind {
            RequestKind::VolumeGroup(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_logical_volume(&self) -> Option<&LogicalVolumeRequestSpec> {
        match &self.kind {
            RequestKind::LogicalVolume(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Human readable name of the request, used in messages.
    pub fn describe(&self) -> String {
        match &self.kind {
            RequestKind::Partition(spec) => spec
                .device
                .clone()
                .or_else(|| self.mountpoint.clone())
                .unwrap_or_else(|| format!("new {} partition", self.fstype)),
            RequestKind::Raid(spec) => match spec.minor {
                Some(minor) => format!("md{}", minor),
                None => format!("new {} device", spec.level),
            },
            RequestKind::VolumeGroup(spec) => spec.name.clone(),
            RequestKind::LogicalVolume(spec) => spec.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_and_migrate_exclude_each_other() {
        let mut request = RequestSpec::partition("ext3", 1024).preexisting();
        assert!(!request.format());

        request.set_migrate(true);
        assert!(request.migrate());

        request.set_format(true);
        assert!(request.format());
        assert!(!request.migrate());

        request.set_migrate(true);
        assert!(!request.format());
    }

    #[test]
    fn volume_groups_default_their_extent_size() {
        let vg = RequestSpec::volume_group("VolGroup00", vec![1, 2], None);
        assert_eq!(vg.as_volume_group().unwrap().pe_kb, DEFAULT_PE_SIZE_KB);
        assert_eq!(vg.fstype, VOLUME_GROUP_KIND);
        assert!(!vg.format());
    }
}
