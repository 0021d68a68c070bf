// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Catalog of the filesystem kinds the installer knows how to handle.

use crate::errors::NotFoundError;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FsFlags: u16 {
        const FORMATTABLE = 1 << 0;
        /// Participates in fsck ordering.
        const CHECKED = 1 << 1;
        const LINUX_NATIVE = 1 << 2;
        const BOOTABLE = 1 << 3;
        const SUPPORTS_LABEL = 1 << 4;
        /// Kernel pseudo filesystems that are never backed by a block device.
        const PSEUDO = 1 << 5;
        /// Mountable regardless of `/proc/filesystems`.
        const ALWAYS_MOUNTABLE = 1 << 6;
    }
}

/// Determines which tools operate on a kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsFlavor {
    Ext2,
    Ext3,
    Ext4,
    Reiserfs,
    Xfs,
    Jfs,
    Gfs2,
    Vfat,
    Efi,
    Hfs,
    Swap,
    RaidMember,
    PhysicalVolume,
    VolumeGroup,
    PrepBoot,
    AppleBootstrap,
    Iso9660,
    Nfs,
    Bind,
    Foreign,
    Proc,
    Sysfs,
    Devpts,
    Tmpfs,
}

impl FsFlavor {
    pub fn is_ext(self) -> bool {
        matches!(self, FsFlavor::Ext2 | FsFlavor::Ext3 | FsFlavor::Ext4)
    }
}

/// An immutable capability descriptor for one filesystem kind.
#[derive(Clone, Debug, PartialEq)]
pub struct FilesystemType {
    pub name: String,
    pub flavor: FsFlavor,
    /// Name listed in `/proc/filesystems` and passed to mount(2).
    pub kernel_name: Option<String>,
    pub flags: FsFlags,
    pub max_size_mb: u64,
    pub default_options: String,
    pub migration_targets: Vec<String>,
    pub max_label_chars: usize,
    pub needed_packages: Vec<String>,
    pub mbr_type: u8,
    pub gpt_type: String,
}

const TB: u64 = 1024 * 1024;

const GPT_LINUX: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
const GPT_SWAP: &str = "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F";
const GPT_RAID: &str = "A19D880F-05FC-4D3B-A006-743F0F84911E";
const GPT_LVM: &str = "E6D6D379-F507-44C2-A23C-238F2A3DF928";
const GPT_EFI: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
const GPT_BASIC_DATA: &str = "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7";
const GPT_PREP: &str = "9E1A2D38-C612-4316-AA26-8B49521E5A8B";
const GPT_HFS: &str = "48465300-0000-11AA-AA11-00306543ECAC";

impl FilesystemType {
    pub fn new(name: &str, flavor: FsFlavor, kernel_name: Option<&str>, flags: FsFlags) -> Self {
        Self {
            name: name.to_owned(),
            flavor,
            kernel_name: kernel_name.map(String::from),
            flags,
            max_size_mb: 8 * TB,
            default_options: "defaults".to_owned(),
            migration_targets: Vec::new(),
            max_label_chars: 0,
            needed_packages: Vec::new(),
            mbr_type: 0x83,
            gpt_type: GPT_LINUX.to_owned(),
        }
    }

    pub fn max_size(mut self, mb: u64) -> Self {
        self.max_size_mb = mb;
        self
    }

    pub fn options(mut self, options: &str) -> Self {
        self.default_options = options.to_owned();
        self
    }

    pub fn migrates_to(mut self, targets: &[&str]) -> Self {
        self.migration_targets = targets.iter().map(|t| (*t).to_owned()).collect();
        self
    }

    pub fn labels(mut self, max_chars: usize) -> Self {
        self.max_label_chars = max_chars;
        self.flags |= FsFlags::SUPPORTS_LABEL;
        self
    }

    pub fn packages(mut self, packages: &[&str]) -> Self {
        self.needed_packages = packages.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    pub fn partition_type(mut self, mbr: u8, gpt: &str) -> Self {
        self.mbr_type = mbr;
        self.gpt_type = gpt.to_owned();
        self
    }

    pub fn formattable(&self) -> bool {
        self.flags.contains(FsFlags::FORMATTABLE)
    }

    pub fn checked(&self) -> bool {
        self.flags.contains(FsFlags::CHECKED)
    }

    pub fn linux_native(&self) -> bool {
        self.flags.contains(FsFlags::LINUX_NATIVE)
    }

    pub fn bootable(&self) -> bool {
        self.flags.contains(FsFlags::BOOTABLE)
    }

    pub fn supports_label(&self) -> bool {
        self.flags.contains(FsFlags::SUPPORTS_LABEL) && self.max_label_chars > 0
    }

    pub fn is_pseudo(&self) -> bool {
        self.flags.contains(FsFlags::PSEUDO)
    }

    pub fn is_swap(&self) -> bool {
        self.flavor == FsFlavor::Swap
    }

    /// Type column of the mount table.
    pub fn fstab_type(&self) -> &str {
        match self.flavor {
            FsFlavor::Bind => "none",
            _ => self.kernel_name.as_deref().unwrap_or(&self.name),
        }
    }

    /// Kinds whose contents the installer mounts into the target tree.
    pub fn is_mounted_kind(&self) -> bool {
        !matches!(
            self.flavor,
            FsFlavor::RaidMember
                | FsFlavor::PhysicalVolume
                | FsFlavor::VolumeGroup
                | FsFlavor::PrepBoot
                | FsFlavor::AppleBootstrap
                | FsFlavor::Foreign
        )
    }

    pub fn can_migrate_to(&self, target: &str) -> bool {
        self.migration_targets.iter().any(|t| t == target)
    }
}

fn builtin_kinds() -> Vec<FilesystemType> {
    use FsFlags as F;
    use FsFlavor::*;

    let ext = F::FORMATTABLE | F::CHECKED | F::LINUX_NATIVE | F::BOOTABLE;

    vec![
        FilesystemType::new("ext2", Ext2, Some("ext2"), ext)
            .migrates_to(&["ext3"])
            .labels(16)
            .packages(&["e2fsprogs"]),
        FilesystemType::new("ext3", Ext3, Some("ext3"), ext)
            .migrates_to(&["ext4"])
            .labels(16)
            .packages(&["e2fsprogs"]),
        FilesystemType::new("ext4", Ext4, Some("ext4"), ext)
            .max_size(16 * TB)
            .labels(16)
            .packages(&["e2fsprogs"]),
        FilesystemType::new(
            "reiserfs",
            Reiserfs,
            Some("reiserfs"),
            F::FORMATTABLE | F::CHECKED | F::LINUX_NATIVE,
        )
        .max_size(16 * TB)
        .labels(16)
        .packages(&["reiserfs-utils"]),
        FilesystemType::new(
            "xfs",
            Xfs,
            Some("xfs"),
            F::FORMATTABLE | F::CHECKED | F::LINUX_NATIVE,
        )
        .max_size(16 * TB)
        .labels(12)
        .packages(&["xfsprogs"]),
        FilesystemType::new(
            "jfs",
            Jfs,
            Some("jfs"),
            F::FORMATTABLE | F::CHECKED | F::LINUX_NATIVE,
        )
        .labels(16)
        .packages(&["jfsutils"]),
        FilesystemType::new(
            "gfs2",
            Gfs2,
            Some("gfs2"),
            F::FORMATTABLE | F::CHECKED | F::LINUX_NATIVE,
        )
        .packages(&["gfs2-utils"]),
        FilesystemType::new("vfat", Vfat, Some("vfat"), F::FORMATTABLE | F::BOOTABLE)
            .max_size(TB)
            .labels(11)
            .packages(&["dosfstools"])
            .partition_type(0x0c, GPT_BASIC_DATA),
        FilesystemType::new("efi", Efi, Some("vfat"), F::FORMATTABLE | F::BOOTABLE)
            .max_size(TB)
            .options("umask=0077,shortname=winnt")
            .labels(11)
            .packages(&["dosfstools"])
            .partition_type(0xef, GPT_EFI),
        FilesystemType::new("hfs", Hfs, Some("hfs"), F::FORMATTABLE)
            .max_size(2 * TB)
            .labels(27)
            .packages(&["hfsutils"])
            .partition_type(0xaf, GPT_HFS),
        FilesystemType::new("swap", Swap, None, F::FORMATTABLE | F::LINUX_NATIVE)
            .labels(15)
            .partition_type(0x82, GPT_SWAP),
        FilesystemType::new("software RAID", RaidMember, None, F::FORMATTABLE)
            .packages(&["mdadm"])
            .partition_type(0xfd, GPT_RAID),
        FilesystemType::new("physical volume (LVM)", PhysicalVolume, None, F::FORMATTABLE)
            .packages(&["lvm2"])
            .partition_type(0x8e, GPT_LVM),
        FilesystemType::new("volume group (LVM)", VolumeGroup, None, F::empty())
            .packages(&["lvm2"])
            .partition_type(0x8e, GPT_LVM),
        FilesystemType::new("PPC PReP Boot", PrepBoot, None, F::FORMATTABLE | F::BOOTABLE)
            .max_size(10)
            .partition_type(0x41, GPT_PREP),
        FilesystemType::new("Apple Bootstrap", AppleBootstrap, Some("hfs"), F::FORMATTABLE | F::BOOTABLE)
            .max_size(1)
            .packages(&["hfsutils"])
            .partition_type(0xaf, GPT_HFS),
        FilesystemType::new("iso9660", Iso9660, Some("iso9660"), F::empty()),
        FilesystemType::new("nfs", Nfs, Some("nfs"), F::LINUX_NATIVE),
        FilesystemType::new("bind", Bind, None, F::ALWAYS_MOUNTABLE | F::LINUX_NATIVE)
            .options("bind"),
        FilesystemType::new("foreign", Foreign, None, F::empty()),
        FilesystemType::new("proc", Proc, Some("proc"), F::PSEUDO),
        FilesystemType::new("sysfs", Sysfs, Some("sysfs"), F::PSEUDO),
        FilesystemType::new("devpts", Devpts, Some("devpts"), F::PSEUDO).options("gid=5,mode=620"),
        FilesystemType::new("tmpfs", Tmpfs, Some("tmpfs"), F::PSEUDO),
    ]
}

/// Filesystems supported by the running kernel, read from `/proc/filesystems` on
/// first use and cached for the lifetime of the registry.
#[derive(Debug)]
pub struct KernelFilesystems {
    source: PathBuf,
    cache: OnceLock<BTreeSet<String>>,
}

impl KernelFilesystems {
    pub fn proc() -> Self {
        Self {
            source: PathBuf::from("/proc/filesystems"),
            cache: OnceLock::new(),
        }
    }

    /// A fixed set, bypassing `/proc`.
    pub fn preset<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cache = OnceLock::new();
        let _ = cache.set(names.into_iter().map(Into::into).collect());
        Self {
            source: PathBuf::new(),
            cache,
        }
    }

    pub fn supports(&self, name: &str) -> bool {
        self.cache
            .get_or_init(|| match fs::read_to_string(&self.source) {
                Ok(contents) => parse_proc_filesystems(&contents),
                Err(why) => {
                    tracing::warn!("unable to read {:?}: {}", self.source, why);
                    BTreeSet::new()
                }
            })
            .contains(name)
    }
}

fn parse_proc_filesystems(contents: &str) -> BTreeSet<String> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .map(String::from)
        .collect()
}

/// Name-keyed catalog of filesystem kinds.
#[derive(Debug)]
pub struct FilesystemTypeRegistry {
    kinds: BTreeMap<String, FilesystemType>,
    kernel: KernelFilesystems,
}

impl FilesystemTypeRegistry {
    pub fn empty(kernel: KernelFilesystems) -> Self {
        Self {
            kinds: BTreeMap::new(),
            kernel,
        }
    }

    /// The full catalog, checked against the running kernel.
    pub fn builtin() -> Self {
        Self::with_kernel(KernelFilesystems::proc())
    }

    pub fn with_kernel(kernel: KernelFilesystems) -> Self {
        let mut registry = Self::empty(kernel);
        for kind in builtin_kinds() {
            registry.register(kind);
        }
        registry
    }

    pub fn register(&mut self, kind: FilesystemType) {
        self.kinds.insert(kind.name.clone(), kind);
    }

    pub fn get(&self, name: &str) -> Result<&FilesystemType, NotFoundError> {
        self.kinds
            .get(name)
            .ok_or_else(|| NotFoundError(name.to_owned()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilesystemType> {
        self.kinds.values()
    }

    /// A kind is mountable only if the running kernel currently supports it.
    pub fn is_mountable(&self, kind: &FilesystemType) -> bool {
        if kind.flags.contains(FsFlags::ALWAYS_MOUNTABLE) {
            return true;
        }

        kind.kernel_name
            .as_deref()
            .map_or(false, |name| self.kernel.supports(name))
    }

    /// ext3 if the kernel supports it, otherwise ext2.
    pub fn get_default(&self) -> Result<&FilesystemType, NotFoundError> {
        ["ext3", "ext2"]
            .iter()
            .filter_map(|name| self.kinds.get(*name))
            .find(|kind| self.is_mountable(kind))
            .ok_or_else(|| NotFoundError("ext3 or ext2".to_owned()))
    }

    /// Mountable, Linux-native kinds with the default listed first.
    pub fn usable_linux_kinds(&self) -> Vec<&FilesystemType> {
        let default = self.get_default().ok().map(|kind| kind.name.as_str());

        let mut usable: Vec<&FilesystemType> = self
            .kinds
            .values()
            .filter(|kind| kind.linux_native() && self.is_mountable(kind))
            .collect();

        if let Some(default) = default {
            if let Some(pos) = usable.iter().position(|kind| kind.name == default) {
                let kind = usable.remove(pos);
                usable.insert(0, kind);
            }
        }

        usable
    }

    /// Maps a probed signature (as reported by udev/blkid) onto a registered kind.
    pub fn kind_for_signature(&self, signature: &str) -> Option<&FilesystemType> {
        let name = match signature {
            "linux_raid_member" => "software RAID",
            "LVM2_member" | "LVM1_member" => "physical volume (LVM)",
            "swap" => "swap",
            "msdos" | "fat" => "vfat",
            other => other,
        };

        self.kinds.get(name)
    }
}
