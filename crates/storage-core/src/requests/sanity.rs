// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Validation of requests against each other, the filesystem catalog, and the
//! boot rules of the platform.
//!
//! Findings are returned as values. Errors block the installation, warnings only
//! need to be confirmed.

use super::{Partitions, RequestKind, RequestSpec, PHYSICAL_VOLUME_KIND, RAID_MEMBER_KIND};
use crate::arch::{Platform, PpcMachine};
use crate::errors::ValidationError;
use crate::fs_types::{FilesystemType, FilesystemTypeRegistry, FsFlavor};
use crate::lvm;
use crate::raid::{RaidLevel, MAX_MEMBERS, MAX_MINORS};
use crate::table::PartitionTable;
use std::collections::{BTreeMap, HashSet};

/// Directories which must stay on the root filesystem.
const MUST_BE_ON_ROOT: &[&str] = &[
    "/bin", "/dev", "/sbin", "/etc", "/lib", "/root", "/mnt", "lost+found", "/proc",
];

/// Directories which need the permissions and links of a Linux filesystem.
const MUST_BE_ON_LINUX_FS: &[&str] = &["/", "/var", "/tmp", "/usr", "/home", "/usr/share", "/usr/lib"];

/// Sizes, in MB, below which a well known mountpoint is likely too small.
const RECOMMENDED_MINIMUMS: &[(&str, u64)] = &[
    ("/usr", 250),
    ("/tmp", 50),
    ("/var", 384),
    ("/home", 100),
    ("/boot", 75),
];

const MIN_ROOT_MB: u64 = 250;
const MIN_EFI_MB: u64 = 10;
const MAX_SWAPS: usize = 32;

/// What the checks need to know about the machine.
pub struct SanityEnv<'a> {
    pub registry: &'a FilesystemTypeRegistry,
    pub platform: Platform,
    pub memory_mb: u64,
    /// Label type of each disk, by name.
    pub disk_labels: BTreeMap<String, PartitionTable>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanityReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationError>,
}

impl SanityReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        push_unique(&mut self.errors, ValidationError::new(message));
    }

    fn warning(&mut self, message: impl Into<String>) {
        push_unique(&mut self.warnings, ValidationError::new(message));
    }
}

fn push_unique(list: &mut Vec<ValidationError>, error: ValidationError) {
    if !list.contains(&error) {
        list.push(error);
    }
}

fn invalid_mountpoint(mountpoint: &str) -> Option<String> {
    let valid = mountpoint.starts_with('/')
        && (mountpoint == "/" || !mountpoint.ends_with('/'))
        && !mountpoint.chars().any(|c| c.is_whitespace() || c.is_control());

    if valid {
        None
    } else {
        Some(format!(
            "The mount point {} is invalid. Mount points must start with '/' and cannot end \
             with '/', and must contain printable characters and no spaces.",
            mountpoint
        ))
    }
}

fn in_list(mountpoint: &str, list: &[&str]) -> bool {
    list.iter()
        .any(|entry| *entry == mountpoint || *entry == mountpoint.trim_start_matches('/'))
}

impl RequestSpec {
    /// Checks this request on its own and against the rest of `partitions`,
    /// returning the first problem found.
    pub fn sanity_check_request(
        &self,
        partitions: &Partitions,
        registry: &FilesystemTypeRegistry,
    ) -> Option<ValidationError> {
        self.check(partitions, registry).err().map(ValidationError::new)
    }

    fn check(&self, partitions: &Partitions, registry: &FilesystemTypeRegistry) -> Result<(), String> {
        let kind = registry
            .get(&self.fstype)
            .map_err(|_| format!("{} is not a supported filesystem type.", self.fstype))?;

        if partitions.check_acyclic(self).is_err() {
            return Err(format!(
                "The {} request is built on itself, directly or through the devices it uses.",
                self.describe()
            ));
        }

        if let Some(mountpoint) = self.mountpoint.as_deref() {
            self.check_mountpoint(mountpoint, kind, partitions)?;
        }

        if let Ok(size) = partitions.request_size(self) {
            if size > kind.max_size_mb {
                return Err(format!(
                    "The size of the {} partition ({} MB) exceeds the maximum size of {} MB.",
                    kind.name, size, kind.max_size_mb
                ));
            }
        }

        if self.protected && self.format() {
            return Err(format!(
                "The partition {} is holding the installation media and cannot be formatted.",
                self.describe()
            ));
        }

        if self.migrate() {
            let original = self.origfstype.as_deref().unwrap_or("unknown");
            let migratable = registry
                .get(original)
                .map_or(false, |original| original.can_migrate_to(&kind.name));

            if !migratable {
                return Err(format!(
                    "The {} filesystem on {} cannot be migrated to {}.",
                    original,
                    self.describe(),
                    kind.name
                ));
            }
        }

        match &self.kind {
            RequestKind::Partition(spec) => {
                if let (Some(start), Some(end)) = (spec.start, spec.end) {
                    if start > end {
                        return Err("The end of the partition must come after its start.".into());
                    }
                }

                if !self.preexist && spec.size_mb == 0 && !spec.grow && spec.start.is_none() {
                    return Err("The size of a new partition must be greater than zero.".into());
                }

                Ok(())
            }
            RequestKind::Raid(_) => self.check_raid(partitions, registry),
            RequestKind::VolumeGroup(_) => self.check_volume_group(partitions),
            RequestKind::LogicalVolume(_) => self.check_logical_volume(partitions),
        }
    }

    fn check_mountpoint(
        &self,
        mountpoint: &str,
        kind: &FilesystemType,
        partitions: &Partitions,
    ) -> Result<(), String> {
        if let Some(invalid) = invalid_mountpoint(mountpoint) {
            return Err(invalid);
        }

        let taken = partitions.requests().iter().any(|other| {
            other.unique_id != self.unique_id && other.mountpoint.as_deref() == Some(mountpoint)
        });

        if taken {
            return Err(format!(
                "The mount point \"{}\" is already in use, please choose a different mount point.",
                mountpoint
            ));
        }

        if in_list(mountpoint, MUST_BE_ON_ROOT) {
            return Err(format!(
                "This mount point is invalid. The {} directory must be on the / file system.",
                mountpoint
            ));
        }

        if in_list(mountpoint, MUST_BE_ON_LINUX_FS) && !kind.linux_native() {
            return Err(format!("The mount point {} must be on a linux file system.", mountpoint));
        }

        if !kind.is_mounted_kind() || kind.is_swap() {
            return Err(format!("{} partitions cannot be given a mount point.", kind.name));
        }

        Ok(())
    }

    fn check_raid(&self, partitions: &Partitions, registry: &FilesystemTypeRegistry) -> Result<(), String> {
        let spec = match self.as_raid() {
            Some(spec) => spec,
            None => return Ok(()),
        };

        if spec.members.is_empty() {
            return Err("No members have been selected for this RAID device.".into());
        }

        if spec.members.len() > MAX_MEMBERS {
            return Err(format!(
                "A RAID device can have a maximum of {} members.",
                MAX_MEMBERS
            ));
        }

        let active = spec.members.len().saturating_sub(spec.spares);
        if active < spec.level.min_members() {
            return Err(format!(
                "A RAID device of type {} requires at least {} members.",
                spec.level,
                spec.level.min_members()
            ));
        }

        let max_spares = spec.level.max_spares(spec.members.len());
        if spec.spares > max_spares {
            return Err(format!(
                "This RAID device can have a maximum of {} spares. To have more spares you \
                 will need to add members to the RAID device.",
                max_spares
            ));
        }

        for &member in &spec.members {
            let member = partitions
                .get(member)
                .map_err(|why| format!("A member of this RAID device is missing: {}.", why))?;

            let is_member = registry
                .get(&member.fstype)
                .map_or(false, |kind| kind.flavor == FsFlavor::RaidMember);

            if !is_member {
                return Err(format!(
                    "RAID members must be of type {}, but {} is {}.",
                    RAID_MEMBER_KIND,
                    member.describe(),
                    member.fstype
                ));
            }
        }

        if let Some(minor) = spec.minor {
            if minor >= MAX_MINORS {
                return Err(format!("RAID minors must be below {}.", MAX_MINORS));
            }

            let clash = partitions.raid_requests().any(|other| {
                other.unique_id != self.unique_id
                    && other.as_raid().and_then(|raid| raid.minor) == Some(minor)
            });

            if clash {
                return Err(format!("The RAID device md{} is already in use.", minor));
            }
        }

        Ok(())
    }

    fn check_volume_group(&self, partitions: &Partitions) -> Result<(), String> {
        let spec = match self.as_volume_group() {
            Some(spec) => spec,
            None => return Ok(()),
        };

        if let Some(invalid) = lvm::check_vg_name(&spec.name) {
            return Err(invalid);
        }

        let clash = partitions.volume_group_requests().any(|other| {
            other.unique_id != self.unique_id
                && other.as_volume_group().map_or(false, |vg| vg.name == spec.name)
        });

        if clash {
            return Err(format!("The volume group name \"{}\" is already in use.", spec.name));
        }

        if !lvm::is_valid_pe_size(spec.pe_kb) {
            return Err(format!("The physical extent size of {} KB is invalid.", spec.pe_kb));
        }

        if spec.pvs.is_empty() {
            return Err("A volume group requires at least one physical volume.".into());
        }

        for &pv in &spec.pvs {
            let pv = partitions
                .get(pv)
                .map_err(|why| format!("A physical volume of {} is missing: {}.", spec.name, why))?;

            if pv.fstype != PHYSICAL_VOLUME_KIND {
                return Err(format!(
                    "Physical volumes must be of type {}, but {} is {}.",
                    PHYSICAL_VOLUME_KIND,
                    pv.describe(),
                    pv.fstype
                ));
            }
        }

        Ok(())
    }

    fn check_logical_volume(&self, partitions: &Partitions) -> Result<(), String> {
        let spec = match self.as_logical_volume() {
            Some(spec) => spec,
            None => return Ok(()),
        };

        if let Some(invalid) = lvm::check_lv_name(&spec.name) {
            return Err(invalid);
        }

        let group = partitions
            .get(spec.vg)
            .ok()
            .filter(|group| group.as_volume_group().is_some())
            .ok_or_else(|| format!("The volume group of {} does not exist.", spec.name))?;

        let vg = group.as_volume_group().map(|vg| (vg.name.as_str(), vg.pe_kb));
        let (vg_name, pe_kb) = vg.unwrap_or_default();

        let siblings: Vec<&RequestSpec> = partitions
            .logical_volumes_of(spec.vg)
            .filter(|other| other.unique_id != self.unique_id)
            .collect();

        let clash = siblings
            .iter()
            .any(|other| other.as_logical_volume().map_or(false, |lv| lv.name == spec.name));

        if clash {
            return Err(format!(
                "The logical volume name \"{}\" is already in use in {}.",
                spec.name, vg_name
            ));
        }

        let size = partitions.request_size(self).map_err(|why| why.to_string())?;
        let max = lvm::get_max_lv_size(pe_kb);
        if size > max {
            return Err(format!(
                "The current requested size ({} MB) is larger than the maximum logical volume \
                 size ({} MB). To increase this limit you can create more physical volumes \
                 from unpartitioned disk space and add them to this volume group.",
                size, max
            ));
        }

        let mut used = size;
        for sibling in siblings {
            used += partitions.request_size(sibling).map_err(|why| why.to_string())?;
        }

        let available = partitions.request_size(group).map_err(|why| why.to_string())?;
        if used > available {
            return Err(format!(
                "There is not enough space in the volume group {} ({} MB) for the logical \
                 volumes you have defined ({} MB).",
                vg_name, available, used
            ));
        }

        Ok(())
    }
}

impl Partitions {
    /// Runs every check over the whole layout.
    pub fn sanity_check_all_requests(&self, env: &SanityEnv) -> SanityReport {
        let mut report = SanityReport::default();

        self.check_root(&mut report);
        self.check_boot_loader_partitions(env, &mut report);
        self.check_bootable(env, &mut report);

        for request in self.requests() {
            if let Some(error) = request.sanity_check_request(self, env.registry) {
                report.errors.push(error);
            }
        }

        for &(mountpoint, minimum) in RECOMMENDED_MINIMUMS {
            let size = self.by_mountpoint(mountpoint).and_then(|r| self.request_size(r).ok());
            if let Some(size) = size.filter(|&size| size < minimum) {
                report.warning(format!(
                    "Your {} partition is less than {} megabytes which is lower than \
                     recommended for a normal installation.",
                    mountpoint, minimum
                ));
            }
        }

        self.check_swap(env, &mut report);

        let mut seen = HashSet::new();
        report.errors.retain(|error| seen.insert(error.clone()));

        report
    }

    fn check_root(&self, report: &mut SanityReport) {
        match self.by_mountpoint("/") {
            None => report.error(
                "You have not defined a root partition (/), which is required for \
                 installation to continue.",
            ),
            Some(root) => {
                if self.request_size(root).map_or(false, |size| size < MIN_ROOT_MB) {
                    report.error(format!(
                        "Your root partition is less than {} megabytes which is usually too \
                         small to install an operating system.",
                        MIN_ROOT_MB
                    ));
                }
            }
        }
    }

    /// Partitions the firmware or boot loader itself needs.
    fn check_boot_loader_partitions(&self, env: &SanityEnv, report: &mut SanityReport) {
        let platform = &env.platform;

        if platform.efi {
            let efi = self.by_mountpoint("/boot/efi").filter(|request| {
                env.registry
                    .get(&request.fstype)
                    .map_or(false, |kind| matches!(kind.flavor, FsFlavor::Efi | FsFlavor::Vfat))
            });

            let large_enough = efi
                .and_then(|request| self.request_size(request).ok())
                .map_or(false, |size| size >= MIN_EFI_MB);

            if !large_enough {
                report.error(format!(
                    "You must create an EFI System Partition of type FAT and a size of {} \
                     megabytes.",
                    MIN_EFI_MB
                ));
            }
        }

        match platform.ppc_machine {
            Some(machine @ PpcMachine::PSeries) | Some(machine @ PpcMachine::ISeries) => {
                let minimum = if machine == PpcMachine::ISeries { 8 } else { 4 };
                let prep: Vec<&RequestSpec> = self
                    .requests()
                    .iter()
                    .filter(|request| request.fstype == "PPC PReP Boot")
                    .collect();

                if prep.is_empty() {
                    report.error("You must create a PPC PReP Boot partition.");
                }

                for request in prep {
                    if self.request_size(request).map_or(false, |size| size < minimum) {
                        report.warning(format!(
                            "Your PPC PReP Boot partition is smaller than {} megabytes, which \
                             may be too small to hold the boot loader.",
                            minimum
                        ));
                    }
                }
            }
            Some(PpcMachine::PMac) => {
                let bootstrap = self
                    .requests()
                    .iter()
                    .any(|request| request.fstype == "Apple Bootstrap");

                if !bootstrap {
                    report.error("You must create an Apple Bootstrap partition.");
                }
            }
            None => (),
        }
    }

    fn check_bootable(&self, env: &SanityEnv, report: &mut SanityReport) {
        let platform = &env.platform;

        for id in self.bootable_request(platform) {
            let request = match self.get(id) {
                Ok(request) => request,
                Err(_) => continue,
            };

            let kind = match env.registry.get(&request.fstype) {
                Ok(kind) => kind,
                Err(_) => continue,
            };

            match &request.kind {
                RequestKind::Raid(raid) => {
                    if raid.level != RaidLevel::Raid1 {
                        report.error("Bootable partitions can only be on RAID1 devices.");
                    }

                    if !platform.raid_boot_capable() {
                        report.error("Bootable partitions cannot be on a RAID device.");
                    }
                }
                RequestKind::LogicalVolume(_) => {
                    report.error("Bootable partitions cannot be on a logical volume.");
                }
                RequestKind::Partition(spec) => {
                    let gpt = spec
                        .drive
                        .as_deref()
                        .and_then(|drive| env.disk_labels.get(drive))
                        .map_or(false, |label| *label == PartitionTable::Gpt);

                    if gpt && platform.is_bios_x86() {
                        report.warning(
                            "The boot partition is on a disk with a GPT disk label, which a \
                             BIOS system may be unable to boot from.",
                        );
                    }
                }
                RequestKind::VolumeGroup(_) => (),
            }

            if request.mountpoint.as_deref() == Some("/") && kind.flavor == FsFlavor::Vfat {
                report.error("Bootable partitions cannot be on a vfat filesystem.");
            } else if !kind.bootable() {
                report.error(format!("Bootable partitions cannot be on an {} filesystem.", kind.name));
            }

            if request.is_encrypted() {
                report.error("Bootable partitions cannot be on an encrypted block device.");
            }
        }
    }

    fn check_swap(&self, env: &SanityEnv, report: &mut SanityReport) {
        let swaps: Vec<&RequestSpec> = self
            .requests()
            .iter()
            .filter(|request| {
                env.registry
                    .get(&request.fstype)
                    .map_or(false, FilesystemType::is_swap)
            })
            .collect();

        if swaps.is_empty() {
            report.warning(
                "You have not specified a swap partition. Although not strictly required in \
                 all cases, it will significantly improve performance for most installations.",
            );
            return;
        }

        if swaps.len() > MAX_SWAPS {
            report.warning(format!(
                "You have specified more than {} swap devices. The kernel only supports {} \
                 swap devices.",
                MAX_SWAPS, MAX_SWAPS
            ));
        }

        let swap_mb: u64 = swaps
            .iter()
            .filter_map(|request| self.request_size(request).ok())
            .sum();

        let memory_mb = (env.memory_mb + 15) / 16 * 16;
        if memory_mb < 1024 && swap_mb < memory_mb.saturating_sub(8) {
            report.warning(format!(
                "You have allocated less swap space ({}M) than available RAM ({}M) on your \
                 system. This could negatively impact performance.",
                swap_mb, memory_mb
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::fs_types::KernelFilesystems;
    use crate::requests::{Encryption, PartitionSpec};
    use secstr::SecStr;

    fn registry() -> FilesystemTypeRegistry {
        FilesystemTypeRegistry::with_kernel(KernelFilesystems::preset(vec!["ext2", "ext3", "vfat"]))
    }

    fn env(registry: &FilesystemTypeRegistry, platform: Platform) -> SanityEnv<'_> {
        SanityEnv {
            registry,
            platform,
            memory_mb: 4096,
            disk_labels: BTreeMap::new(),
        }
    }

    fn bios(registry: &FilesystemTypeRegistry) -> SanityEnv<'_> {
        env(registry, Platform::new(Arch::X86_64))
    }

    fn basic() -> Partitions {
        let mut partitions = Partitions::new();
        partitions.add_request(RequestSpec::partition("ext3", 10 * 1024).with_mountpoint("/"));
        partitions.add_request(RequestSpec::partition("swap", 2 * 1024));
        partitions
    }

    fn messages(errors: &[ValidationError]) -> String {
        errors.iter().map(|e| e.message()).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn empty_layouts_have_no_root() {
        let registry = registry();
        let report = Partitions::new().sanity_check_all_requests(&bios(&registry));
        assert!(!report.errors.is_empty());
        assert!(messages(&report.errors).contains("root partition"));
    }

    #[test]
    fn a_plain_layout_is_clean() {
        let registry = registry();
        let report = basic().sanity_check_all_requests(&bios(&registry));
        assert!(report.is_clean(), "{:?}", report);
    }

    #[test]
    fn small_roots_and_mountpoints() {
        let registry = registry();
        let mut partitions = Partitions::new();
        partitions.add_request(RequestSpec::partition("ext3", 200).with_mountpoint("/"));
        partitions.add_request(RequestSpec::partition("ext3", 50).with_mountpoint("/boot"));
        partitions.add_request(RequestSpec::partition("swap", 4096));

        let report = partitions.sanity_check_all_requests(&bios(&registry));
        assert!(messages(&report.errors).contains("less than 250 megabytes"));
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].message().contains("/boot partition is less than 75"));
    }

    #[test]
    fn swap_warnings() {
        let registry = registry();
        let mut partitions = Partitions::new();
        partitions.add_request(RequestSpec::partition("ext3", 10 * 1024).with_mountpoint("/"));

        let report = partitions.sanity_check_all_requests(&bios(&registry));
        assert!(messages(&report.warnings).contains("not specified a swap partition"));

        partitions.add_request(RequestSpec::partition("swap", 256));
        let mut small = bios(&registry);
        small.memory_mb = 1000;
        let report = partitions.sanity_check_all_requests(&small);
        assert!(messages(&report.warnings).contains("less swap space (256M) than available RAM (1008M)"));

        // Plenty of memory makes the size irrelevant.
        let report = partitions.sanity_check_all_requests(&bios(&registry));
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn mountpoint_rules() {
        let registry = registry();
        let partitions = basic();
        let check = |request: RequestSpec| {
            request
                .sanity_check_request(&partitions, &registry)
                .map(|error| error.0)
        };

        assert!(check(RequestSpec::partition("ext3", 100).with_mountpoint("home")).unwrap().contains("invalid"));
        assert!(check(RequestSpec::partition("ext3", 100).with_mountpoint("/home/")).unwrap().contains("invalid"));
        assert!(check(RequestSpec::partition("ext3", 100).with_mountpoint("/my home")).unwrap().contains("invalid"));
        assert!(check(RequestSpec::partition("ext3", 100).with_mountpoint("/etc")).unwrap().contains("must be on the / file system"));
        assert!(check(RequestSpec::partition("vfat", 100).with_mountpoint("/var")).unwrap().contains("linux file system"));
        assert!(check(RequestSpec::partition("ext3", 100).with_mountpoint("/")).unwrap().contains("already in use"));
        assert!(check(RequestSpec::partition("vfat", 100).with_mountpoint("/srv/media")).is_none());
    }

    #[test]
    fn request_rules() {
        let registry = registry();
        let partitions = basic();
        let check = |request: RequestSpec| request.sanity_check_request(&partitions, &registry);

        let mut protected = RequestSpec::partition("ext3", 100).with_mountpoint("/data");
        protected.protected = true;
        assert!(check(protected.clone()).unwrap().0.contains("installation media"));
        protected.set_format(false);
        assert!(check(protected).is_none());

        assert!(check(RequestSpec::partition("PPC PReP Boot", 20)).unwrap().0.contains("maximum size"));

        let mut backwards = RequestSpec::partition("ext3", 100);
        *backwards.as_partition_mut().unwrap() = PartitionSpec {
            start: Some(4096),
            end: Some(2048),
            ..PartitionSpec::default()
        };
        assert!(check(backwards).unwrap().0.contains("must come after its start"));

        let mut migrate = RequestSpec::partition("ext4", 100).preexisting();
        migrate.fstype = "ext4".into();
        migrate.origfstype = Some("ext2".into());
        migrate.set_migrate(true);
        assert!(check(migrate).unwrap().0.contains("cannot be migrated"));
    }

    #[test]
    fn raid_rules() {
        let registry = registry();
        let mut partitions = basic();
        let a = partitions.add_request(RequestSpec::partition(RAID_MEMBER_KIND, 1000));
        let b = partitions.add_request(RequestSpec::partition(RAID_MEMBER_KIND, 1000));
        let c = partitions.add_request(RequestSpec::partition(RAID_MEMBER_KIND, 1000));
        let plain = partitions.add_request(RequestSpec::partition("ext3", 1000));

        let check = |request: RequestSpec| request.sanity_check_request(&partitions, &registry).map(|e| e.0);

        assert!(check(RequestSpec::raid("ext3", RaidLevel::Raid1, vec![], 0)).unwrap().contains("No members"));
        assert_eq!(
            check(RequestSpec::raid("ext3", RaidLevel::Raid5, vec![a, b], 0)).unwrap(),
            "A RAID device of type RAID5 requires at least 3 members."
        );
        assert!(check(RequestSpec::raid("ext3", RaidLevel::Raid1, vec![a, b, c], 2))
            .unwrap()
            .contains("requires at least 2 members"));
        assert!(check(RequestSpec::raid("ext3", RaidLevel::Raid0, vec![a, b, c], 1))
            .unwrap()
            .contains("maximum of 0 spares"));
        assert!(check(RequestSpec::raid("ext3", RaidLevel::Raid1, vec![a, plain], 0))
            .unwrap()
            .contains("must be of type software RAID"));
        assert!(check(RequestSpec::raid("ext3", RaidLevel::Raid1, vec![a, 99], 0))
            .unwrap()
            .contains("missing"));
        assert!(check(RequestSpec::raid("ext3", RaidLevel::Raid5, vec![a, b, c], 0)).is_none());
    }

    #[test]
    fn duplicate_minors() {
        let registry = registry();
        let mut partitions = basic();
        let a = partitions.add_request(RequestSpec::partition(RAID_MEMBER_KIND, 1000));
        let b = partitions.add_request(RequestSpec::partition(RAID_MEMBER_KIND, 1000));
        let c = partitions.add_request(RequestSpec::partition(RAID_MEMBER_KIND, 1000));
        let d = partitions.add_request(RequestSpec::partition(RAID_MEMBER_KIND, 1000));

        let mut first = RequestSpec::raid("ext3", RaidLevel::Raid1, vec![a, b], 0).with_mountpoint("/srv");
        if let RequestKind::Raid(spec) = &mut first.kind {
            spec.minor = Some(0);
        }
        partitions.add_request(first);

        let mut second = RequestSpec::raid("ext3", RaidLevel::Raid1, vec![c, d], 0);
        if let RequestKind::Raid(spec) = &mut second.kind {
            spec.minor = Some(0);
        }
        let error = second.sanity_check_request(&partitions, &registry).unwrap();
        assert!(error.0.contains("md0 is already in use"));
    }

    #[test]
    fn volume_groups_run_out_of_space() {
        let registry = registry();
        let mut partitions = basic();
        let a = partitions.add_request(RequestSpec::partition(PHYSICAL_VOLUME_KIND, 1000));
        let b = partitions.add_request(RequestSpec::partition(PHYSICAL_VOLUME_KIND, 1000));
        let vg = partitions.add_request(RequestSpec::volume_group("VolGroup00", vec![a, b], Some(32768)));

        assert_eq!(partitions.actual_size(vg).unwrap(), 2 * lvm::clamp_pv_size(1000, 32768));

        let first = RequestSpec::logical_volume("ext3", vg, "LogVol00", 500).with_mountpoint("/home");
        assert!(first.sanity_check_request(&partitions, &registry).is_none());
        partitions.add_request(first);

        let second = RequestSpec::logical_volume("ext3", vg, "LogVol01", 500).with_mountpoint("/srv");
        assert!(second.sanity_check_request(&partitions, &registry).is_none());
        partitions.add_request(second);

        let third = RequestSpec::logical_volume("ext3", vg, "LogVol02", 1000).with_mountpoint("/opt");
        let error = third.sanity_check_request(&partitions, &registry).unwrap();
        assert!(error.0.contains("not enough space"), "{}", error);

        let report = partitions.sanity_check_all_requests(&bios(&registry));
        assert!(report.errors.is_empty(), "{:?}", report);
    }

    #[test]
    fn volume_group_rules() {
        let registry = registry();
        let mut partitions = basic();
        let pv = partitions.add_request(RequestSpec::partition(PHYSICAL_VOLUME_KIND, 1000));
        let plain = partitions.add_request(RequestSpec::partition("ext3", 1000));
        let vg = partitions.add_request(RequestSpec::volume_group("VolGroup00", vec![pv], None));

        {
            let check = |request: RequestSpec| request.sanity_check_request(&partitions, &registry).map(|e| e.0);

            assert!(check(RequestSpec::volume_group("lvm", vec![pv], None)).unwrap().contains("reserved"));
            assert!(check(RequestSpec::volume_group("VolGroup00", vec![pv], None)).unwrap().contains("already in use"));
            assert!(check(RequestSpec::volume_group("Other", vec![pv], Some(3000))).unwrap().contains("extent size"));
            assert!(check(RequestSpec::volume_group("Other", vec![plain], None)).unwrap().contains("must be of type"));
            assert!(check(RequestSpec::logical_volume("ext3", plain, "LogVol00", 100)).unwrap().contains("does not exist"));
            assert!(check(RequestSpec::logical_volume("ext3", vg, "snapshot0", 100)).unwrap().contains("reserved"));
        }

        let small = partitions.add_request(RequestSpec::volume_group("Small", vec![pv], Some(8)));
        let huge = RequestSpec::logical_volume("ext3", small, "LogVol00", 600);
        let error = huge.sanity_check_request(&partitions, &registry).unwrap();
        assert!(error.0.contains("maximum logical volume size (512 MB)"));
    }

    #[test]
    fn boot_placement_rules() {
        let registry = registry();

        let mut partitions = Partitions::new();
        let a = partitions.add_request(RequestSpec::partition(RAID_MEMBER_KIND, 1000));
        let b = partitions.add_request(RequestSpec::partition(RAID_MEMBER_KIND, 1000));
        let c = partitions.add_request(RequestSpec::partition(RAID_MEMBER_KIND, 1000));
        partitions.add_request(RequestSpec::raid("ext3", RaidLevel::Raid5, vec![a, b, c], 0).with_mountpoint("/"));
        partitions.add_request(RequestSpec::partition("swap", 2048));

        let report = partitions.sanity_check_all_requests(&bios(&registry));
        assert!(messages(&report.errors).contains("only be on RAID1"));

        let report = partitions.sanity_check_all_requests(&env(&registry, Platform::new(Arch::S390)));
        assert!(messages(&report.errors).contains("cannot be on a RAID device"));

        let mut partitions = basic();
        partitions.add_request(
            RequestSpec::partition("ext3", 200)
                .with_mountpoint("/boot")
                .with_encryption(Encryption::new(SecStr::from("secret"))),
        );
        let report = partitions.sanity_check_all_requests(&bios(&registry));
        assert_eq!(
            messages(&report.errors),
            "Bootable partitions cannot be on an encrypted block device."
        );

        let mut partitions = Partitions::new();
        partitions.add_request(RequestSpec::partition("vfat", 4096).with_mountpoint("/srv"));
        partitions.add_request(RequestSpec::partition("xfs", 4096).with_mountpoint("/"));
        partitions.add_request(RequestSpec::partition("swap", 2048));
        let report = partitions.sanity_check_all_requests(&bios(&registry));
        assert!(messages(&report.errors).contains("cannot be on an xfs filesystem"));
    }

    #[test]
    fn volumes_cannot_boot() {
        let registry = registry();
        let mut partitions = Partitions::new();
        let pv = partitions.add_request(RequestSpec::partition(PHYSICAL_VOLUME_KIND, 20 * 1024));
        let vg = partitions.add_request(RequestSpec::volume_group("VolGroup00", vec![pv], None));
        partitions.add_request(RequestSpec::logical_volume("ext3", vg, "LogVol00", 8192).with_mountpoint("/"));
        partitions.add_request(RequestSpec::logical_volume("swap", vg, "LogVol01", 2048));

        let report = partitions.sanity_check_all_requests(&bios(&registry));
        assert_eq!(messages(&report.errors), "Bootable partitions cannot be on a logical volume.");
    }

    #[test]
    fn platform_partitions() {
        let registry = registry();

        let efi = env(&registry, Platform::new(Arch::X86_64).efi(true));
        let report = basic().sanity_check_all_requests(&efi);
        assert!(messages(&report.errors).contains("EFI System Partition"));

        let mut partitions = basic();
        partitions.add_request(RequestSpec::partition("efi", 200).with_mountpoint("/boot/efi"));
        assert!(partitions.sanity_check_all_requests(&efi).errors.is_empty());

        let pseries = env(&registry, Platform::ppc(PpcMachine::PSeries));
        let report = basic().sanity_check_all_requests(&pseries);
        assert!(messages(&report.errors).contains("PPC PReP Boot partition"));

        let mut partitions = basic();
        partitions.add_request(RequestSpec::partition("PPC PReP Boot", 2));
        let report = partitions.sanity_check_all_requests(&pseries);
        assert!(report.errors.is_empty(), "{:?}", report);
        assert!(messages(&report.warnings).contains("smaller than 4 megabytes"));

        let pmac = env(&registry, Platform::ppc(PpcMachine::PMac));
        let report = basic().sanity_check_all_requests(&pmac);
        assert!(messages(&report.errors).contains("Apple Bootstrap"));
    }

    #[test]
    fn gpt_boot_disks_warn_on_bios() {
        let registry = registry();
        let mut partitions = Partitions::new();
        let mut root = RequestSpec::partition("ext3", 10 * 1024).with_mountpoint("/");
        root.as_partition_mut().unwrap().drive = Some("sda".into());
        partitions.add_request(root);
        partitions.add_request(RequestSpec::partition("swap", 2048));

        let mut bios = bios(&registry);
        bios.disk_labels.insert("sda".into(), PartitionTable::Gpt);
        let report = partitions.sanity_check_all_requests(&bios);
        assert!(report.errors.is_empty());
        assert!(messages(&report.warnings).contains("GPT disk label"));
    }

    #[test]
    fn self_referencing_requests_are_errors() {
        let registry = registry();

        let mut partitions = basic();
        let member = partitions.add_request(RequestSpec::partition(RAID_MEMBER_KIND, 1000));
        let md = partitions.add_request(RequestSpec::raid(RAID_MEMBER_KIND, RaidLevel::Raid1, vec![member, member + 1], 0));
        assert_eq!(md, member + 1);

        let report = partitions.sanity_check_all_requests(&bios(&registry));
        assert!(messages(&report.errors).contains("built on itself"), "{:?}", report);

        // A group whose only physical volume is one of its own volumes.
        let mut partitions = basic();
        let vg = partitions.add_request(RequestSpec::volume_group("VolGroup00", vec![3], None));
        let lv = partitions.add_request(RequestSpec::logical_volume(PHYSICAL_VOLUME_KIND, vg, "LogVol00", 500));
        assert_eq!(lv, 3);

        let report = partitions.sanity_check_all_requests(&bios(&registry));
        assert!(messages(&report.errors).contains("built on itself"), "{:?}", report);
    }
}
