// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Filesystems of the installation, bound to the devices that hold them.
//!
//! Each entry moves from unformatted to formatted (or migrated), then mounted and
//! finally unmounted. Batch operations walk the entries in mountpoint order and
//! abort at the first failure.

mod artifacts;
pub mod format;
mod labels;

pub use self::labels::LabelFactory;

use crate::context::StorageContext;
use crate::devices::{Device, VolumeGroupDevice};
use crate::errors::{OperationError, Result};
use crate::fs_types::{FilesystemType, FilesystemTypeRegistry, FsFlavor};
use crate::interface::{Interface, MessageKind};
use crate::requests::Partitions;
use std::fs;
use std::path::{Path, PathBuf};
use sys_mount::{FilesystemType as MountType, Mount, MountFlags, UnmountFlags};

/// Root under which block devices are materialized before formatting.
const HOST_ROOT: &str = "/";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryState {
    Unformatted,
    Formatted,
    Mounted,
    Unmounted,
}

/// One filesystem and where it goes.
#[derive(Clone, Debug)]
pub struct FileSystemSetEntry {
    pub device: Device,
    pub mountpoint: Option<String>,
    pub kind: FilesystemType,
    /// Overrides the kind's default mount options.
    pub options: Option<String>,
    pub format: bool,
    pub migrate: bool,
    /// Kind found on disk, for existing filesystems.
    pub origfstype: Option<FilesystemType>,
    pub label: Option<String>,
    pub badblocks: bool,
    /// Request this entry was generated from.
    pub request_id: Option<u32>,
    state: EntryState,
}

impl FileSystemSetEntry {
    pub fn new(device: Device, mountpoint: Option<&str>, kind: FilesystemType) -> Self {
        Self {
            device,
            mountpoint: mountpoint.map(String::from),
            kind,
            options: None,
            format: false,
            migrate: false,
            origfstype: None,
            label: None,
            badblocks: false,
            request_id: None,
            state: EntryState::Unformatted,
        }
    }

    pub fn formatted(mut self, format: bool) -> Self {
        self.format = format;
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_owned());
        self
    }

    pub fn with_options(mut self, options: &str) -> Self {
        self.options = Some(options.to_owned());
        self
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn mount_options(&self) -> &str {
        self.options.as_deref().unwrap_or(&self.kind.default_options)
    }

    /// First numeric column of the mount table.
    pub fn fsck_pass(&self) -> u8 {
        if self.kind.checked() {
            1
        } else {
            0
        }
    }

    /// Second numeric column of the mount table: root first, then everything else checked.
    pub fn fsck_order(&self) -> u8 {
        if !self.kind.checked() {
            0
        } else if self.mountpoint.as_deref() == Some("/") {
            1
        } else {
            2
        }
    }

    /// Directory this entry is mounted on beneath `root`.
    pub fn target(&self, root: &Path) -> Option<PathBuf> {
        let mountpoint = self.mountpoint.as_deref()?;
        Some(root.join(mountpoint.trim_start_matches('/')))
    }

    fn is_volume_group(&self) -> bool {
        self.kind.flavor == FsFlavor::VolumeGroup
    }

    /// Swap and every kind with a mountpoint that the installer mounts.
    fn is_mountable(&self) -> bool {
        self.kind.is_mounted_kind()
            && !self.is_volume_group()
            && (self.kind.is_swap() || self.mountpoint.is_some())
    }
}

/// The ordered collection of filesystems.
#[derive(Clone, Debug)]
pub struct FileSystemSet {
    entries: Vec<FileSystemSetEntry>,
    labels: LabelFactory,
}

impl FileSystemSet {
    /// A set holding only the kernel pseudo filesystems.
    pub fn new(registry: &FilesystemTypeRegistry) -> Result<Self> {
        let mut set = Self {
            entries: Vec::new(),
            labels: LabelFactory::new(),
        };

        for (name, mountpoint) in &[
            ("devpts", "/dev/pts"),
            ("tmpfs", "/dev/shm"),
            ("proc", "/proc"),
            ("sysfs", "/sys"),
        ] {
            let kind = registry.get(name)?.clone();
            set.add(FileSystemSetEntry::new(Device::pseudo(name), Some(mountpoint), kind));
        }

        Ok(set)
    }

    /// Builds entries for every request which holds a filesystem, a swap area, or
    /// a volume group that logical volumes depend upon.
    pub fn from_partitions(ctx: &StorageContext, partitions: &Partitions) -> Result<Self> {
        let mut set = Self::new(&ctx.registry)?;

        for request in partitions.requests() {
            let id = request.unique_id.ok_or_else(|| {
                OperationError::Invariant("a stored request has no unique id".into())
            })?;
            let kind = ctx.registry.get(&request.fstype)?;

            if matches!(kind.flavor, FsFlavor::RaidMember | FsFlavor::PhysicalVolume) {
                continue;
            }

            let wanted = request.mountpoint.is_some()
                || kind.is_swap()
                || kind.flavor == FsFlavor::VolumeGroup
                || request.format();

            if !wanted {
                continue;
            }

            let mut entry = FileSystemSetEntry::new(
                partitions.get_device(ctx, id)?,
                request.mountpoint.as_deref(),
                kind.clone(),
            );

            entry.format = request.format();
            entry.migrate = request.migrate();
            entry.badblocks = request.badblocks;
            entry.label = request.fslabel.clone();
            entry.request_id = Some(id);
            entry.origfstype = match request.origfstype.as_deref() {
                Some(name) => Some(ctx.registry.get(name)?.clone()),
                None => None,
            };

            set.add(entry);
        }

        Ok(set)
    }

    /// Adds `entry`, replacing any entry which claims the same mountpoint.
    pub fn add(&mut self, entry: FileSystemSetEntry) {
        if let Some(mountpoint) = entry.mountpoint.as_deref() {
            self.entries
                .retain(|existing| existing.mountpoint.as_deref() != Some(mountpoint));
        }

        self.entries.push(entry);
        self.entries
            .sort_by(|a, b| mount_order(a.mountpoint.as_deref(), b.mountpoint.as_deref()));
    }

    pub fn remove(&mut self, mountpoint: &str) -> Option<FileSystemSetEntry> {
        let pos = self
            .entries
            .iter()
            .position(|entry| entry.mountpoint.as_deref() == Some(mountpoint))?;

        Some(self.entries.remove(pos))
    }

    pub fn get(&self, mountpoint: &str) -> Option<&FileSystemSetEntry> {
        self.entries
            .iter()
            .find(|entry| entry.mountpoint.as_deref() == Some(mountpoint))
    }

    pub fn get_mut(&mut self, mountpoint: &str) -> Option<&mut FileSystemSetEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.mountpoint.as_deref() == Some(mountpoint))
    }

    pub fn entries(&self) -> &[FileSystemSetEntry] {
        &self.entries
    }

    pub fn label_factory(&mut self) -> &mut LabelFactory {
        &mut self.labels
    }

    /// Brings every device into existence, volume groups ahead of their volumes.
    pub fn materialize_devices(&mut self, ctx: &StorageContext) -> Result<()> {
        let root = Path::new(HOST_ROOT);

        for entry in self.entries.iter_mut().filter(|e| e.is_volume_group()) {
            entry.device.materialize(ctx, root)?;
        }

        for entry in self.entries.iter_mut().filter(|e| !e.is_volume_group()) {
            if !entry.kind.is_pseudo() {
                entry.device.materialize(ctx, root)?;
            }
        }

        Ok(())
    }

    /// Chooses labels for filesystems about to be created.
    ///
    /// `existing` lists labels already present on disk, which are never reused.
    pub fn assign_labels<I, S>(&mut self, existing: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.labels.reserve_all(existing);

        for entry in &self.entries {
            if let Some(label) = entry.label.as_deref().filter(|_| !entry.format) {
                self.labels.reserve(label);
            }
        }

        for entry in &mut self.entries {
            if !entry.format || !entry.kind.supports_label() {
                continue;
            }

            let base = match entry.label.take() {
                Some(label) => label,
                None if entry.kind.is_swap() => format!("SWAP-{}", entry.device.display_name()),
                None => match entry.mountpoint.as_deref() {
                    Some(mountpoint) => mountpoint.to_owned(),
                    None => continue,
                },
            };

            entry.label = Some(self.labels.create_label(&base, entry.kind.max_label_chars));
        }
    }

    /// Formats every entry marked for formatting. The first failure is reported
    /// through `intf` and ends the batch.
    pub fn make_filesystems(&mut self, ctx: &StorageContext, intf: &dyn Interface) -> Result<()> {
        let total = self.entries.iter().filter(|e| e.format).count() as u64;
        let mut progress = intf.progress_window(
            "Formatting",
            "Formatting file systems...",
            total,
        );

        let mut completed = 0;
        for entry in self.entries.iter_mut().filter(|e| e.format) {
            let device = entry.device.materialize(ctx, Path::new(HOST_ROOT))?;
            let name = entry.device.display_name();

            let result = format::format_commands(&entry.kind, &device, entry.label.as_deref())
                .and_then(|commands| {
                    for command in &commands {
                        crate::command::run_checked(ctx.runner(), command)?;
                    }
                    Ok(())
                });

            if let Err(why) = result {
                tracing::error!("formatting {} as {} failed: {}", name, entry.kind.name, why);
                intf.message_window(
                    "Formatting Failed",
                    &format!(
                        "An error occurred trying to format {}. This problem is serious, \
                         and the install cannot continue.",
                        name
                    ),
                    MessageKind::Error,
                );
                return Err(why);
            }

            if let Some(label) = entry.label.as_deref().filter(|_| !entry.kind.is_swap()) {
                if let Some(command) = format::label_command(&entry.kind, &device, label) {
                    if let Err(why) = crate::command::run_checked(ctx.runner(), &command) {
                        tracing::warn!("unable to label {}: {}", name, why);
                    }
                }
            }

            entry.state = EntryState::Formatted;
            completed += 1;
            progress.set(completed);
        }

        Ok(())
    }

    /// Upgrades filesystems in place. A journal which fails to appear after an
    /// ext2 to ext3 migration lets the user continue with the original kind.
    pub fn migrate_filesystems(&mut self, ctx: &StorageContext, intf: &dyn Interface) -> Result<()> {
        for entry in self.entries.iter_mut().filter(|e| e.migrate) {
            let from = match entry.origfstype.clone() {
                Some(from) if from.can_migrate_to(&entry.kind.name) => from,
                _ => {
                    return Err(OperationError::Invariant(format!(
                        "{} is marked for migration to {} without a compatible origin",
                        entry.device.display_name(),
                        entry.kind.name
                    )))
                }
            };

            let device = entry.device.materialize(ctx, Path::new(HOST_ROOT))?;
            let name = entry.device.display_name();
            let command = format::migrate_command(&from, &entry.kind, &device)?;

            if let Err(why) = crate::command::run_checked(ctx.runner(), &command) {
                intf.message_window(
                    "Migration Failed",
                    &format!("An error occurred migrating {} to {}.", name, entry.kind.name),
                    MessageKind::Error,
                );
                return Err(why);
            }

            if entry.kind.flavor == FsFlavor::Ext3 {
                let probe = ctx.runner().run(&format::journal_probe(&device))?;
                if !format::has_journal(&probe.stdout) {
                    let proceed = intf.message_window(
                        "Migration Failed",
                        &format!(
                            "Error migrating {} to ext3. It is possible to continue without \
                             migrating this file system if desired.\n\n\
                             Would you like to continue without migrating {}?",
                            name, name
                        ),
                        MessageKind::YesNo,
                    );

                    if !proceed {
                        return Err(OperationError::Cancelled);
                    }

                    tracing::warn!("{} stays {}", name, from.name);
                    entry.kind = from;
                    entry.migrate = false;
                    continue;
                }
            }

            entry.state = EntryState::Formatted;
        }

        Ok(())
    }

    /// Scans the devices of entries which asked for it. Any bad block stops the install.
    pub fn check_badblocks(&mut self, ctx: &StorageContext, intf: &dyn Interface) -> Result<()> {
        for entry in self.entries.iter_mut().filter(|e| e.badblocks) {
            let device = entry.device.materialize(ctx, Path::new(HOST_ROOT))?;
            let name = entry.device.display_name();

            let _wait = intf.wait_window(
                "Checking for Bad Blocks",
                &format!("Checking for bad blocks on {}...", name),
            );

            let output = crate::command::run_checked(ctx.runner(), &format::badblocks_command(&device))?;
            let combined = [output.stdout.as_str(), output.stderr.as_str()].join("\n");
            let count = format::bad_block_count(&combined).unwrap_or(0);

            if count > 0 {
                intf.message_window(
                    "Bad Blocks Found",
                    &format!(
                        "Bad blocks have been detected on {}. Using this device is not \
                         recommended, and the install cannot continue.",
                        name
                    ),
                    MessageKind::Error,
                );
                return Err(OperationError::BadBlocks { device: name, count });
            }
        }

        Ok(())
    }

    /// Mounts every entry beneath `root` in mountpoint order, and enables swap.
    pub fn mount_filesystems(&mut self, ctx: &StorageContext, intf: &dyn Interface, root: &Path) -> Result<()> {
        for entry in self.entries.iter_mut() {
            if !entry.is_mountable() || entry.state == EntryState::Mounted {
                continue;
            }

            if entry.kind.is_swap() {
                let source_root = source_root(&entry.device, root);
                let device = entry.device.materialize(ctx, source_root)?;
                crate::command::run_checked(ctx.runner(), &swapon(&device))?;
                entry.state = EntryState::Mounted;
                continue;
            }

            let target = match entry.target(root) {
                Some(target) => target,
                None => continue,
            };

            let source = entry.device.materialize(ctx, Path::new(HOST_ROOT))?;

            if let Err(why) = mount_entry(entry, &source, &target) {
                intf.message_window(
                    "Mount Failed",
                    &format!(
                        "An error occurred mounting {} on {}. The install cannot continue.",
                        entry.device.display_name(),
                        target.display()
                    ),
                    MessageKind::Error,
                );
                return Err(why);
            }

            entry.state = EntryState::Mounted;
        }

        Ok(())
    }

    /// Unmounts in reverse order and disables swap. Once nothing is mounted,
    /// the devices are deactivated top down: encrypted mappings and logical
    /// volumes first, then volume groups, then the arrays beneath them.
    pub fn umount_filesystems(&mut self, ctx: &StorageContext, root: &Path) -> Result<()> {
        for entry in self.entries.iter_mut().rev() {
            if entry.state != EntryState::Mounted {
                continue;
            }

            if entry.kind.is_swap() {
                let device = match &entry.device {
                    Device::SwapFile(file) => file.host_path(root),
                    device => device.path(),
                };
                crate::command::run_checked(ctx.runner(), &swapoff(&device))?;
            } else if let Some(target) = entry.target(root) {
                sys_mount::unmount(&target, UnmountFlags::empty())
                    .map_err(|why| OperationError::Unmount { target, why })?;
            }

            entry.state = EntryState::Unmounted;
        }

        let mut groups: Vec<VolumeGroupDevice> = Vec::new();
        let mut remember = |vg: &VolumeGroupDevice| {
            if !groups.iter().any(|known| known.name == vg.name) {
                groups.push(vg.clone());
            }
        };

        for entry in self.entries.iter_mut().rev() {
            match entry.device.unwrapped() {
                Device::VolumeGroup(vg) => {
                    remember(vg);
                    continue;
                }
                Device::LogicalVolume(lv) => remember(lv.vg.as_ref()),
                _ => (),
            }

            entry.device.teardown(ctx)?;
        }

        for vg in groups {
            Device::VolumeGroup(vg).teardown(ctx)?;
        }

        Ok(())
    }
}

fn mount_entry(entry: &FileSystemSetEntry, source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target).map_err(|why| OperationError::io(target, why))?;

    let mount_error = |why| OperationError::Mount {
        device: entry.device.display_name(),
        target: target.to_path_buf(),
        why,
    };

    tracing::info!("mounting {:?} on {:?}", source, target);

    if entry.kind.flavor == FsFlavor::Bind {
        Mount::builder()
            .flags(MountFlags::BIND)
            .mount(source, target)
            .map_err(mount_error)?;
        return Ok(());
    }

    let fstype = entry.kind.fstab_type();
    let options = entry.mount_options();

    let builder = Mount::builder().fstype(MountType::Manual(fstype));
    let builder = if options == "defaults" {
        builder
    } else {
        builder.data(options)
    };

    builder.mount(source, target).map_err(mount_error)?;
    Ok(())
}

/// Swap files live inside the installed system; every other device is reached
/// from the host.
fn source_root<'a>(device: &Device, root: &'a Path) -> &'a Path {
    match device {
        Device::SwapFile(_) => root,
        _ => Path::new(HOST_ROOT),
    }
}

fn swapon(device: &Path) -> crate::command::ToolCommand {
    crate::command::ToolCommand::new("swapon").path_arg(device)
}

fn swapoff(device: &Path) -> crate::command::ToolCommand {
    crate::command::ToolCommand::new("swapoff").path_arg(device)
}

/// Entries without a mountpoint come first, then mountpoints sort lexically so
/// that parents are mounted before their children.
pub fn mount_order(a: Option<&str>, b: Option<&str>) -> std::cmp::Ordering {
    a.cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::context::testing::context;
    use crate::interface::Headless;
    use std::sync::Arc;

    fn ext3(ctx: &StorageContext) -> FilesystemType {
        ctx.registry.get("ext3").unwrap().clone()
    }

    #[test]
    fn pseudo_filesystems_are_seeded() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner);
        let set = FileSystemSet::new(&ctx.registry).unwrap();

        let mountpoints: Vec<_> = set
            .entries()
            .iter()
            .map(|e| e.mountpoint.as_deref().unwrap())
            .collect();
        assert_eq!(mountpoints, vec!["/dev/pts", "/dev/shm", "/proc", "/sys"]);
    }

    #[test]
    fn entries_sort_by_mountpoint_and_replace() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner);
        let mut set = FileSystemSet::new(&ctx.registry).unwrap();

        let swap = ctx.registry.get("swap").unwrap().clone();
        set.add(FileSystemSetEntry::new(Device::partition("sda3"), Some("/home"), ext3(&ctx)));
        set.add(FileSystemSetEntry::new(Device::partition("sda1"), Some("/"), ext3(&ctx)));
        set.add(FileSystemSetEntry::new(Device::partition("sda2"), None, swap));
        set.add(FileSystemSetEntry::new(Device::partition("sdb1"), Some("/home"), ext3(&ctx)));

        let order: Vec<_> = set.entries().iter().map(|e| e.device.display_name()).collect();
        assert_eq!(order, vec!["sda2", "sda1", "devpts", "tmpfs", "sdb1", "proc", "sysfs"]);
        assert_eq!(set.get("/home").unwrap().device.display_name(), "sdb1");

        assert!(set.remove("/home").is_some());
        assert!(set.get("/home").is_none());
    }

    #[test]
    fn fsck_columns() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner);
        let root = FileSystemSetEntry::new(Device::partition("sda1"), Some("/"), ext3(&ctx));
        let home = FileSystemSetEntry::new(Device::partition("sda2"), Some("/home"), ext3(&ctx));
        let swap = FileSystemSetEntry::new(
            Device::partition("sda3"),
            None,
            ctx.registry.get("swap").unwrap().clone(),
        );

        assert_eq!((root.fsck_pass(), root.fsck_order()), (1, 1));
        assert_eq!((home.fsck_pass(), home.fsck_order()), (1, 2));
        assert_eq!((swap.fsck_pass(), swap.fsck_order()), (0, 0));
    }

    #[test]
    fn labels_avoid_surviving_filesystems() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner);
        let mut set = FileSystemSet::new(&ctx.registry).unwrap();

        set.add(FileSystemSetEntry::new(Device::partition("sda1"), Some("/"), ext3(&ctx)).formatted(true));
        set.add(
            FileSystemSetEntry::new(Device::partition("sda2"), None, ctx.registry.get("swap").unwrap().clone())
                .formatted(true),
        );
        set.add(FileSystemSetEntry::new(Device::partition("sdb1"), Some("/home"), ext3(&ctx)).with_label("/home"));

        set.assign_labels(vec!["/"]);

        assert_eq!(set.get("/").unwrap().label.as_deref(), Some("/1"));
        assert_eq!(set.get("/home").unwrap().label.as_deref(), Some("/home"));
        let swap = set.entries().iter().find(|e| e.kind.is_swap()).unwrap();
        assert_eq!(swap.label.as_deref(), Some("SWAP-sda2"));
    }

    #[test]
    fn formatting_runs_in_order_and_labels() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner.clone());
        let mut set = FileSystemSet::new(&ctx.registry).unwrap();

        set.add(
            FileSystemSetEntry::new(Device::partition("sda2"), Some("/home"), ext3(&ctx))
                .formatted(true)
                .with_label("/home"),
        );
        set.add(FileSystemSetEntry::new(Device::partition("sda1"), Some("/"), ext3(&ctx)).formatted(true));
        set.add(FileSystemSetEntry::new(Device::partition("sda3"), Some("/srv"), ext3(&ctx)));

        set.make_filesystems(&ctx, &Headless::default()).unwrap();

        assert_eq!(
            runner.lines(),
            vec![
                "mke2fs -t ext3 /dev/sda1",
                "tune2fs -c0 -i0 -O dir_index /dev/sda1",
                "mke2fs -t ext3 /dev/sda2",
                "tune2fs -c0 -i0 -O dir_index /dev/sda2",
                "e2label /dev/sda2 /home",
            ]
        );
        assert_eq!(set.get("/").unwrap().state(), EntryState::Formatted);
        assert_eq!(set.get("/srv").unwrap().state(), EntryState::Unformatted);
    }

    #[test]
    fn first_format_failure_aborts_the_batch() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("mke2fs -t ext3 /dev/sda1", 1, "");
        let ctx = context(runner.clone());
        let mut set = FileSystemSet::new(&ctx.registry).unwrap();

        set.add(FileSystemSetEntry::new(Device::partition("sda1"), Some("/"), ext3(&ctx)).formatted(true));
        set.add(FileSystemSetEntry::new(Device::partition("sda2"), Some("/home"), ext3(&ctx)).formatted(true));

        match set.make_filesystems(&ctx, &Headless::default()) {
            Err(OperationError::Command { program, .. }) => assert_eq!(program, "mke2fs"),
            other => panic!("expected a command failure, got {:?}", other),
        }

        assert_eq!(runner.lines(), vec!["mke2fs -t ext3 /dev/sda1"]);
    }

    fn migrating_set(ctx: &StorageContext) -> FileSystemSet {
        let mut set = FileSystemSet::new(&ctx.registry).unwrap();
        let mut entry = FileSystemSetEntry::new(Device::partition("sda1"), Some("/"), ext3(ctx));
        entry.migrate = true;
        entry.origfstype = Some(ctx.registry.get("ext2").unwrap().clone());
        set.add(entry);
        set
    }

    #[test]
    fn missing_journal_can_be_skipped() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("dumpe2fs", 0, "Filesystem features:      ext_attr\n");
        let ctx = context(runner.clone());
        let mut set = migrating_set(&ctx);

        set.migrate_filesystems(&ctx, &Headless { answer: true }).unwrap();

        let root = set.get("/").unwrap();
        assert_eq!(root.kind.name, "ext2");
        assert!(!root.migrate);
        assert_eq!(runner.lines(), vec!["tune2fs -j /dev/sda1", "dumpe2fs -h /dev/sda1"]);
    }

    #[test]
    fn missing_journal_can_cancel() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("dumpe2fs", 0, "Filesystem features:      ext_attr\n");
        let ctx = context(runner);
        let mut set = migrating_set(&ctx);

        match set.migrate_filesystems(&ctx, &Headless { answer: false }) {
            Err(OperationError::Cancelled) => (),
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    #[test]
    fn journalled_migration_succeeds() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("dumpe2fs", 0, "Filesystem features:      has_journal ext_attr\n");
        let ctx = context(runner);
        let mut set = migrating_set(&ctx);

        set.migrate_filesystems(&ctx, &Headless::default()).unwrap();
        let root = set.get("/").unwrap();
        assert_eq!(root.kind.name, "ext3");
        assert_eq!(root.state(), EntryState::Formatted);
    }

    #[test]
    fn bad_blocks_stop_the_install() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("badblocks", 0, "Pass completed, 2 bad blocks found. (2/0/0 errors)\n");
        let ctx = context(runner.clone());
        let mut set = FileSystemSet::new(&ctx.registry).unwrap();

        let mut clean = FileSystemSetEntry::new(Device::partition("sda1"), Some("/"), ext3(&ctx));
        clean.badblocks = true;
        let mut unchecked = FileSystemSetEntry::new(Device::partition("sda2"), Some("/var"), ext3(&ctx));
        unchecked.badblocks = false;
        set.add(clean);
        set.add(unchecked);

        match set.check_badblocks(&ctx, &Headless::default()) {
            Err(OperationError::BadBlocks { device, count }) => {
                assert_eq!(device, "sda1");
                assert_eq!(count, 2);
            }
            other => panic!("expected bad blocks, got {:?}", other),
        }

        assert_eq!(runner.lines(), vec!["badblocks -vv /dev/sda1"]);
    }

    #[test]
    fn volume_groups_materialize_first() {
        use crate::devices::{LogicalVolumeDevice, VolumeGroupDevice};

        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner.clone());
        let mut set = FileSystemSet::new(&ctx.registry).unwrap();

        let vg = VolumeGroupDevice::new("VolGroup00", vec![Device::partition("sda2")], 32768, false);
        let lv = LogicalVolumeDevice::new(Arc::new(vg.clone()), "LogVol00", 1024, false);

        set.add(FileSystemSetEntry::new(Device::LogicalVolume(lv), Some("/"), ext3(&ctx)));
        set.add(FileSystemSetEntry::new(
            Device::VolumeGroup(vg),
            None,
            ctx.registry.get("volume group (LVM)").unwrap().clone(),
        ));

        set.materialize_devices(&ctx).unwrap();

        let lines = runner.lines();
        assert_eq!(lines.last().unwrap(), "lvm lvcreate -v -L 1024M -n LogVol00 -An VolGroup00");
        assert!(lines.iter().any(|line| line.starts_with("lvm vgcreate")));
    }

    #[test]
    fn swap_is_enabled_from_the_host() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner.clone());
        let root = crate::context::testing::scratch_dir("swap-root");
        let swap = ctx.registry.get("swap").unwrap().clone();

        let mut set = FileSystemSet::new(&ctx.registry).unwrap();
        set.entries.retain(|entry| !entry.kind.is_pseudo());
        set.add(FileSystemSetEntry::new(Device::partition("vdz9"), None, swap.clone()));
        set.add(FileSystemSetEntry::new(
            Device::SwapFile(crate::devices::SwapFileDevice::new(Path::new("/swapfile"), 1)),
            None,
            swap,
        ));

        set.mount_filesystems(&ctx, &Headless::default(), &root).unwrap();

        let swapfile = root.join("swapfile");
        let lines = runner.lines();
        assert!(lines.contains(&"swapon /dev/vdz9".to_owned()), "{:?}", lines);
        assert!(lines.contains(&format!("swapon {}", swapfile.display())), "{:?}", lines);
        assert!(swapfile.exists());
        assert!(!root.join("dev").exists());

        set.umount_filesystems(&ctx, &root).unwrap();
        let lines = runner.lines();
        assert!(lines.contains(&"swapoff /dev/vdz9".to_owned()), "{:?}", lines);
        assert!(lines.contains(&format!("swapoff {}", swapfile.display())), "{:?}", lines);
        assert!(set.entries().iter().all(|entry| entry.state() == EntryState::Unmounted));
    }

    #[test]
    fn unmounting_deactivates_stacks_top_down() {
        use crate::devices::{LogicalVolumeDevice, RaidDevice, VolumeGroupDevice};
        use crate::raid::RaidLevel;

        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner.clone());
        let root = crate::context::testing::scratch_dir("stack-root");

        let members = vec![Device::partition("vdz1"), Device::partition("vdz2")];
        let md0 = Device::Raid(RaidDevice::new(0, RaidLevel::Raid1, members, 0, None, false));
        let vg = VolumeGroupDevice::new("VolGroup00", vec![md0], 32768, false);
        let lv = LogicalVolumeDevice::new(Arc::new(vg.clone()), "LogVol00", 480, false);

        let mut set = FileSystemSet::new(&ctx.registry).unwrap();
        set.entries.retain(|entry| !entry.kind.is_pseudo());
        set.add(FileSystemSetEntry::new(
            Device::VolumeGroup(vg),
            None,
            ctx.registry.get("volume group (LVM)").unwrap().clone(),
        ));
        set.add(FileSystemSetEntry::new(
            Device::LogicalVolume(lv),
            None,
            ctx.registry.get("swap").unwrap().clone(),
        ));

        set.materialize_devices(&ctx).unwrap();
        set.mount_filesystems(&ctx, &Headless::default(), &root).unwrap();
        let mounted = runner.calls().len();

        set.umount_filesystems(&ctx, &root).unwrap();
        assert_eq!(
            runner.lines()[mounted..].to_vec(),
            vec![
                "swapoff /dev/VolGroup00/LogVol00",
                "lvm lvchange -an VolGroup00/LogVol00",
                "lvm vgchange -an VolGroup00",
                "mdadm --stop /dev/md0",
            ]
        );
        assert!(!ctx.minors.in_use(0));

        // Nothing is left to deactivate.
        set.umount_filesystems(&ctx, &root).unwrap();
        assert_eq!(runner.calls().len(), mounted + 4);
    }
}
