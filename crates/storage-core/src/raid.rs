// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Software RAID levels, minor allocation, and `mdadm` tooling.

use crate::command::{run_checked, ToolCommand};
use crate::context::StorageContext;
use crate::errors::{OperationError, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Number of `/dev/mdN` minors the installer will hand out.
pub const MAX_MINORS: u32 = 32;

/// Upper bound on active members of a single array.
pub const MAX_MEMBERS: usize = 27;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RaidLevel {
    Raid0,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
}

impl RaidLevel {
    pub const ALL: [RaidLevel; 5] = [
        RaidLevel::Raid0,
        RaidLevel::Raid1,
        RaidLevel::Raid5,
        RaidLevel::Raid6,
        RaidLevel::Raid10,
    ];

    pub fn parse(level: &str) -> Option<RaidLevel> {
        let level = level.trim().to_ascii_lowercase();
        let level = level.strip_prefix("raid").unwrap_or(&level);
        match level {
            "0" | "stripe" => Some(RaidLevel::Raid0),
            "1" | "mirror" => Some(RaidLevel::Raid1),
            "5" => Some(RaidLevel::Raid5),
            "6" => Some(RaidLevel::Raid6),
            "10" => Some(RaidLevel::Raid10),
            _ => None,
        }
    }

    /// Name understood by `mdadm --level`.
    pub fn mdadm_name(self) -> &'static str {
        match self {
            RaidLevel::Raid0 => "raid0",
            RaidLevel::Raid1 => "raid1",
            RaidLevel::Raid5 => "raid5",
            RaidLevel::Raid6 => "raid6",
            RaidLevel::Raid10 => "raid10",
        }
    }

    /// Members needed to create an array of this level.
    pub fn min_members(self) -> usize {
        match self {
            RaidLevel::Raid0 | RaidLevel::Raid1 => 2,
            RaidLevel::Raid5 => 3,
            RaidLevel::Raid6 | RaidLevel::Raid10 => 4,
        }
    }

    /// Spares that may accompany `members` active devices.
    pub fn max_spares(self, members: usize) -> usize {
        match self {
            RaidLevel::Raid0 => 0,
            _ => members.saturating_sub(self.min_members()),
        }
    }

    /// Members which must be present to run an existing array of `total` devices.
    pub fn required_active(self, total: usize) -> usize {
        match self {
            RaidLevel::Raid0 => total,
            RaidLevel::Raid1 => total.min(1),
            RaidLevel::Raid5 => total.saturating_sub(1),
            RaidLevel::Raid6 => total.saturating_sub(2),
            RaidLevel::Raid10 => total / 2,
        }
    }

    /// Capacity of an array built from members of the given sizes.
    pub fn usable_size(self, members: &[u64]) -> u64 {
        let smallest = members.iter().copied().min().unwrap_or(0);
        let count = members.len() as u64;

        match self {
            RaidLevel::Raid0 => members.iter().sum(),
            RaidLevel::Raid1 => smallest,
            RaidLevel::Raid5 => count.saturating_sub(1) * smallest,
            RaidLevel::Raid6 => count.saturating_sub(2) * smallest,
            RaidLevel::Raid10 => count / 2 * smallest,
        }
    }
}

impl fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RaidLevel::Raid0 => "RAID0",
            RaidLevel::Raid1 => "RAID1",
            RaidLevel::Raid5 => "RAID5",
            RaidLevel::Raid6 => "RAID6",
            RaidLevel::Raid10 => "RAID10",
        })
    }
}

/// Process-wide record of the md minors in use.
#[derive(Debug, Default)]
pub struct MinorTable {
    used: Mutex<BTreeSet<u32>>,
}

impl MinorTable {
    fn used(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.used.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes the lowest free minor.
    pub fn allocate(&self) -> Result<u32> {
        let mut used = self.used();
        let minor = (0..MAX_MINORS)
            .find(|minor| !used.contains(minor))
            .ok_or(OperationError::MinorUnavailable(MAX_MINORS))?;
        used.insert(minor);
        Ok(minor)
    }

    /// Claims a specific minor, failing if another array already holds it.
    pub fn reserve(&self, minor: u32) -> Result<()> {
        if minor >= MAX_MINORS || !self.used().insert(minor) {
            return Err(OperationError::MinorUnavailable(minor));
        }

        Ok(())
    }

    pub fn release(&self, minor: u32) {
        self.used().remove(&minor);
    }

    pub fn in_use(&self, minor: u32) -> bool {
        self.used().contains(&minor)
    }

    pub fn available(&self) -> Vec<u32> {
        let used = self.used();
        (0..MAX_MINORS).filter(|minor| !used.contains(minor)).collect()
    }
}

pub fn md_path(minor: u32) -> PathBuf {
    PathBuf::from(format!("/dev/md{}", minor))
}

/// Parses the minor out of `/dev/mdN` or `mdN`.
pub fn md_minor(device: &Path) -> Option<u32> {
    device
        .file_name()?
        .to_str()?
        .strip_prefix("md")?
        .parse()
        .ok()
}

pub struct CreateArgs<'a> {
    pub device: &'a Path,
    pub level: RaidLevel,
    pub chunk_kb: Option<u64>,
    pub members: &'a [PathBuf],
    pub spares: usize,
}

pub fn create(ctx: &StorageContext, args: CreateArgs) -> Result<()> {
    tracing::info!(
        "creating {} array {:?} from {:?}",
        args.level,
        args.device,
        args.members
    );

    let active = args.members.len() - args.spares.min(args.members.len());
    let mut command = ToolCommand::new("mdadm")
        .arg("--create")
        .path_arg(args.device)
        .arg("--run")
        .arg(format!("--level={}", args.level.mdadm_name()))
        .arg(format!("--raid-devices={}", active));

    if args.spares > 0 {
        command = command.arg(format!("--spare-devices={}", args.spares));
    }

    if let Some(chunk) = args.chunk_kb.filter(|_| args.level != RaidLevel::Raid1) {
        command = command.arg(format!("--chunk={}", chunk));
    }

    for member in args.members {
        command = command.path_arg(member);
    }

    run_checked(ctx.runner(), &command).map(|_| ())
}

pub fn assemble(ctx: &StorageContext, device: &Path, members: &[PathBuf]) -> Result<()> {
    tracing::info!("assembling array {:?} from {:?}", device, members);
    let mut command = ToolCommand::new("mdadm")
        .arg("--assemble")
        .path_arg(device)
        .arg("--run");

    for member in members {
        command = command.path_arg(member);
    }

    run_checked(ctx.runner(), &command).map(|_| ())
}

pub fn stop(ctx: &StorageContext, device: &Path) -> Result<()> {
    tracing::info!("stopping array {:?}", device);
    let command = ToolCommand::new("mdadm").arg("--stop").path_arg(device);
    run_checked(ctx.runner(), &command).map(|_| ())
}

/// Wipes a stale md superblock. Devices without one are left alone.
pub fn zero_superblock(ctx: &StorageContext, device: &Path) -> Result<()> {
    let command = ToolCommand::new("mdadm")
        .arg("--zero-superblock")
        .path_arg(device);

    let output = ctx.runner().run(&command)?;
    if !output.success() {
        tracing::debug!("no md superblock removed from {:?}", device);
    }

    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayInfo {
    pub device: PathBuf,
    pub level: Option<RaidLevel>,
    pub num_devices: Option<usize>,
    pub uuid: Option<String>,
    pub devices: Vec<PathBuf>,
}

impl ArrayInfo {
    pub fn minor(&self) -> Option<u32> {
        md_minor(&self.device)
    }
}

/// Parses `ARRAY` lines and their `devices=` continuations.
pub fn parse_scan(output: &str) -> Vec<ArrayInfo> {
    let mut arrays: Vec<ArrayInfo> = Vec::new();

    for line in output.lines() {
        let mut words = line.split_whitespace().peekable();

        if words.peek() == Some(&"ARRAY") {
            words.next();
            let device = match words.next() {
                Some(device) => device,
                None => continue,
            };

            arrays.push(ArrayInfo {
                device: PathBuf::from(device),
                ..ArrayInfo::default()
            });
        }

        let current = match arrays.last_mut() {
            Some(current) => current,
            None => continue,
        };

        for word in words {
            let (key, value) = match word.split_once('=') {
                Some(pair) => pair,
                None => continue,
            };

            match key.to_ascii_lowercase().as_str() {
                "level" => current.level = RaidLevel::parse(value),
                "num-devices" => current.num_devices = value.parse().ok(),
                "uuid" => current.uuid = Some(value.to_owned()),
                "devices" => current
                    .devices
                    .extend(value.split(',').filter(|d| !d.is_empty()).map(PathBuf::from)),
                _ => (),
            }
        }
    }

    arrays
}

/// Arrays whose superblocks are present on any partition.
pub fn examine_scan(ctx: &StorageContext) -> Result<Vec<ArrayInfo>> {
    let command = ToolCommand::new("mdadm").args(&["--examine", "--scan", "--verbose"]);
    let output = ctx.runner().run(&command)?;
    Ok(parse_scan(&output.stdout))
}

/// Arrays which are currently running.
pub fn detail_scan(ctx: &StorageContext) -> Result<Vec<ArrayInfo>> {
    let command = ToolCommand::new("mdadm").args(&["--misc", "--detail", "--scan"]);
    let output = ctx.runner().run(&command)?;
    Ok(parse_scan(&output.stdout))
}

/// Assembles every array found on disk which is not already running, claiming
/// their minors.
pub fn start_all(ctx: &StorageContext) -> Result<Vec<ArrayInfo>> {
    let running: BTreeSet<PathBuf> = detail_scan(ctx)?
        .into_iter()
        .map(|array| array.device)
        .collect();

    let mut started = Vec::new();
    for array in examine_scan(ctx)? {
        if let Some(minor) = array.minor() {
            if ctx.minors.reserve(minor).is_err() {
                tracing::warn!("{:?} uses a minor which is already claimed", array.device);
            }
        }

        if running.contains(&array.device) {
            ctx.mark_active(&array.device);
            continue;
        }

        if let Err(why) = assemble(ctx, &array.device, &array.devices) {
            tracing::warn!("unable to assemble {:?}: {}", array.device, why);
            continue;
        }

        ctx.mark_active(&array.device);
        started.push(array);
    }

    Ok(started)
}

/// Stops arrays in reverse order and frees their minors.
/// Stops `arrays` last to first, removing each one once it is stopped. On
/// failure the arrays still running are left in `arrays`.
pub fn stop_all(ctx: &StorageContext, arrays: &mut Vec<ArrayInfo>) -> Result<()> {
    while let Some(array) = arrays.last() {
        stop(ctx, &array.device)?;
        ctx.mark_inactive(&array.device);
        if let Some(minor) = array.minor() {
            ctx.minors.release(minor);
        }
        arrays.pop();
    }

    Ok(())
}

/// One array entry of an `mdadm.conf`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfArray {
    pub minor: u32,
    pub level: RaidLevel,
    pub members: usize,
}

/// Renders the md configuration block for the installed system.
pub fn mdadm_conf(arrays: &[ConfArray]) -> String {
    let mut conf = String::from("# mdadm.conf written out by the installer\nDEVICE partitions\nMAILADDR root\n\n");
    for array in arrays {
        conf.push_str(&format!(
            "ARRAY /dev/md{} super-minor={} level={} num-devices={}\n",
            array.minor,
            array.minor,
            array.level.mdadm_name(),
            array.members
        ));
    }

    conf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::context::testing::context;
    use std::sync::Arc;

    #[test]
    fn array_sizes() {
        let members = [1000, 800, 1200, 900];
        assert_eq!(RaidLevel::Raid0.usable_size(&members), 3900);
        assert_eq!(RaidLevel::Raid1.usable_size(&members), 800);
        assert_eq!(RaidLevel::Raid5.usable_size(&members), 2400);
        assert_eq!(RaidLevel::Raid6.usable_size(&members), 1600);
        assert_eq!(RaidLevel::Raid10.usable_size(&members), 1600);
        assert_eq!(RaidLevel::Raid5.usable_size(&[]), 0);
    }

    #[test]
    fn member_rules() {
        assert_eq!(RaidLevel::Raid1.min_members(), 2);
        assert_eq!(RaidLevel::Raid5.min_members(), 3);
        assert_eq!(RaidLevel::Raid6.min_members(), 4);
        assert_eq!(RaidLevel::Raid0.max_spares(5), 0);
        assert_eq!(RaidLevel::Raid5.max_spares(5), 2);
        assert_eq!(RaidLevel::Raid5.required_active(4), 3);
        assert_eq!(RaidLevel::parse("RAID10"), Some(RaidLevel::Raid10));
        assert_eq!(RaidLevel::parse("raid1"), Some(RaidLevel::Raid1));
        assert_eq!(RaidLevel::parse("4"), None);
    }

    #[test]
    fn minors_are_unique() {
        let table = MinorTable::default();
        table.reserve(0).unwrap();
        assert_eq!(table.allocate().unwrap(), 1);
        assert!(table.reserve(1).is_err());
        assert!(table.reserve(MAX_MINORS).is_err());

        table.release(0);
        assert_eq!(table.allocate().unwrap(), 0);

        for _ in 2..MAX_MINORS {
            table.allocate().unwrap();
        }
        assert!(table.allocate().is_err());
        assert!(table.available().is_empty());
    }

    #[test]
    fn scan_parsing() {
        let output = "ARRAY /dev/md0 level=raid1 num-devices=2 UUID=a1:b2:c3:d4\n   \
                      devices=/dev/sda1,/dev/sdb1\n\
                      ARRAY /dev/md1 level=raid5 num-devices=3 UUID=e5:f6\n   \
                      devices=/dev/sda2,/dev/sdb2,/dev/sdc2\n";

        let arrays = parse_scan(output);
        assert_eq!(arrays.len(), 2);
        assert_eq!(arrays[0].level, Some(RaidLevel::Raid1));
        assert_eq!(arrays[0].devices.len(), 2);
        assert_eq!(arrays[1].minor(), Some(1));
        assert_eq!(arrays[1].num_devices, Some(3));
        assert_eq!(arrays[1].devices[2], PathBuf::from("/dev/sdc2"));
    }

    #[test]
    fn create_flags() {
        let runner = Arc::new(RecordingRunner::new());
        let ctx = context(runner.clone());
        let members = [
            PathBuf::from("/dev/sda1"),
            PathBuf::from("/dev/sdb1"),
            PathBuf::from("/dev/sdc1"),
        ];

        create(
            &ctx,
            CreateArgs {
                device: Path::new("/dev/md0"),
                level: RaidLevel::Raid1,
                chunk_kb: Some(64),
                members: &members,
                spares: 1,
            },
        )
        .unwrap();

        assert_eq!(
            runner.lines(),
            vec![
                "mdadm --create /dev/md0 --run --level=raid1 --raid-devices=2 \
                 --spare-devices=1 /dev/sda1 /dev/sdb1 /dev/sdc1"
            ]
        );
    }

    #[test]
    fn conf_block() {
        let conf = mdadm_conf(&[ConfArray {
            minor: 0,
            level: RaidLevel::Raid1,
            members: 2,
        }]);

        assert!(conf.contains("DEVICE partitions\n"));
        assert!(conf.contains("MAILADDR root\n"));
        assert!(conf.contains("ARRAY /dev/md0 super-minor=0 level=raid1 num-devices=2\n"));
    }
}
