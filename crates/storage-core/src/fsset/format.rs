// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Tool invocations that create, label, migrate and scan filesystems.

use crate::command::ToolCommand;
use crate::errors::{OperationError, Result};
use crate::fs_types::{FilesystemType, FsFlavor};
use std::path::Path;

/// Commands which create a `kind` filesystem on `device`, in order.
///
/// Kinds whose on-disk signature is written by the device layers (RAID members,
/// physical volumes) need no commands.
pub fn format_commands(
    kind: &FilesystemType,
    device: &Path,
    label: Option<&str>,
) -> Result<Vec<ToolCommand>> {
    if !kind.formattable() {
        return Err(OperationError::Invariant(format!(
            "{} filesystems cannot be formatted",
            kind.name
        )));
    }

    let commands = match kind.flavor {
        FsFlavor::Ext2 | FsFlavor::Ext3 | FsFlavor::Ext4 => vec![
            ToolCommand::new("mke2fs")
                .args(&["-t", &kind.name])
                .path_arg(device),
            ToolCommand::new("tune2fs")
                .args(&["-c0", "-i0", "-O", "dir_index"])
                .path_arg(device),
        ],
        FsFlavor::Reiserfs => vec![ToolCommand::new("mkreiserfs")
            .args(&["-f", "-f"])
            .path_arg(device)],
        FsFlavor::Xfs => vec![ToolCommand::new("mkfs.xfs").arg("-f").path_arg(device)],
        FsFlavor::Jfs => vec![ToolCommand::new("mkfs.jfs").arg("-q").path_arg(device)],
        FsFlavor::Gfs2 => vec![ToolCommand::new("mkfs.gfs2")
            .args(&["-j", "1", "-p", "lock_nolock", "-O"])
            .path_arg(device)],
        FsFlavor::Vfat | FsFlavor::Efi => vec![ToolCommand::new("mkdosfs").path_arg(device)],
        FsFlavor::Hfs => vec![ToolCommand::new("hformat").path_arg(device)],
        FsFlavor::AppleBootstrap => vec![ToolCommand::new("hformat")
            .args(&["-l", "bootstrap"])
            .path_arg(device)],
        FsFlavor::Swap => {
            let mut command = ToolCommand::new("mkswap").arg("-v1");
            if let Some(label) = label {
                command = command.args(&["-L", label]);
            }
            vec![command.path_arg(device)]
        }
        // The boot loader installer writes the PReP partition directly.
        FsFlavor::PrepBoot | FsFlavor::RaidMember | FsFlavor::PhysicalVolume => Vec::new(),
        _ => {
            return Err(OperationError::Invariant(format!(
                "no format tool is known for {}",
                kind.name
            )))
        }
    };

    Ok(commands)
}

/// Command which writes `label` onto an existing `kind` filesystem.
pub fn label_command(kind: &FilesystemType, device: &Path, label: &str) -> Option<ToolCommand> {
    let command = match kind.flavor {
        FsFlavor::Ext2 | FsFlavor::Ext3 | FsFlavor::Ext4 => {
            ToolCommand::new("e2label").path_arg(device).arg(label)
        }
        FsFlavor::Xfs => ToolCommand::new("xfs_db")
            .args(&["-x", "-c"])
            .arg(format!("label {}", label))
            .path_arg(device),
        FsFlavor::Jfs => ToolCommand::new("jfs_tune")
            .args(&["-L", label])
            .path_arg(device),
        FsFlavor::Vfat | FsFlavor::Efi => {
            ToolCommand::new("dosfslabel").path_arg(device).arg(label)
        }
        FsFlavor::Reiserfs => ToolCommand::new("reiserfstune")
            .args(&["--label", label])
            .path_arg(device),
        _ => return None,
    };

    Some(command)
}

/// Command which upgrades `from` to `to` in place, keeping its data.
pub fn migrate_command(from: &FilesystemType, to: &FilesystemType, device: &Path) -> Result<ToolCommand> {
    let command = match (from.flavor, to.flavor) {
        (FsFlavor::Ext2, FsFlavor::Ext3) => ToolCommand::new("tune2fs").arg("-j").path_arg(device),
        (FsFlavor::Ext3, FsFlavor::Ext4) => ToolCommand::new("tune2fs")
            .args(&["-O", "extents,uninit_bg,dir_index"])
            .path_arg(device),
        _ => {
            return Err(OperationError::Invariant(format!(
                "{} cannot be migrated to {}",
                from.name, to.name
            )))
        }
    };

    Ok(command)
}

pub fn journal_probe(device: &Path) -> ToolCommand {
    ToolCommand::new("dumpe2fs").arg("-h").path_arg(device)
}

/// Whether a `dumpe2fs -h` listing includes a journal among its features.
pub fn has_journal(dumpe2fs: &str) -> bool {
    dumpe2fs
        .lines()
        .filter_map(|line| line.strip_prefix("Filesystem features:"))
        .any(|features| features.split_whitespace().any(|f| f == "has_journal"))
}

pub fn badblocks_command(device: &Path) -> ToolCommand {
    ToolCommand::new("badblocks").arg("-vv").path_arg(device)
}

/// Reads the final tally of a `badblocks -vv` run.
pub fn bad_block_count(output: &str) -> Option<u64> {
    output.lines().rev().find_map(|line| {
        let rest = line.trim().strip_prefix("Pass completed, ")?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_types::FilesystemTypeRegistry;

    fn lines(commands: &[ToolCommand]) -> Vec<String> {
        commands.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn ext_filesystems_are_tuned() {
        let registry = FilesystemTypeRegistry::builtin();
        let ext3 = registry.get("ext3").unwrap();
        let commands = format_commands(ext3, Path::new("/dev/sda1"), None).unwrap();
        assert_eq!(
            lines(&commands),
            vec!["mke2fs -t ext3 /dev/sda1", "tune2fs -c0 -i0 -O dir_index /dev/sda1"]
        );
    }

    #[test]
    fn swap_labels_are_written_by_mkswap() {
        let registry = FilesystemTypeRegistry::builtin();
        let swap = registry.get("swap").unwrap();
        let commands = format_commands(swap, Path::new("/dev/sda2"), Some("SWAP-sda2")).unwrap();
        assert_eq!(lines(&commands), vec!["mkswap -v1 -L SWAP-sda2 /dev/sda2"]);
        assert!(label_command(swap, Path::new("/dev/sda2"), "x").is_none());
    }

    #[test]
    fn unformattable_kinds_are_rejected() {
        let registry = FilesystemTypeRegistry::builtin();
        let vg = registry.get("volume group (LVM)").unwrap();
        match format_commands(vg, Path::new("/dev/VolGroup00"), None) {
            Err(OperationError::Invariant(_)) => (),
            other => panic!("expected an invariant violation, got {:?}", other),
        }
    }

    #[test]
    fn label_tools() {
        let registry = FilesystemTypeRegistry::builtin();
        let device = Path::new("/dev/sdb1");
        let label = |name: &str| {
            label_command(registry.get(name).unwrap(), device, "/home").map(|c| c.to_string())
        };

        assert_eq!(label("ext4").unwrap(), "e2label /dev/sdb1 /home");
        assert_eq!(label("xfs").unwrap(), "xfs_db -x -c label /home /dev/sdb1");
        assert_eq!(label("jfs").unwrap(), "jfs_tune -L /home /dev/sdb1");
        assert_eq!(label("vfat").unwrap(), "dosfslabel /dev/sdb1 /home");
        assert!(label("gfs2").is_none());
    }

    #[test]
    fn migrations() {
        let registry = FilesystemTypeRegistry::builtin();
        let ext2 = registry.get("ext2").unwrap();
        let ext3 = registry.get("ext3").unwrap();
        let ext4 = registry.get("ext4").unwrap();
        let device = Path::new("/dev/sda3");

        assert_eq!(migrate_command(ext2, ext3, device).unwrap().to_string(), "tune2fs -j /dev/sda3");
        assert_eq!(
            migrate_command(ext3, ext4, device).unwrap().to_string(),
            "tune2fs -O extents,uninit_bg,dir_index /dev/sda3"
        );
        assert!(migrate_command(ext2, ext4, device).is_err());
    }

    #[test]
    fn output_parsing() {
        let dump = "Filesystem volume name:   <none>\nFilesystem features:      has_journal ext_attr resize_inode\n";
        assert!(has_journal(dump));
        assert!(!has_journal("Filesystem features:      ext_attr resize_inode\n"));

        let scan = "Checking blocks 0 to 1048575\nChecking for bad blocks (read-only test): done\nPass completed, 3 bad blocks found. (3/0/0 errors)\n";
        assert_eq!(bad_block_count(scan), Some(3));
        assert_eq!(bad_block_count("nothing useful"), None);
    }
}
