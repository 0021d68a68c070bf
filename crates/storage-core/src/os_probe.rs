// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Discovery of installed systems which an upgrade could target.

use crate::context::StorageContext;
use crate::errors::{OperationError, Result};
use os_release::OsRelease;
use std::fs;
use std::path::Path;
use sys_mount::{FilesystemType as MountType, Mount, MountFlags, UnmountFlags};

/// A filesystem holding an installed operating system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingRoot {
    pub device: String,
    pub name: String,
    pub version: String,
}

/// Reads the release marker of the system rooted at `root`.
pub fn release_of(root: &Path) -> Option<(String, String)> {
    if let Ok(release) = OsRelease::new_from(root.join("etc/os-release")) {
        if !release.name.is_empty() {
            return Some((release.name, release.version_id));
        }
    }

    let marker = fs::read_to_string(root.join("etc/redhat-release")).ok()?;
    parse_release_line(marker.lines().next()?)
}

/// Splits a line such as `Fedora release 8 (Werewolf)` into its name and version.
fn parse_release_line(line: &str) -> Option<(String, String)> {
    let (name, rest) = line.split_once(" release ")?;
    let version = rest.split_whitespace().next().unwrap_or_default();

    Some((name.trim().to_owned(), version.to_owned()))
}

/// Mounts `device` read-only at the probe directory and looks for a release
/// marker. The filesystem is always unmounted before this returns.
pub fn probe(ctx: &StorageContext, device: &str, fstype: &str) -> Result<Option<ExistingRoot>> {
    let target = ctx.config.probe_dir.as_path();

    // A previous probe may have been interrupted.
    let _ = sys_mount::unmount(target, UnmountFlags::DETACH);
    fs::create_dir_all(target).map_err(|why| OperationError::io(target, why))?;

    let mount = Mount::builder()
        .fstype(MountType::Manual(fstype))
        .flags(MountFlags::RDONLY)
        .mount_autodrop(device, target, UnmountFlags::DETACH)
        .map_err(|why| OperationError::Mount {
            device: device.to_owned(),
            target: target.to_path_buf(),
            why,
        })?;

    let found = release_of(target).map(|(name, version)| ExistingRoot {
        device: device.to_owned(),
        name,
        version,
    });

    drop(mount);

    if let Some(root) = found.as_ref() {
        tracing::info!("found {} {} on {}", root.name, root.version, device);
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::scratch_dir;

    #[test]
    fn os_release_is_preferred() {
        let root = scratch_dir("os-release");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(
            root.join("etc/os-release"),
            "NAME=\"Pop!_OS\"\nVERSION=\"22.04 LTS\"\nID=pop\nVERSION_ID=\"22.04\"\n",
        )
        .unwrap();
        fs::write(root.join("etc/redhat-release"), "Fedora release 8 (Werewolf)\n").unwrap();

        assert_eq!(release_of(&root), Some(("Pop!_OS".into(), "22.04".into())));
    }

    #[test]
    fn redhat_release_is_the_fallback() {
        let root = scratch_dir("redhat-release");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/redhat-release"), "Fedora release 8 (Werewolf)\n").unwrap();

        assert_eq!(release_of(&root), Some(("Fedora".into(), "8".into())));
        assert_eq!(release_of(&scratch_dir("empty-root")), None);
        assert_eq!(parse_release_line("not a marker"), None);
    }
}
