// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Seeding the request set from what was found on the disks.

use super::{
    LogicalVolumeRequestSpec, PartitionSpec, Partitions, RaidRequestSpec, RequestKind, RequestSpec,
    PHYSICAL_VOLUME_KIND, RAID_MEMBER_KIND,
};
use crate::errors::{OperationError, Result};
use crate::fs_types::FilesystemTypeRegistry;
use crate::raid::RaidLevel;
use std::collections::BTreeMap;

const FOREIGN_KIND: &str = "foreign";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbedPartition {
    /// Kernel name, such as `sda1`.
    pub name: String,
    pub drive: String,
    pub number: u32,
    pub start: u64,
    pub end: u64,
    pub size_mb: u64,
    /// Signature reported by udev, if any.
    pub signature: Option<String>,
    pub label: Option<String>,
    /// Holds the media the installer is running from.
    pub protected: bool,
    pub primary: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbedArray {
    pub minor: u32,
    pub level: RaidLevel,
    /// Kernel names of the member partitions.
    pub members: Vec<String>,
    pub signature: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbedVolumeGroup {
    pub name: String,
    pub pe_kb: u64,
    /// Kernel names of the physical volumes, partitions or arrays.
    pub pvs: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbedLogicalVolume {
    pub vg: String,
    pub name: String,
    pub size_mb: u64,
    pub signature: Option<String>,
    pub label: Option<String>,
}

/// Storage found on the system, as reported by the disk set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLayout {
    pub partitions: Vec<ProbedPartition>,
    pub arrays: Vec<ProbedArray>,
    pub volume_groups: Vec<ProbedVolumeGroup>,
    pub logical_volumes: Vec<ProbedLogicalVolume>,
}

fn kind_name(registry: &FilesystemTypeRegistry, signature: Option<&str>) -> String {
    signature
        .and_then(|signature| registry.kind_for_signature(signature))
        .map_or_else(|| FOREIGN_KIND.to_owned(), |kind| kind.name.clone())
}

impl Partitions {
    /// Replaces every request with one per existing object in `layout`. Nothing
    /// is scheduled for formatting.
    pub fn set_from_disk(&mut self, layout: &DiskLayout, registry: &FilesystemTypeRegistry) -> Result<()> {
        self.reset();

        // Kernel name to request id, shared by partitions, arrays and groups.
        let mut ids: BTreeMap<String, u32> = BTreeMap::new();

        for partition in &layout.partitions {
            let mut request = RequestSpec::with_kind(
                &kind_name(registry, partition.signature.as_deref()),
                RequestKind::Partition(PartitionSpec {
                    size_mb: partition.size_mb,
                    start: Some(partition.start),
                    end: Some(partition.end),
                    primary: partition.primary,
                    device: Some(partition.name.clone()),
                    drive: Some(partition.drive.clone()),
                    drives: vec![partition.drive.clone()],
                    ..PartitionSpec::default()
                }),
            )
            .preexisting();

            request.protected = partition.protected;
            request.fslabel = partition.label.clone();

            let id = self.add_request(request);
            ids.insert(partition.name.clone(), id);
        }

        for array in &layout.arrays {
            let members = array
                .members
                .iter()
                .map(|member| resolve(&ids, member, RAID_MEMBER_KIND))
                .collect::<Result<Vec<u32>>>()?;

            let request = RequestSpec::with_kind(
                &kind_name(registry, array.signature.as_deref()),
                RequestKind::Raid(RaidRequestSpec {
                    level: array.level,
                    members,
                    spares: 0,
                    minor: Some(array.minor),
                    chunk_kb: None,
                }),
            )
            .preexisting();

            let id = self.add_request(request);
            ids.insert(format!("md{}", array.minor), id);
        }

        let mut groups: BTreeMap<&str, u32> = BTreeMap::new();
        for group in &layout.volume_groups {
            let pvs = group
                .pvs
                .iter()
                .map(|pv| resolve(&ids, pv, PHYSICAL_VOLUME_KIND))
                .collect::<Result<Vec<u32>>>()?;

            tracing::debug!("found volume group {} with {}KB extents", group.name, group.pe_kb);
            let request = RequestSpec::volume_group(&group.name, pvs, Some(group.pe_kb)).preexisting();
            groups.insert(&group.name, self.add_request(request));
        }

        for volume in &layout.logical_volumes {
            let vg = *groups.get(volume.vg.as_str()).ok_or_else(|| {
                OperationError::Invariant(format!(
                    "logical volume {} belongs to the unknown group {}",
                    volume.name, volume.vg
                ))
            })?;

            let mut request = RequestSpec::with_kind(
                &kind_name(registry, volume.signature.as_deref()),
                RequestKind::LogicalVolume(LogicalVolumeRequestSpec {
                    vg,
                    name: volume.name.clone(),
                    size_mb: volume.size_mb,
                    percent: None,
                    grow: false,
                    max_size_mb: None,
                }),
            )
            .preexisting();

            request.fslabel = volume.label.clone();
            self.add_request(request);
        }

        Ok(())
    }
}

fn resolve(ids: &BTreeMap<String, u32>, name: &str, role: &str) -> Result<u32> {
    let name = name.trim_start_matches("/dev/");
    ids.get(name).copied().ok_or_else(|| {
        OperationError::Invariant(format!("{} {} was not found among the probed devices", role, name))
    })
}
