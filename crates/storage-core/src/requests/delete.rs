// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

/// Removal of an existing partition, identified by where it lies on its disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSpec {
    pub drive: String,
    pub start: u64,
    pub end: u64,
    pub device: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteLogicalVolumeSpec {
    pub name: String,
    pub vg: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteVolumeGroupSpec {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRaidSpec {
    pub minor: u32,
}

/// A destructive intent, deferred until whatever depends on the target is gone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteRequest {
    Partition(DeleteSpec),
    LogicalVolume(DeleteLogicalVolumeSpec),
    VolumeGroup(DeleteVolumeGroupSpec),
    Raid(DeleteRaidSpec),
}

impl DeleteRequest {
    /// Deletes which do not touch a partition table.
    pub fn is_meta(&self) -> bool {
        !matches!(self, DeleteRequest::Partition(_))
    }

    /// Removal order: logical volumes, then their groups, then arrays, then partitions.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            DeleteRequest::LogicalVolume(_) => 0,
            DeleteRequest::VolumeGroup(_) => 1,
            DeleteRequest::Raid(_) => 2,
            DeleteRequest::Partition(_) => 3,
        }
    }
}
