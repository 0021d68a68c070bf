// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use super::{DeleteLogicalVolumeSpec, DeleteRaidSpec, DeleteRequest, DeleteVolumeGroupSpec};
use super::{RequestKind, RequestSpec, SanityEnv};
use crate::context::StorageContext;
use crate::devices::{Device, LogicalVolumeDevice, LuksDevice, RaidDevice, VolumeGroupDevice};
use crate::errors::{OperationError, Result, ValidationError};
use crate::lvm;
use crate::raid::MinorTable;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Outcome of [`Partitions::replace_request`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Accepted(u32),
    /// The new request was withdrawn and the previous one restored.
    Rejected(ValidationError),
}

/// The set of requests making up the desired layout.
///
/// Requests refer to each other by unique id. Every lookup goes through
/// [`Partitions::get`], which reports a missing id as a dangling reference.
#[derive(Clone, Debug, Default)]
pub struct Partitions {
    requests: Vec<RequestSpec>,
    deletes: Vec<DeleteRequest>,
    next_id: u32,
}

impl Partitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> &[RequestSpec] {
        &self.requests
    }

    /// Drops every request and delete, keeping ids unique for the life of the container.
    pub fn reset(&mut self) {
        self.requests.clear();
        self.deletes.clear();
    }

    fn sort(&mut self) {
        self.requests
            .sort_by_key(|request| (request.kind.rank(), request.unique_id));
    }

    /// Stores `request`, assigning it an id unless it already has one. An id
    /// already held by another request is replaced with a fresh one.
    pub fn add_request(&mut self, mut request: RequestSpec) -> u32 {
        if let Some(id) = request.unique_id.filter(|&id| self.contains(id)) {
            tracing::warn!("request id {} is already taken, assigning a new one", id);
            request.unique_id = None;
        }

        let id = match request.unique_id {
            Some(id) => {
                self.next_id = self.next_id.max(id + 1);
                id
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                request.unique_id = Some(id);
                id
            }
        };

        self.requests.push(request);
        self.sort();
        id
    }

    /// Removes one request. Requests which refer to it are left in place; see
    /// [`Partitions::delete_dependent_requests`].
    pub fn remove_request(&mut self, id: u32) -> Result<RequestSpec> {
        let pos = self
            .requests
            .iter()
            .position(|request| request.unique_id == Some(id))
            .ok_or(OperationError::DanglingReference(id))?;

        Ok(self.requests.remove(pos))
    }

    pub fn get(&self, id: u32) -> Result<&RequestSpec> {
        self.requests
            .iter()
            .find(|request| request.unique_id == Some(id))
            .ok_or(OperationError::DanglingReference(id))
    }

    pub fn get_mut(&mut self, id: u32) -> Result<&mut RequestSpec> {
        self.requests
            .iter_mut()
            .find(|request| request.unique_id == Some(id))
            .ok_or(OperationError::DanglingReference(id))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_ok()
    }

    pub fn by_mountpoint(&self, mountpoint: &str) -> Option<&RequestSpec> {
        self.requests
            .iter()
            .find(|request| request.mountpoint.as_deref() == Some(mountpoint))
    }

    /// Finds a request by the name of its device: `sda1`, `md0`, a group name, or
    /// `group/volume`.
    pub fn by_device(&self, name: &str) -> Option<&RequestSpec> {
        let name = name.trim_start_matches("/dev/");
        self.requests.iter().find(|request| match &request.kind {
            RequestKind::Partition(spec) => spec.device.as_deref() == Some(name),
            RequestKind::Raid(spec) => spec.minor.map(|minor| format!("md{}", minor)).as_deref() == Some(name),
            RequestKind::VolumeGroup(spec) => spec.name == name,
            RequestKind::LogicalVolume(spec) => self
                .get(spec.vg)
                .ok()
                .and_then(RequestSpec::as_volume_group)
                .map_or(false, |vg| format!("{}/{}", vg.name, spec.name) == name),
        })
    }

    pub fn raid_requests(&self) -> impl Iterator<Item = &RequestSpec> {
        self.requests.iter().filter(|request| request.as_raid().is_some())
    }

    pub fn volume_group_requests(&self) -> impl Iterator<Item = &RequestSpec> {
        self.requests
            .iter()
            .filter(|request| request.as_volume_group().is_some())
    }

    /// Logical volumes of the group with id `vg`.
    pub fn logical_volumes_of(&self, vg: u32) -> impl Iterator<Item = &RequestSpec> {
        self.requests.iter().filter(move |request| {
            request
                .as_logical_volume()
                .map_or(false, |lv| lv.vg == vg)
        })
    }

    /// The array which lists `id` as a member.
    pub fn raid_parent(&self, id: u32) -> Option<&RequestSpec> {
        self.raid_requests()
            .find(|request| request.as_raid().map_or(false, |raid| raid.members.contains(&id)))
    }

    /// The volume group which lists `id` as a physical volume.
    pub fn vg_parent(&self, id: u32) -> Option<&RequestSpec> {
        self.volume_group_requests().find(|request| {
            request
                .as_volume_group()
                .map_or(false, |vg| vg.pvs.contains(&id))
        })
    }

    /// Whether any other request refers to `id`.
    pub fn is_referenced(&self, id: u32) -> bool {
        !self.dependents_of(id).is_empty()
    }

    fn dependents_of(&self, id: u32) -> Vec<u32> {
        self.requests
            .iter()
            .filter(|request| match &request.kind {
                RequestKind::Raid(spec) => spec.members.contains(&id),
                RequestKind::VolumeGroup(spec) => spec.pvs.contains(&id),
                RequestKind::LogicalVolume(spec) => spec.vg == id,
                RequestKind::Partition(_) => false,
            })
            .filter_map(|request| request.unique_id)
            .collect()
    }

    pub fn add_delete(&mut self, delete: DeleteRequest) {
        if !self.deletes.contains(&delete) {
            self.deletes.push(delete);
            self.deletes.sort_by_key(DeleteRequest::rank);
        }
    }

    pub fn remove_delete(&mut self, delete: &DeleteRequest) -> bool {
        let before = self.deletes.len();
        self.deletes.retain(|existing| existing != delete);
        self.deletes.len() != before
    }

    /// Pending deletes, logical volumes first.
    pub fn deletes(&self) -> &[DeleteRequest] {
        &self.deletes
    }

    /// Deletes of volumes, groups and arrays.
    pub fn meta_deletes(&self) -> impl Iterator<Item = &DeleteRequest> {
        self.deletes.iter().filter(|delete| delete.is_meta())
    }

    /// Removes every request which depends on `id`, directly or transitively,
    /// and queues deletes for those which exist on disk. `id` itself may already
    /// have been removed. Returns the ids that were removed.
    pub fn delete_dependent_requests(&mut self, id: u32) -> Vec<u32> {
        // Collect against an unchanging view first.
        let mut doomed = BTreeSet::new();
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            for dependent in self.dependents_of(next) {
                if doomed.insert(dependent) {
                    pending.push(dependent);
                }
            }
        }

        let mut deletes = Vec::new();
        for &dependent in &doomed {
            let request = match self.get(dependent) {
                Ok(request) if request.preexist => request,
                _ => continue,
            };

            match &request.kind {
                RequestKind::Raid(spec) => {
                    if let Some(minor) = spec.minor {
                        deletes.push(DeleteRequest::Raid(DeleteRaidSpec { minor }));
                    }
                }
                RequestKind::VolumeGroup(spec) => {
                    deletes.push(DeleteRequest::VolumeGroup(DeleteVolumeGroupSpec {
                        name: spec.name.clone(),
                    }));
                }
                RequestKind::LogicalVolume(spec) => {
                    let vg = match self.get(spec.vg).ok().and_then(RequestSpec::as_volume_group) {
                        Some(vg) => vg.name.clone(),
                        None => {
                            tracing::error!("unable to find the volume group of {}", spec.name);
                            continue;
                        }
                    };

                    deletes.push(DeleteRequest::LogicalVolume(DeleteLogicalVolumeSpec {
                        name: spec.name.clone(),
                        vg,
                    }));
                }
                RequestKind::Partition(_) => (),
            }
        }

        self.requests.retain(|request| {
            request
                .unique_id
                .map_or(true, |id| !doomed.contains(&id))
        });

        for delete in deletes {
            self.add_delete(delete);
        }

        doomed.into_iter().collect()
    }

    /// Swaps the request `old` (if any) for `new`, keeping the change only if
    /// `new` passes its sanity check. A rejected change restores `old`, and a
    /// restored request which no longer validates is an internal error.
    pub fn replace_request(
        &mut self,
        old: Option<u32>,
        mut new: RequestSpec,
        env: &SanityEnv,
    ) -> Result<Applied> {
        let removed = match old {
            Some(id) => Some(self.remove_request(id)?),
            None => None,
        };

        if new.unique_id.is_none() {
            new.unique_id = old;
        }

        let id = self.add_request(new);
        let error = self.get(id)?.sanity_check_request(self, env.registry);

        let error = match error {
            Some(error) => error,
            None => return Ok(Applied::Accepted(id)),
        };

        tracing::info!("rejecting request {}: {}", id, error);
        self.remove_request(id)?;

        if let Some(previous) = removed {
            let previous = self.add_request(previous);
            if let Some(broken) = self.get(previous)?.sanity_check_request(self, env.registry) {
                return Err(OperationError::RollbackInconsistent(broken));
            }
        }

        Ok(Applied::Rejected(error))
    }

    /// Fails with [`OperationError::Cycle`] if anything `request` is built on,
    /// directly or transitively, is built on itself. Missing references are skipped.
    pub fn check_acyclic(&self, request: &RequestSpec) -> Result<()> {
        self.walk_references(request, &mut Vec::new())
    }

    fn walk_references(&self, request: &RequestSpec, path: &mut Vec<u32>) -> Result<()> {
        if let Some(id) = request.unique_id {
            if path.contains(&id) {
                return Err(OperationError::Cycle(id));
            }
            path.push(id);
        }

        for reference in request.kind.references() {
            if let Ok(next) = self.get(reference) {
                self.walk_references(next, path)?;
            }
        }

        if request.unique_id.is_some() {
            path.pop();
        }

        Ok(())
    }

    pub fn actual_size(&self, id: u32) -> Result<u64> {
        self.request_size(self.get(id)?)
    }

    /// Size in MB of what `request` provides, derived from what it is built on.
    pub fn request_size(&self, request: &RequestSpec) -> Result<u64> {
        self.check_acyclic(request)?;
        self.size_of(request)
    }

    fn size_of(&self, request: &RequestSpec) -> Result<u64> {
        let size = match &request.kind {
            RequestKind::Partition(spec) => spec.size_mb,
            RequestKind::Raid(spec) => {
                let active = spec.members.len() - spec.spares.min(spec.members.len());
                let sizes = spec.members[..active]
                    .iter()
                    .map(|&member| self.size_of(self.get(member)?))
                    .collect::<Result<Vec<u64>>>()?;

                spec.level.usable_size(&sizes)
            }
            RequestKind::VolumeGroup(spec) => {
                let mut total = 0;
                for &pv in &spec.pvs {
                    total += lvm::clamp_pv_size(self.size_of(self.get(pv)?)?, spec.pe_kb);
                }
                total
            }
            RequestKind::LogicalVolume(spec) => {
                let vg = self.get(spec.vg)?;
                let pe_kb = vg
                    .as_volume_group()
                    .ok_or_else(|| not_a_group(spec.vg))?
                    .pe_kb;

                match spec.percent {
                    Some(percent) => {
                        let share = self.size_of(vg)? * u64::from(percent) / 100;
                        lvm::clamp_lv_size_request(share, pe_kb, false)
                    }
                    None => lvm::clamp_lv_size_request(spec.size_mb, pe_kb, true),
                }
            }
        };

        Ok(size)
    }

    /// Gives every array without a minor the lowest free one.
    pub fn assign_raid_minors(&mut self, minors: &MinorTable) -> Result<()> {
        for request in &self.requests {
            if let Some(minor) = request.as_raid().and_then(|raid| raid.minor) {
                if !minors.in_use(minor) {
                    minors.reserve(minor)?;
                }
            }
        }

        for request in &mut self.requests {
            if let RequestKind::Raid(spec) = &mut request.kind {
                if spec.minor.is_none() {
                    spec.minor = Some(minors.allocate()?);
                }
            }
        }

        Ok(())
    }

    /// Builds the device the request `id` is realised as, including what it is
    /// built from and any encryption on top.
    pub fn get_device(&self, ctx: &StorageContext, id: u32) -> Result<Device> {
        self.check_acyclic(self.get(id)?)?;
        self.device_of(ctx, id)
    }

    fn device_of(&self, ctx: &StorageContext, id: u32) -> Result<Device> {
        let request = self.get(id)?;

        let device = match &request.kind {
            RequestKind::Partition(spec) => match spec.device.as_deref() {
                Some(name) => Device::partition(name),
                None => {
                    return Err(OperationError::NotMaterialized {
                        device: request.describe(),
                    })
                }
            },
            RequestKind::Raid(spec) => {
                let minor = spec.minor.ok_or_else(|| OperationError::NotMaterialized {
                    device: request.describe(),
                })?;

                let members = spec
                    .members
                    .iter()
                    .map(|&member| self.device_of(ctx, member))
                    .collect::<Result<Vec<Device>>>()?;

                Device::Raid(RaidDevice::new(
                    minor,
                    spec.level,
                    members,
                    spec.spares,
                    spec.chunk_kb,
                    request.preexist,
                ))
            }
            RequestKind::VolumeGroup(_) => Device::VolumeGroup(self.volume_group_device(ctx, id)?),
            RequestKind::LogicalVolume(spec) => {
                let vg = self.volume_group_device(ctx, spec.vg)?;
                Device::LogicalVolume(LogicalVolumeDevice::new(
                    Arc::new(vg),
                    &spec.name,
                    self.size_of(request)?,
                    request.preexist,
                ))
            }
        };

        let encryption = match request.encryption.as_ref() {
            Some(encryption) => encryption,
            None => return Ok(device),
        };

        let name = format!("luks-{}", device.display_name().replace('/', "-"));
        Ok(Device::Luks(LuksDevice::new(
            device,
            &name,
            encryption.passphrase.clone(),
            encryption.format,
        )))
    }

    fn volume_group_device(&self, ctx: &StorageContext, id: u32) -> Result<VolumeGroupDevice> {
        let request = self.get(id)?;
        let spec = request.as_volume_group().ok_or_else(|| not_a_group(id))?;

        let pvs = spec
            .pvs
            .iter()
            .map(|&pv| self.device_of(ctx, pv))
            .collect::<Result<Vec<Device>>>()?;

        Ok(VolumeGroupDevice::new(&spec.name, pvs, spec.pe_kb, request.preexist))
    }
}

fn not_a_group(id: u32) -> OperationError {
    OperationError::Invariant(format!("request {} is not a volume group", id))
}
