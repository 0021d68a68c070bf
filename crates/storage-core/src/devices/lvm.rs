// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use super::Device;
use crate::context::StorageContext;
use crate::errors::{OperationError, Result};
use crate::{lvm, raid};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct VolumeGroupDevice {
    pub name: String,
    pub pvs: Vec<Device>,
    pub pe_kb: u64,
    pub existing: bool,
}

impl VolumeGroupDevice {
    pub fn new(name: &str, pvs: Vec<Device>, pe_kb: u64, existing: bool) -> Self {
        Self {
            name: name.to_owned(),
            pvs,
            pe_kb,
            existing,
        }
    }

    pub fn path(&self) -> PathBuf {
        Path::new("/dev").join(&self.name)
    }

    pub(super) fn materialize(&mut self, ctx: &StorageContext, root: &Path) -> Result<PathBuf> {
        let path = self.path();
        if ctx.is_active(&path) {
            return Ok(path);
        }

        let mut pvs = Vec::with_capacity(self.pvs.len());
        for pv in &mut self.pvs {
            let pv = pv.materialize(ctx, root)?;

            if !self.existing {
                // A leftover md superblock makes LVM skip the device.
                raid::zero_superblock(ctx, &pv)?;
                lvm::pv_create(ctx, &pv)?;
            }

            pvs.push(pv);
        }

        if self.existing {
            lvm::vg_activate(ctx, &self.name)?;
        } else {
            lvm::vg_create(ctx, &self.name, self.pe_kb, &pvs)?;
            self.existing = true;
        }

        ctx.mark_active(&path);
        Ok(path)
    }

    pub(super) fn teardown(&mut self, ctx: &StorageContext) -> Result<()> {
        let path = self.path();
        if ctx.is_active(&path) {
            lvm::vg_deactivate(ctx, &self.name)?;
            ctx.mark_inactive(&path);
        }

        for pv in &mut self.pvs {
            pv.teardown(ctx)?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct LogicalVolumeDevice {
    pub vg: Arc<VolumeGroupDevice>,
    pub name: String,
    /// Requested size, before rounding to extents.
    pub size_mb: u64,
    pub existing: bool,
}

impl LogicalVolumeDevice {
    pub fn new(vg: Arc<VolumeGroupDevice>, name: &str, size_mb: u64, existing: bool) -> Self {
        Self {
            vg,
            name: name.to_owned(),
            size_mb,
            existing,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.vg.path().join(&self.name)
    }

    pub(super) fn materialize(&mut self, ctx: &StorageContext) -> Result<PathBuf> {
        let path = self.path();
        if ctx.is_active(&path) {
            return Ok(path);
        }

        if !ctx.is_active(&self.vg.path()) {
            return Err(OperationError::NotMaterialized {
                device: self.vg.name.clone(),
            });
        }

        if self.existing {
            lvm::lv_activate(ctx, &self.vg.name, &self.name)?;
        } else {
            lvm::lv_create(ctx, &self.vg.name, &self.name, self.size_mb)?;
            self.existing = true;
        }

        ctx.mark_active(&path);
        Ok(path)
    }

    pub(super) fn teardown(&mut self, ctx: &StorageContext) -> Result<()> {
        let path = self.path();
        if ctx.is_active(&path) {
            lvm::lv_deactivate(ctx, &self.vg.name, &self.name)?;
            ctx.mark_inactive(&path);
        }

        Ok(())
    }
}
