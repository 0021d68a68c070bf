// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use crate::command::{run_checked, ToolCommand};
use crate::context::StorageContext;
use crate::errors::{OperationError, Result};
use crate::MEGABYTE;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// An image file attached to a loop device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopbackDevice {
    /// Loop device name, such as `loop1`.
    pub name: String,
    pub image: PathBuf,
    pub size_mb: u64,
}

impl LoopbackDevice {
    pub fn new(name: &str, image: &Path, size_mb: u64) -> Self {
        Self {
            name: name.to_owned(),
            image: image.to_path_buf(),
            size_mb,
        }
    }

    pub fn path(&self) -> PathBuf {
        Path::new("/dev").join(&self.name)
    }

    pub(super) fn materialize(&mut self, ctx: &StorageContext) -> Result<PathBuf> {
        let path = self.path();
        if ctx.is_active(&path) {
            return Ok(path);
        }

        if !self.image.exists() {
            let image = File::create(&self.image).map_err(|why| OperationError::io(&self.image, why))?;
            image
                .set_len(self.size_mb * MEGABYTE)
                .map_err(|why| OperationError::io(&self.image, why))?;
        }

        let command = ToolCommand::new("losetup").path_arg(&path).path_arg(&self.image);
        run_checked(ctx.runner(), &command)?;

        ctx.mark_active(&path);
        Ok(path)
    }

    pub(super) fn teardown(&mut self, ctx: &StorageContext) -> Result<()> {
        let path = self.path();
        if ctx.is_active(&path) {
            run_checked(ctx.runner(), &ToolCommand::new("losetup").arg("-d").path_arg(&path))?;
            ctx.mark_inactive(&path);
        }

        Ok(())
    }
}

/// Swap space backed by a file inside the installed system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapFileDevice {
    /// Location as seen from the installed system, such as `/swapfile`.
    pub path: PathBuf,
    pub size_mb: u64,
}

impl SwapFileDevice {
    pub fn new(path: &Path, size_mb: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            size_mb,
        }
    }

    pub fn host_path(&self, root: &Path) -> PathBuf {
        root.join(self.path.strip_prefix("/").unwrap_or(&self.path))
    }

    pub(super) fn materialize(&mut self, root: &Path) -> Result<PathBuf> {
        let target = self.host_path(root);
        if target.exists() {
            return Ok(target);
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|why| OperationError::io(parent, why))?;
        }

        // Swap files may not be sparse, so every block is written.
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&target)
            .map_err(|why| OperationError::io(&target, why))?;

        let block = vec![0u8; MEGABYTE as usize];
        for _ in 0..self.size_mb {
            file.write_all(&block).map_err(|why| OperationError::io(&target, why))?;
        }

        fs::set_permissions(&target, fs::Permissions::from_mode(0o600))
            .map_err(|why| OperationError::io(&target, why))?;

        Ok(target)
    }
}

/// A directory mounted again at a second location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindMountDevice {
    pub source: PathBuf,
}

impl BindMountDevice {
    pub fn new(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
        }
    }

    pub(super) fn materialize(&self) -> Result<PathBuf> {
        if !self.source.is_dir() {
            fs::create_dir_all(&self.source).map_err(|why| OperationError::io(&self.source, why))?;
        }

        Ok(self.source.clone())
    }
}
