// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use super::Device;
use crate::context::StorageContext;
use crate::errors::{LuksError, Result};
use crate::luks;
use secstr::SecStr;
use std::path::{Path, PathBuf};

/// Encrypts exactly one underlying device.
#[derive(Clone, Debug)]
pub struct LuksDevice {
    pub inner: Box<Device>,
    /// Name of the decrypted mapping under `/dev/mapper`.
    pub name: String,
    passphrase: Option<SecStr>,
    pub needs_format: bool,
}

impl LuksDevice {
    pub fn new(inner: Device, name: &str, passphrase: Option<SecStr>, needs_format: bool) -> Self {
        Self {
            inner: Box::new(inner),
            name: name.to_owned(),
            passphrase,
            needs_format,
        }
    }

    pub fn set_passphrase(&mut self, passphrase: SecStr) {
        self.passphrase = Some(passphrase);
    }

    pub fn has_passphrase(&self) -> bool {
        self.passphrase
            .as_ref()
            .map_or(false, |passphrase| !passphrase.unsecure().is_empty())
    }

    pub fn mapped_path(&self) -> PathBuf {
        luks::mapper_path(&self.name)
    }

    /// The mapping name, once the device has been opened.
    pub fn mapped_name(&self, ctx: &StorageContext) -> Option<&str> {
        if ctx.is_active(&self.mapped_path()) {
            Some(&self.name)
        } else {
            None
        }
    }

    /// Line of `/etc/crypttab` which opens this device at boot.
    pub fn crypttab_line(&self) -> String {
        format!("{} {} none", self.name, self.inner.path().display())
    }

    pub(super) fn materialize(&mut self, ctx: &StorageContext, root: &Path) -> Result<PathBuf> {
        let mapped = self.mapped_path();
        if ctx.is_active(&mapped) {
            return Ok(mapped);
        }

        let passphrase = match self.passphrase.as_ref() {
            Some(passphrase) if !passphrase.unsecure().is_empty() => passphrase.clone(),
            _ => return Err(LuksError::NoPassphrase(self.name.clone()).into()),
        };

        let device = self.inner.materialize(ctx, root)?;

        if self.needs_format {
            luks::format(ctx, &device, &passphrase)?;
            self.needs_format = false;
        }

        let mapped = luks::open(ctx, &device, &self.name, &passphrase)?;
        ctx.mark_active(&mapped);
        Ok(mapped)
    }

    pub(super) fn teardown(&mut self, ctx: &StorageContext) -> Result<()> {
        let mapped = self.mapped_path();
        if ctx.is_active(&mapped) {
            luks::close(ctx, &self.name)?;
            ctx.mark_inactive(&mapped);
        }

        self.inner.teardown(ctx)
    }
}
