// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use super::Device;
use crate::context::StorageContext;
use crate::errors::{AssemblyError, Result};
use crate::raid::{self, CreateArgs, RaidLevel};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct RaidDevice {
    pub minor: u32,
    pub level: RaidLevel,
    pub members: Vec<Device>,
    pub spares: usize,
    pub chunk_kb: Option<u64>,
    /// Reassemble instead of creating.
    pub existing: bool,
}

impl RaidDevice {
    pub fn new(
        minor: u32,
        level: RaidLevel,
        members: Vec<Device>,
        spares: usize,
        chunk_kb: Option<u64>,
        existing: bool,
    ) -> Self {
        Self {
            minor,
            level,
            members,
            spares,
            chunk_kb,
            existing,
        }
    }

    pub fn path(&self) -> PathBuf {
        raid::md_path(self.minor)
    }

    pub(super) fn materialize(&mut self, ctx: &StorageContext, root: &Path) -> Result<PathBuf> {
        let path = self.path();
        if ctx.is_active(&path) {
            return Ok(path);
        }

        let mut available = Vec::with_capacity(self.members.len());
        for member in &mut self.members {
            match member.materialize(ctx, root) {
                Ok(member) => available.push(member),
                Err(why) => tracing::warn!("{:?}: member unavailable: {}", path, why),
            }
        }

        // Only an existing array may come up degraded.
        let required = if self.existing {
            self.level.required_active(self.members.len())
        } else {
            self.members.len().max(self.level.min_members() + self.spares)
        };

        if available.len() < required {
            return Err(AssemblyError {
                device: path.display().to_string(),
                level: self.level,
                required,
                available: available.len(),
            }
            .into());
        }

        let claimed = !ctx.minors.in_use(self.minor);
        if claimed {
            ctx.minors.reserve(self.minor)?;
        }

        let result = if self.existing {
            raid::assemble(ctx, &path, &available)
        } else {
            raid::create(
                ctx,
                CreateArgs {
                    device: &path,
                    level: self.level,
                    chunk_kb: self.chunk_kb,
                    members: &available,
                    spares: self.spares,
                },
            )
        };

        if let Err(why) = result {
            if claimed {
                ctx.minors.release(self.minor);
            }
            return Err(why);
        }

        self.existing = true;
        ctx.mark_active(&path);
        Ok(path)
    }

    pub(super) fn teardown(&mut self, ctx: &StorageContext) -> Result<()> {
        let path = self.path();
        if ctx.is_active(&path) {
            raid::stop(ctx, &path)?;
            ctx.mark_inactive(&path);
            ctx.minors.release(self.minor);
        }

        for member in &mut self.members {
            member.teardown(ctx)?;
        }

        Ok(())
    }
}
