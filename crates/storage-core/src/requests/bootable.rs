// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Which requests the boot loader depends upon, per platform.

use super::{Partitions, RequestSpec};
use crate::arch::{Arch, Platform, PpcMachine};

const PREP_KIND: &str = "PPC PReP Boot";
const BOOTSTRAP_KIND: &str = "Apple Bootstrap";

/// Mountpoints which may hold the files the boot loader reads, best first.
pub fn bootable_mountpoints(platform: &Platform) -> &'static [&'static str] {
    if platform.arch == Arch::Ia64 {
        &["/boot/efi"]
    } else {
        &["/boot", "/"]
    }
}

impl Partitions {
    /// Ids of the requests that must be bootable on `platform`, in the order the
    /// boot loader needs them. Empty if none has been defined yet.
    pub fn bootable_request(&self, platform: &Platform) -> Vec<u32> {
        if platform.efi {
            return ids(self.by_mountpoint("/boot/efi"));
        }

        match platform.ppc_machine {
            Some(PpcMachine::ISeries) => ids(self.of_kind(PREP_KIND).into_iter().take(1)),
            Some(PpcMachine::PSeries) => {
                let mut bootable = self.of_kind(PREP_KIND);
                bootable.extend(self.boot_filesystem());
                ids(bootable)
            }
            Some(PpcMachine::PMac) => {
                let bootstraps = self.of_kind(BOOTSTRAP_KIND);
                let best = bootstraps
                    .iter()
                    .find(|request| !request.preexist)
                    .or_else(|| bootstraps.first())
                    .copied();

                let mut bootable: Vec<&RequestSpec> = best.into_iter().collect();
                bootable.extend(self.boot_filesystem());
                ids(bootable)
            }
            None => ids(self.boot_filesystem()),
        }
    }

    fn of_kind(&self, kind: &str) -> Vec<&RequestSpec> {
        self.requests()
            .iter()
            .filter(|request| request.fstype == kind)
            .collect()
    }

    /// `/boot`, falling back to `/`.
    fn boot_filesystem(&self) -> Option<&RequestSpec> {
        self.by_mountpoint("/boot").or_else(|| self.by_mountpoint("/"))
    }
}

fn ids<'a>(requests: impl IntoIterator<Item = &'a RequestSpec>) -> Vec<u32> {
    requests.into_iter().filter_map(|r| r.unique_id).collect()
}
