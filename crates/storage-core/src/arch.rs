// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Target platform detection, which drives the boot placement rules.

use crate::config::StorageConfig;
use crate::table::PartitionTable;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    X86,
    X86_64,
    Ia64,
    Ppc,
    S390,
    Alpha,
    Sparc,
    Other,
}

impl Arch {
    pub fn parse(name: &str) -> Arch {
        match name {
            "i386" | "i486" | "i586" | "i686" | "x86" => Arch::X86,
            "x86_64" | "amd64" => Arch::X86_64,
            "ia64" => Arch::Ia64,
            "ppc" | "ppc64" | "powerpc" | "powerpc64" => Arch::Ppc,
            "s390" | "s390x" => Arch::S390,
            "alpha" => Arch::Alpha,
            "sparc" | "sparc64" => Arch::Sparc,
            _ => Arch::Other,
        }
    }

    pub fn current() -> Arch {
        Arch::parse(std::env::consts::ARCH)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PpcMachine {
    PSeries,
    ISeries,
    /// NewWorld Apple hardware.
    PMac,
}

impl PpcMachine {
    pub fn parse(name: &str) -> Option<PpcMachine> {
        match name {
            "pSeries" => Some(PpcMachine::PSeries),
            "iSeries" => Some(PpcMachine::ISeries),
            "PMac" | "NewWorld" => Some(PpcMachine::PMac),
            _ => None,
        }
    }
}

/// The machine being installed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub arch: Arch,
    pub efi: bool,
    pub ppc_machine: Option<PpcMachine>,
}

impl Platform {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            efi: arch == Arch::Ia64,
            ppc_machine: None,
        }
    }

    pub fn efi(mut self, efi: bool) -> Self {
        self.efi = efi || self.arch == Arch::Ia64;
        self
    }

    pub fn ppc(machine: PpcMachine) -> Self {
        Self {
            arch: Arch::Ppc,
            efi: false,
            ppc_machine: Some(machine),
        }
    }

    pub fn detect(config: &StorageConfig) -> Self {
        let arch = config
            .arch
            .as_deref()
            .map(Arch::parse)
            .unwrap_or_else(Arch::current);

        let efi = config
            .efi
            .unwrap_or_else(|| Path::new("/sys/firmware/efi").exists());

        let ppc_machine = if arch == Arch::Ppc {
            config
                .ppc_machine
                .as_deref()
                .and_then(PpcMachine::parse)
                .or(Some(PpcMachine::PSeries))
        } else {
            None
        };

        Platform {
            arch,
            efi: efi || arch == Arch::Ia64,
            ppc_machine,
        }
    }

    /// Architectures whose boot loader can read a mirrored `/boot`.
    pub fn raid_boot_capable(&self) -> bool {
        matches!(self.arch, Arch::X86 | Arch::X86_64 | Arch::Ppc)
    }

    /// Name of the filesystem kind that must hold the boot loader, if any.
    pub fn boot_loader_kind(&self) -> Option<&'static str> {
        if self.efi {
            return Some("efi");
        }

        match self.ppc_machine {
            Some(PpcMachine::PSeries) | Some(PpcMachine::ISeries) => Some("PPC PReP Boot"),
            Some(PpcMachine::PMac) => Some("Apple Bootstrap"),
            None => None,
        }
    }

    /// Label written to disks which have to be initialized.
    pub fn default_table(&self) -> PartitionTable {
        if self.efi || self.ppc_machine == Some(PpcMachine::PMac) {
            PartitionTable::Gpt
        } else {
            PartitionTable::Mbr
        }
    }

    pub fn is_bios_x86(&self) -> bool {
        !self.efi && matches!(self.arch, Arch::X86 | Arch::X86_64)
    }
}
