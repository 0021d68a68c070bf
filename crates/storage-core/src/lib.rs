// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Storage configuration core of the installer.
//!
//! Disks are probed into a [`DiskSet`], reconstructed into [`RequestSpec`]s held by a
//! [`Partitions`] container, validated with [`Partitions::sanity_check_all_requests`],
//! turned into [`Device`]s, and finally formatted and mounted through a [`FileSystemSet`].

#[macro_use]
extern crate serde;
#[macro_use]
extern crate thiserror;

use qcell::{TCell, TCellOwner};

pub mod alloc;
pub mod arch;
mod block_types;
pub mod command;
pub mod config;
mod context;
pub mod devices;
pub mod diskset;
pub mod dmraid;
mod errors;
pub mod fs_types;
pub mod fsset;
pub mod interface;
pub mod luks;
pub mod lvm;
pub mod os_probe;
pub mod raid;
pub mod requests;
pub mod table;
mod udev;

pub struct CellMarker;

pub type ACell<T> = TCell<CellMarker, T>;
pub type ACellOwner = TCellOwner<CellMarker>;

pub use self::arch::{Arch, Platform, PpcMachine};
pub use self::block_types::*;
pub use self::command::{CommandRunner, SystemRunner, ToolCommand, ToolOutput};
pub use self::config::StorageConfig;
pub use self::context::StorageContext;
pub use self::devices::Device;
pub use self::diskset::{DiskSet, EncryptedDevice};
pub use self::errors::*;
pub use self::fs_types::{FilesystemType, FilesystemTypeRegistry};
pub use self::fsset::{FileSystemSet, FileSystemSetEntry, LabelFactory};
pub use self::interface::{Headless, Interface, MessageKind};
pub use self::os_probe::ExistingRoot;
pub use self::raid::RaidLevel;
pub use self::requests::{
    DeleteRequest, DiskLayout, Partitions, RequestKind, RequestSpec, SanityEnv, SanityReport,
};
pub use self::table::{DiskTable, PartitionTable};
pub use self::udev::*;

/// Size of a megabyte, in bytes.
pub const MEGABYTE: u64 = 1024 * 1024;
