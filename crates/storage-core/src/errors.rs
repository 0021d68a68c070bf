// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use crate::raid::RaidLevel;
use std::fmt;
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, OperationError>;

/// Failures of tool invocations, IO, and broken invariants. These always abort
/// the operation that raised them.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("failed to execute {program}: {why}")]
    Spawn { program: String, why: String },
    #[error("{program} exited with status {status}: {stderr}")]
    Command {
        program: String,
        status: i32,
        stderr: String,
    },
    #[error("I/O error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        why: io::Error,
    },
    #[error("failed to mount {device} at {target:?}")]
    Mount {
        device: String,
        target: PathBuf,
        #[source]
        why: io::Error,
    },
    #[error("failed to unmount {target:?}")]
    Unmount {
        target: PathBuf,
        #[source]
        why: io::Error,
    },
    #[error("request {0} does not exist")]
    DanglingReference(u32),
    #[error("request {0} is built on itself")]
    Cycle(u32),
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Luks(#[from] LuksError),
    #[error("{device} contains {count} bad blocks")]
    BadBlocks { device: String, count: u64 },
    #[error("{0} is not a known block device")]
    UnknownDevice(String),
    #[error("{device} has not been materialized")]
    NotMaterialized { device: String },
    #[error("RAID minor {0} is unavailable")]
    MinorUnavailable(u32),
    #[error("partition table on {device} could not be processed: {why}")]
    Table { device: String, why: String },
    #[error("partition allocation failed: {0}")]
    Allocation(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("the previous layout no longer validates: {0}")]
    RollbackInconsistent(ValidationError),
    #[error("operation was cancelled by the user")]
    Cancelled,
}

impl OperationError {
    pub(crate) fn io(path: impl Into<PathBuf>, why: io::Error) -> Self {
        OperationError::Io {
            path: path.into(),
            why,
        }
    }
}

/// A named registry entry could not be located.
#[derive(Debug, Error)]
#[error("{0} is not a registered filesystem type")]
pub struct NotFoundError(pub String);

/// Too few members remain to build the requested array.
#[derive(Debug, Error)]
#[error("cannot assemble {device}: {level} requires {required} active members, but {available} are available")]
pub struct AssemblyError {
    pub device: String,
    pub level: RaidLevel,
    pub required: usize,
    pub available: usize,
}

#[derive(Debug, Error)]
pub enum LuksError {
    #[error("no passphrase has been set for {0}")]
    NoPassphrase(String),
    #[error("the passphrase for {0} is incorrect")]
    WrongPassphrase(String),
    #[error("{0} is already mapped or busy")]
    DeviceBusy(String),
    #[error("cryptsetup failed on {device} with status {status}")]
    Command { device: String, status: i32 },
}

/// A sanity-check finding. It is returned to the caller, who decides whether it
/// blocks completion or only needs confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        ValidationError(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ValidationError {
    fn from(message: String) -> Self {
        ValidationError(message)
    }
}
