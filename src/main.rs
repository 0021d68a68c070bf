// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: GPL-3.0-only

#[macro_use]
extern crate zbus;

pub mod backend;
pub mod frontend;
mod logging;

use crate::backend::Backend;
use crate::frontend::Frontend;
use anyhow::Context;
use pop_storage_core::{ACellOwner, DiskSet, Partitions, StorageConfig, StorageContext};
use postage::mpsc;
use postage::prelude::*;
use zbus::ConnectionBuilder;

const IFACE: &str = "/com/system76/DistinstStorage";

fn main() -> anyhow::Result<()> {
    better_panic::install();

    let config = StorageConfig::load();
    let _log_guard = logging::init(&config.log_dir);

    async_io::block_on(async_main(config))
}

async fn async_main(config: StorageConfig) -> anyhow::Result<()> {
    let (sender, mut receiver) = mpsc::channel(2);

    let mut backend = Backend {
        ctx: StorageContext::new(config),
        disks: DiskSet::new(),
        partitions: Partitions::new(),
        t: ACellOwner::new(),
    };

    tracing::info!("storage platform: {:?}", backend.ctx.platform);

    if let Err(why) = backend.disks.start_all(&backend.ctx) {
        tracing::error!("failed to activate RAID and multipath devices: {:#}", why);
    }

    if let Err(why) = backend.reload() {
        tracing::error!("failed to reload disk set: {:#}", why);
    }

    let frontend = Frontend { sender };

    tracing::info!("initiating connection to system");

    let connection = ConnectionBuilder::system()
        .context("failed to create system connection builder")?
        .name("com.system76.DistinstStorage")
        .context("failed to set name for system service")?
        .serve_at(IFACE, frontend)
        .context("failed to serve interface")?
        .build()
        .await
        .context("failed to initialize dbus connection")?;

    tracing::info!("initiated connection");

    let conn = connection.clone();

    // Processes all requests from the DBus frontend.
    while let Some(event) = receiver.recv().await {
        backend.on_event(&conn, event).await;
    }

    if let Err(why) = backend.disks.stop_all(&backend.ctx) {
        tracing::error!("failed to deactivate RAID and multipath devices: {:#}", why);
    }

    Ok(())
}

use serde::{Deserialize, Serialize};
use zvariant::Type;

#[derive(Debug, Type, Serialize, Deserialize)]
pub struct Device {
    pub path: String,
}

#[derive(Debug, Type, Serialize, Deserialize)]
pub struct EncryptedDevice {
    pub device: Device,
    pub uuid: String,
}

#[derive(Debug, Type, Serialize, Deserialize)]
pub struct OsInfo {
    pub device: Device,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Type, Serialize, Deserialize)]
pub struct Findings {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub enum Request {
    Decrypt { device: String, key: String },
    DiskRescan,
    EncryptedDevices,
    ExistingRoots,
    Layout,
    SanityCheck,
}
