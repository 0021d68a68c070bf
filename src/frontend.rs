// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: GPL-3.0-only

use crate::{EncryptedDevice, Findings, OsInfo, Request};
use postage::mpsc::Sender;
use postage::prelude::*;
use zbus::SignalContext;

/// DBus frontend which accepts requests and passes them on to the background.
pub struct Frontend {
    pub sender: Sender<Request>,
}

impl Frontend {
    async fn request(&mut self, request: Request) {
        if self.sender.send(request).await.is_err() {
            tracing::error!("storage backend is no longer receiving requests");
        }
    }
}

#[dbus_interface(name = "com.system76.DistinstStorage")]
impl Frontend {
    /// Request to decrypt the device whose filesystem UUID is `device`, using `key`.
    async fn decrypt(&mut self, device: String, key: String) -> zbus::fdo::Result<()> {
        tracing::info!("decrypting {}", device);
        self.request(Request::Decrypt { device, key }).await;
        Ok(())
    }

    #[dbus_interface(signal)]
    pub async fn decrypt_err(ctx: &SignalContext<'_>, why: String) -> zbus::Result<()>;

    #[dbus_interface(signal)]
    pub async fn decrypt_ok(ctx: &SignalContext<'_>) -> zbus::Result<()>;

    /// Initiate a rescan of disk information.
    async fn disk_rescan(&mut self) -> zbus::fdo::Result<()> {
        tracing::info!("disk rescan");
        self.request(Request::DiskRescan).await;
        Ok(())
    }

    #[dbus_interface(signal)]
    pub async fn disk_rescan_complete(ctx: &SignalContext<'_>) -> zbus::Result<()>;

    /// Initiate search for locked encrypted devices.
    async fn encrypted_devices(&mut self) -> zbus::fdo::Result<()> {
        tracing::info!("fetching encrypted devices");
        self.request(Request::EncryptedDevices).await;
        Ok(())
    }

    #[dbus_interface(signal)]
    pub async fn encrypted_devices_ok(
        ctx: &SignalContext<'_>,
        devices: Vec<EncryptedDevice>,
    ) -> zbus::Result<()>;

    /// Initiate a search for installed systems which may be upgraded.
    async fn existing_roots(&mut self) -> zbus::fdo::Result<()> {
        tracing::info!("searching for existing root filesystems");
        self.request(Request::ExistingRoots).await;
        Ok(())
    }

    #[dbus_interface(signal)]
    pub async fn existing_roots_ok(ctx: &SignalContext<'_>, roots: Vec<OsInfo>) -> zbus::Result<()>;

    /// Describe the storage found on disk, rebuilding the requests from it.
    async fn layout(&mut self) -> zbus::fdo::Result<()> {
        tracing::info!("fetching disk layout");
        self.request(Request::Layout).await;
        Ok(())
    }

    #[dbus_interface(signal)]
    pub async fn layout_err(ctx: &SignalContext<'_>, why: String) -> zbus::Result<()>;

    #[dbus_interface(signal)]
    pub async fn layout_ok(ctx: &SignalContext<'_>, layout: String) -> zbus::Result<()>;

    /// Validate the current requests.
    async fn sanity_check(&mut self) -> zbus::fdo::Result<()> {
        tracing::info!("checking storage requests");
        self.request(Request::SanityCheck).await;
        Ok(())
    }

    #[dbus_interface(signal)]
    pub async fn sanity_check_err(ctx: &SignalContext<'_>, why: String) -> zbus::Result<()>;

    #[dbus_interface(signal)]
    pub async fn sanity_check_ok(ctx: &SignalContext<'_>, findings: Findings) -> zbus::Result<()>;
}
