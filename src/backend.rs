// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: GPL-3.0-only

use anyhow::Context;
use pop_storage_core::{ACellOwner, DiskSet, Headless, Partitions, StorageContext, UDev};
use secstr::SecStr;

use crate::frontend::Frontend;
use crate::{Device, EncryptedDevice, Findings, OsInfo, Request};
use std::future::Future;
use std::path::Path;
use zbus::{Connection, SignalContext};

/// DBus backend which carries out requests it receives.
pub struct Backend {
    pub ctx: StorageContext,
    pub disks: DiskSet,
    pub partitions: Partitions,
    pub t: ACellOwner,
}

impl Backend {
    /// Performs requests in the background between requests, emitting signals as necessary.
    pub async fn on_event(&mut self, conn: &Connection, event: Request) {
        self.with(conn, |backend, ctx| async move {
            match event {
                Request::Decrypt { device, key } => match backend.decrypt(&device, key) {
                    Ok(()) => Frontend::decrypt_ok(&ctx).await,
                    Err(why) => {
                        tracing::error!("decryption of {} failed: {:#}", device, why);
                        Frontend::decrypt_err(&ctx, format!("{:#}", why)).await
                    }
                },

                Request::DiskRescan => {
                    if let Err(why) = backend.reload() {
                        tracing::error!("disk rescan failed: {:#}", why);
                    }

                    Frontend::disk_rescan_complete(&ctx).await
                }

                Request::EncryptedDevices => {
                    Frontend::encrypted_devices_ok(&ctx, backend.encrypted_devices()).await
                }

                Request::ExistingRoots => {
                    Frontend::existing_roots_ok(&ctx, backend.existing_roots()).await
                }

                Request::Layout => match backend.layout() {
                    Ok(layout) => Frontend::layout_ok(&ctx, layout).await,
                    Err(why) => Frontend::layout_err(&ctx, format!("{:#}", why)).await,
                },

                Request::SanityCheck => match backend.sanity_check() {
                    Ok(findings) => Frontend::sanity_check_ok(&ctx, findings).await,
                    Err(why) => Frontend::sanity_check_err(&ctx, format!("{:#}", why)).await,
                },
            }
        })
        .await;
    }

    /// Unlocks the LUKS device with the filesystem UUID `uuid`.
    pub fn decrypt(&mut self, uuid: &str, key: String) -> anyhow::Result<()> {
        let &mut Self {
            ref ctx,
            ref mut disks,
            ref mut t,
            ..
        } = self;

        let udev = &mut udev_context()?;

        let mut name = String::new();

        loop {
            use rand::Rng;

            name.push_str("crypt-");
            name.extend(
                rand::thread_rng()
                    .sample_iter(&rand::distributions::Alphanumeric)
                    .take(6)
                    .map(char::from),
            );

            if Path::new("/dev/mapper/").join(&name).exists() {
                name.clear();
                continue;
            }

            break;
        }

        let devname = disks
            .inventory
            .by_uuid(uuid, t)
            .map(|device| device.name.clone())
            .context("could not find block device by UUID")?;

        tracing::info!("attempting to decrypt {}", devname);

        let key = SecStr::from(key);
        disks
            .luks_unlock(ctx, &devname, &name, &key, udev, t)
            .context("failed to unlock device")
    }

    pub fn encrypted_devices(&self) -> Vec<EncryptedDevice> {
        self.disks
            .encrypted_devices(&self.t)
            .into_iter()
            .filter(|encrypted| encrypted.mapped.is_none())
            .map(|encrypted| EncryptedDevice {
                device: Device {
                    path: encrypted.device,
                },
                uuid: encrypted.uuid,
            })
            .collect()
    }

    pub fn existing_roots(&self) -> Vec<OsInfo> {
        self.disks
            .find_existing_root_partitions(&self.ctx, &self.t)
            .into_iter()
            .map(|root| OsInfo {
                device: Device { path: root.device },
                name: root.name,
                version: root.version,
            })
            .collect()
    }

    /// Reconstructs the requests from what is on disk, as JSON.
    pub fn layout(&mut self) -> anyhow::Result<String> {
        let interface = Headless { answer: false };

        self.disks
            .open_devices(&self.ctx, &interface, &self.t)
            .context("failed to open disk tables")?;

        let layout = self
            .disks
            .layout(&self.ctx, &self.t)
            .context("failed to describe disk layout")?;

        self.partitions
            .set_from_disk(&layout, &self.ctx.registry)
            .context("failed to reconstruct requests")?;

        serde_json::to_string(&layout).context("failed to serialize disk layout")
    }

    pub fn sanity_check(&mut self) -> anyhow::Result<Findings> {
        if self.partitions.requests().is_empty() {
            self.layout()?;
        }

        let report = self
            .partitions
            .sanity_check_all_requests(&self.disks.sanity_env(&self.ctx));

        Ok(Findings {
            errors: report.errors.into_iter().map(|error| error.0).collect(),
            warnings: report.warnings.into_iter().map(|warning| warning.0).collect(),
        })
    }

    /// Rescans block devices, forgetting tables and requests built from the old scan.
    pub fn reload(&mut self) -> anyhow::Result<()> {
        let mut udev = udev_context()?;
        self.disks.close_devices();
        self.partitions.reset();
        self.disks
            .reload(&mut udev, &mut self.t)
            .context("failed to scan block devices")
    }

    pub async fn with<'a, C, F>(&'a mut self, conn: &Connection, future: C)
    where
        C: FnOnce(&'a mut Self, SignalContext<'a>) -> F + 'a,
        F: Future<Output = zbus::Result<()>> + 'a,
    {
        if let Ok(iface) = conn
            .object_server()
            .interface::<_, Frontend>(crate::IFACE)
            .await
        {
            if let Err(why) = future(self, iface.signal_context().to_owned()).await {
                tracing::error!("dbus backend context error: {:?}", why);
            }
        }
    }
}

fn udev_context() -> anyhow::Result<UDev> {
    let context = libudev::Context::new().context("could not get libudev context")?;

    let mut enumerator =
        libudev::Enumerator::new(&context).context("could not get libudev enumerator")?;

    enumerator
        .match_subsystem("block")
        .context("failed to match block subsystem for libudev enumerator")?;

    Ok(UDev {
        context,
        enumerator,
    })
}
