// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: GPL-3.0-only

#[macro_use]
extern crate fomat_macros;

use pop_storage_core::*;

fn main() {
    let ctx = StorageContext::new(StorageConfig::load());
    let mut udev = UDev::new().unwrap();
    let mut t = ACellOwner::new();

    let mut disks = DiskSet::new();
    disks.reload(&mut udev, &mut t).unwrap();
    disks.open_devices(&ctx, &Headless { answer: false }, &t).unwrap();

    let mut partitions = Partitions::new();
    partitions
        .set_from_disk(&disks.layout(&ctx, &t).unwrap(), &ctx.registry)
        .unwrap();

    let report = partitions.sanity_check_all_requests(&disks.sanity_env(&ctx));

    pintln!(
        "Platform: " [ctx.platform] "\n"
        "Memory: " (ctx.memory_mb()) " MB"
    );

    for error in &report.errors {
        pintln!("error: " (error));
    }

    for warning in &report.warnings {
        pintln!("warning: " (warning));
    }

    if report.is_clean() {
        pintln!("The existing layout is a valid installation target.");
    }
}
