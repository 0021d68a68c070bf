// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! LVM tooling and physical-extent arithmetic.

use crate::command::{run_checked, ToolCommand, ToolOutput};
use crate::context::StorageContext;
use crate::errors::{OperationError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Extent size used when a request does not specify one.
pub const DEFAULT_PE_SIZE_KB: u64 = 32 * 1024;
pub const MIN_PE_SIZE_KB: u64 = 8;
pub const MAX_PE_SIZE_KB: u64 = 16 * 1024 * 1024;

const PERMISSIVE_CONFIG: &str = "devices {\n    filter = [ \"a/.*/\" ]\n}\n";

/// Usable size of a physical volume, in MB, after LVM metadata has been reserved.
///
/// Every extent costs four bytes of metadata on top of a 128KB floor. The larger
/// of one extent plus overhead and twice the overhead is reserved, and what remains
/// is rounded down to an extent boundary.
pub fn clamp_pv_size(size_mb: u64, pe_kb: u64) -> u64 {
    if pe_kb == 0 {
        return 0;
    }

    let size_kb = size_mb.saturating_mul(1024);
    let extents = (size_kb / pe_kb) as f64;
    let overhead = 4.0 * extents / 1024.0 + 128.0;
    let reserved = (pe_kb as f64 + overhead).max(2.0 * overhead).ceil() as u64;

    (size_kb.saturating_sub(reserved) / pe_kb) * pe_kb / 1024
}

/// Rounds a requested LV size to a whole number of extents.
pub fn clamp_lv_size_request(size_mb: u64, pe_kb: u64, round_up: bool) -> u64 {
    if pe_kb == 0 {
        return size_mb;
    }

    let size_kb = size_mb.saturating_mul(1024);
    let extents = if round_up {
        (size_kb + pe_kb - 1) / pe_kb
    } else {
        size_kb / pe_kb
    };

    extents * pe_kb / 1024
}

/// Largest logical volume, in MB, addressable with extents of `pe_kb`.
pub fn get_max_lv_size(pe_kb: u64) -> u64 {
    pe_kb * 64
}

pub fn is_valid_pe_size(pe_kb: u64) -> bool {
    pe_kb.is_power_of_two() && (MIN_PE_SIZE_KB..=MAX_PE_SIZE_KB).contains(&pe_kb)
}

/// Every extent size LVM accepts, smallest first.
pub fn possible_pe_sizes() -> impl Iterator<Item = u64> {
    (3..=24).map(|shift| 1u64 << shift)
}

fn check_name(name: &str, reserved: &[&str]) -> Option<String> {
    if name.is_empty() {
        return Some("Please enter a name.".into());
    }

    if name.len() > 128 {
        return Some(format!("The name '{}' is too long.", name));
    }

    if name == "." || name == ".." || name.starts_with('-') || reserved.contains(&name) {
        return Some(format!("The name '{}' is reserved.", name));
    }

    let legal = |c: char| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-');
    if !name.chars().all(legal) {
        return Some(format!("The name '{}' contains illegal characters.", name));
    }

    None
}

pub fn check_vg_name(name: &str) -> Option<String> {
    check_name(name, &["lvm", "root"])
}

pub fn check_lv_name(name: &str) -> Option<String> {
    check_name(name, &["group"])
        .or_else(|| {
            ["snapshot", "pvmove"]
                .iter()
                .find(|prefix| name.starts_with(*prefix))
                .map(|_| format!("The name '{}' is reserved.", name))
        })
}

/// Presence of the device mapper and the `lvm` executable, probed once.
#[derive(Debug)]
pub struct LvmState {
    present: bool,
    conf_dir: PathBuf,
}

impl LvmState {
    pub fn probe(conf_dir: &Path) -> Self {
        let module = fs::read_to_string("/proc/modules")
            .map(|modules| modules.lines().any(|line| line.starts_with("dm_mod ")))
            .unwrap_or(false);

        let misc = fs::read_to_string("/proc/misc")
            .map(|misc| misc.contains("device-mapper"))
            .unwrap_or(false);

        let present = (module || misc) && which::which("lvm").is_ok();
        if !present {
            tracing::warn!("LVM is not available on this system");
        }

        Self::assume(present, conf_dir)
    }

    pub fn assume(present: bool, conf_dir: &Path) -> Self {
        Self {
            present,
            conf_dir: conf_dir.to_path_buf(),
        }
    }

    pub fn has_lvm(&self) -> bool {
        self.present
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    /// Writes an LVM config that accepts every device, removed when the guard drops.
    pub fn permissive(&self) -> Result<PermissiveConfig> {
        fs::create_dir_all(&self.conf_dir).map_err(|why| OperationError::io(&self.conf_dir, why))?;
        let path = self.conf_dir.join("lvm.conf");
        fs::write(&path, PERMISSIVE_CONFIG).map_err(|why| OperationError::io(&path, why))?;
        Ok(PermissiveConfig { path })
    }
}

pub struct PermissiveConfig {
    path: PathBuf,
}

impl Drop for PermissiveConfig {
    fn drop(&mut self) {
        if let Err(why) = fs::remove_file(&self.path) {
            tracing::warn!("unable to remove {:?}: {}", self.path, why);
        }
    }
}

fn require(ctx: &StorageContext) -> Result<()> {
    if ctx.lvm.has_lvm() {
        Ok(())
    } else {
        Err(OperationError::Invariant("LVM is not available".into()))
    }
}

fn run_lvm<I, S>(ctx: &StorageContext, args: I) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let config = ctx.lvm.permissive()?;
    let command = ToolCommand::new("lvm")
        .args(args)
        .env("LVM_SYSTEM_DIR", ctx.lvm.conf_dir().to_string_lossy());

    let result = run_checked(ctx.runner(), &command);
    drop(config);
    result
}

pub fn pv_create(ctx: &StorageContext, device: &Path) -> Result<()> {
    require(ctx)?;
    tracing::info!("creating LVM PV on {:?}", device);
    let device = device.to_string_lossy();
    run_lvm(ctx, &["pvcreate", "-ff", "-y", "-v", &*device]).map(|_| ())
}

pub fn pv_remove(ctx: &StorageContext, device: &Path) -> Result<()> {
    require(ctx)?;
    tracing::info!("removing LVM PV {:?}", device);
    let device = device.to_string_lossy();
    run_lvm(ctx, &["pvremove", "-ff", "-y", &*device]).map(|_| ())
}

pub fn vg_create(ctx: &StorageContext, name: &str, pe_kb: u64, pvs: &[PathBuf]) -> Result<()> {
    require(ctx)?;
    tracing::info!("creating LVM VG {} from {:?}", name, pvs);

    let mut args = vec![
        "vgcreate".to_owned(),
        "-v".into(),
        "-An".into(),
        "-s".into(),
        format!("{}k", pe_kb),
        name.to_owned(),
    ];
    args.extend(pvs.iter().map(|pv| pv.to_string_lossy().into_owned()));

    run_lvm(ctx, args).map(|_| ())
}

pub fn vg_remove(ctx: &StorageContext, name: &str) -> Result<()> {
    require(ctx)?;
    tracing::info!("removing LVM VG {}", name);
    run_lvm(ctx, &["vgremove", "-v", name]).map(|_| ())
}

pub fn vg_activate(ctx: &StorageContext, name: &str) -> Result<()> {
    require(ctx)?;
    tracing::info!("activating LVM VG {}", name);
    run_lvm(ctx, &["vgchange", "-ay", name]).map(|_| ())
}

pub fn vg_deactivate(ctx: &StorageContext, name: &str) -> Result<()> {
    require(ctx)?;
    tracing::info!("deactivating LVM VG {}", name);
    run_lvm(ctx, &["vgchange", "-an", name]).map(|_| ())
}

/// Scans for and activates every volume group. Absent LVM is not an error here.
pub fn vg_activate_all(ctx: &StorageContext) -> Result<()> {
    if !ctx.lvm.has_lvm() {
        return Ok(());
    }

    tracing::info!("activating all LVM VGs");
    run_lvm(ctx, &["vgscan", "-v"])?;
    run_lvm(ctx, &["vgchange", "-ay"]).map(|_| ())
}

pub fn vg_deactivate_all(ctx: &StorageContext) -> Result<()> {
    if !ctx.lvm.has_lvm() {
        return Ok(());
    }

    tracing::info!("deactivating all LVM VGs");
    run_lvm(ctx, &["vgchange", "-an"]).map(|_| ())
}

pub fn lv_create(ctx: &StorageContext, vg: &str, name: &str, size_mb: u64) -> Result<()> {
    require(ctx)?;
    tracing::info!("creating LVM LV {}/{} of {}M", vg, name, size_mb);
    let size = format!("{}M", size_mb);
    run_lvm(ctx, &["lvcreate", "-v", "-L", &*size, "-n", name, "-An", vg]).map(|_| ())
}

pub fn lv_remove(ctx: &StorageContext, vg: &str, name: &str) -> Result<()> {
    require(ctx)?;
    tracing::info!("removing LVM LV {}/{}", vg, name);
    let path = format!("{}/{}", vg, name);
    run_lvm(ctx, &["lvremove", "-f", &*path]).map(|_| ())
}

pub fn lv_activate(ctx: &StorageContext, vg: &str, name: &str) -> Result<()> {
    require(ctx)?;
    tracing::info!("activating LVM LV {}/{}", vg, name);
    let path = format!("{}/{}", vg, name);
    run_lvm(ctx, &["lvchange", "-ay", &*path]).map(|_| ())
}

pub fn lv_deactivate(ctx: &StorageContext, vg: &str, name: &str) -> Result<()> {
    require(ctx)?;
    tracing::info!("deactivating LVM LV {}/{}", vg, name);
    let path = format!("{}/{}", vg, name);
    run_lvm(ctx, &["lvchange", "-an", &*path]).map(|_| ())
}

const REPORT_ARGS: [&str; 7] = [
    "-C",
    "--noheadings",
    "--units",
    "k",
    "--nosuffix",
    "--separator",
    ":",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvInfo {
    pub device: PathBuf,
    pub vg: Option<String>,
    pub size_kb: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VgInfo {
    pub name: String,
    pub size_kb: u64,
    pub pe_kb: u64,
    pub free_kb: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvInfo {
    pub name: String,
    pub vg: String,
    pub size_kb: u64,
}

fn report(ctx: &StorageContext, command: &str, fields: &str) -> Result<String> {
    if !ctx.lvm.has_lvm() {
        return Ok(String::new());
    }

    let mut args = vec![command];
    args.extend_from_slice(&REPORT_ARGS);
    args.extend_from_slice(&["-o", fields]);
    run_lvm(ctx, args).map(|output| output.stdout)
}

fn kilobytes(field: &str) -> u64 {
    field.trim().parse::<f64>().map(|kb| kb as u64).unwrap_or(0)
}

fn report_rows(output: &str, columns: usize) -> impl Iterator<Item = Vec<&str>> {
    output
        .lines()
        .map(|line| line.trim().split(':').map(str::trim).collect::<Vec<_>>())
        .filter(move |fields| fields.len() >= columns && !fields[0].is_empty())
}

pub fn parse_pvs(output: &str) -> Vec<PvInfo> {
    report_rows(output, 3)
        .map(|fields| PvInfo {
            device: PathBuf::from(fields[0]),
            vg: Some(fields[1]).filter(|vg| !vg.is_empty()).map(String::from),
            size_kb: kilobytes(fields[2]),
        })
        .collect()
}

pub fn parse_vgs(output: &str) -> Vec<VgInfo> {
    report_rows(output, 4)
        .map(|fields| VgInfo {
            name: fields[0].to_owned(),
            size_kb: kilobytes(fields[1]),
            pe_kb: kilobytes(fields[2]),
            free_kb: kilobytes(fields[3]),
        })
        .collect()
}

pub fn parse_lvs(output: &str) -> Vec<LvInfo> {
    report_rows(output, 3)
        .map(|fields| LvInfo {
            name: fields[0].to_owned(),
            vg: fields[1].to_owned(),
            size_kb: kilobytes(fields[2]),
        })
        .collect()
}

pub fn pv_list(ctx: &StorageContext) -> Result<Vec<PvInfo>> {
    report(ctx, "pvdisplay", "pv_name,vg_name,pv_size").map(|out| parse_pvs(&out))
}

pub fn vg_list(ctx: &StorageContext) -> Result<Vec<VgInfo>> {
    report(ctx, "vgdisplay", "vg_name,vg_size,vg_extent_size,vg_free").map(|out| parse_vgs(&out))
}

pub fn lv_list(ctx: &StorageContext) -> Result<Vec<LvInfo>> {
    report(ctx, "lvdisplay", "lv_name,vg_name,lv_size").map(|out| parse_lvs(&out))
}
