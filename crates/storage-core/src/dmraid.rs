// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Firmware RAID (`dmraid`) and multipath maps, both of which live in the device mapper.

use crate::command::{run_checked, ToolCommand};
use crate::context::StorageContext;
use crate::errors::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Whether the device-mapper control node can be opened.
pub fn has_device_mapper() -> bool {
    devicemapper::DM::new().is_ok()
}

/// Names of every active device map.
pub fn mapped_names() -> Vec<String> {
    let dm = match devicemapper::DM::new() {
        Ok(dm) => dm,
        Err(why) => {
            tracing::debug!("device mapper unavailable: {}", why);
            return Vec::new();
        }
    };

    match dm.list_devices() {
        Ok(devices) => devices.into_iter().map(|(name, _, _)| name.to_string()).collect(),
        Err(why) => {
            tracing::warn!("unable to list device maps: {}", why);
            Vec::new()
        }
    }
}

fn tool_present(program: &str) -> bool {
    which::which(program).is_ok()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmRaidSet {
    pub name: String,
    pub format: String,
    pub kind: String,
    pub status: String,
    pub members: Vec<PathBuf>,
}

impl DmRaidSet {
    pub fn path(&self) -> PathBuf {
        PathBuf::from("/dev/mapper").join(&self.name)
    }
}

/// Parses `dmraid -r -c -c`, which prints `device:format:set:type:status:...` per member.
pub fn parse_sets(output: &str) -> Vec<DmRaidSet> {
    let mut sets: BTreeMap<String, DmRaidSet> = BTreeMap::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.trim().split(':').collect();
        if fields.len() < 5 || !fields[0].starts_with('/') {
            continue;
        }

        let set = sets.entry(fields[2].to_owned()).or_insert_with(|| DmRaidSet {
            name: fields[2].to_owned(),
            format: fields[1].to_owned(),
            kind: fields[3].to_owned(),
            status: fields[4].to_owned(),
            members: Vec::new(),
        });

        set.members.push(PathBuf::from(fields[0]));
    }

    sets.into_values().collect()
}

pub fn scan_sets(ctx: &StorageContext) -> Result<Vec<DmRaidSet>> {
    let output = ctx.runner().run(&ToolCommand::new("dmraid").args(&["-r", "-c", "-c"]))?;

    // dmraid exits non-zero when no firmware RAID disks exist.
    if !output.success() {
        return Ok(Vec::new());
    }

    Ok(parse_sets(&output.stdout))
}

/// Activates every firmware RAID set and returns them.
pub fn start_all(ctx: &StorageContext) -> Result<Vec<DmRaidSet>> {
    if !tool_present("dmraid") {
        return Ok(Vec::new());
    }

    let sets = scan_sets(ctx)?;
    if sets.is_empty() {
        return Ok(sets);
    }

    tracing::info!("activating {} dmraid sets", sets.len());
    run_checked(ctx.runner(), &ToolCommand::new("dmraid").arg("-ay"))?;
    for set in &sets {
        ctx.mark_active(&set.path());
    }

    Ok(sets)
}

pub fn stop_all(ctx: &StorageContext, sets: &[DmRaidSet]) -> Result<()> {
    if sets.is_empty() {
        return Ok(());
    }

    tracing::info!("deactivating {} dmraid sets", sets.len());
    run_checked(ctx.runner(), &ToolCommand::new("dmraid").arg("-an"))?;
    for set in sets {
        ctx.mark_inactive(&set.path());
    }

    Ok(())
}

/// Parses `multipath -l -v1`, one map name per line.
pub fn parse_multipath(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Creates multipath maps and returns their names.
pub fn start_multipath(ctx: &StorageContext) -> Result<Vec<String>> {
    if !tool_present("multipath") {
        return Ok(Vec::new());
    }

    let created = ctx.runner().run(&ToolCommand::new("multipath").arg("-v1"))?;
    if !created.success() {
        tracing::debug!("multipath created no maps");
    }

    let listed = run_checked(ctx.runner(), &ToolCommand::new("multipath").args(&["-l", "-v1"]))?;
    let maps = parse_multipath(&listed.stdout);
    for map in &maps {
        ctx.mark_active(&PathBuf::from("/dev/mapper").join(map));
    }

    Ok(maps)
}

pub fn stop_multipath(ctx: &StorageContext, maps: &[String]) -> Result<()> {
    if maps.is_empty() {
        return Ok(());
    }

    run_checked(ctx.runner(), &ToolCommand::new("multipath").arg("-F"))?;
    for map in maps {
        ctx.mark_inactive(&PathBuf::from("/dev/mapper").join(map));
    }

    Ok(())
}
