// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! `cryptsetup` invocations. Passphrases are only ever written to the child's stdin.

use crate::command::{ToolCommand, ToolOutput};
use crate::context::StorageContext;
use crate::errors::{LuksError, Result};
use secstr::SecStr;
use std::path::{Path, PathBuf};

/// `cryptsetup` exit status for a passphrase which unlocked no key slot.
const EXIT_WRONG_PASSPHRASE: i32 = 2;
/// `cryptsetup` exit status for a device which is already in use.
const EXIT_BUSY: i32 = 5;

pub fn mapper_path(name: &str) -> PathBuf {
    Path::new("/dev/mapper").join(name)
}

fn cryptsetup(ctx: &StorageContext, command: ToolCommand) -> Result<ToolOutput> {
    ctx.runner().run(&command)
}

fn classify(device: &Path, output: &ToolOutput) -> LuksError {
    let device = device.display().to_string();
    match output.status {
        EXIT_WRONG_PASSPHRASE => LuksError::WrongPassphrase(device),
        EXIT_BUSY => LuksError::DeviceBusy(device),
        status => LuksError::Command { device, status },
    }
}

pub fn is_luks(ctx: &StorageContext, device: &Path) -> Result<bool> {
    let output = cryptsetup(ctx, ToolCommand::new("cryptsetup").arg("isLuks").path_arg(device))?;
    Ok(output.success())
}

/// Whether a mapping named `name` is active.
pub fn status(ctx: &StorageContext, name: &str) -> Result<bool> {
    let output = cryptsetup(ctx, ToolCommand::new("cryptsetup").args(&["status", name]))?;
    Ok(output.success())
}

pub fn format(ctx: &StorageContext, device: &Path, passphrase: &SecStr) -> Result<()> {
    tracing::info!("creating LUKS device on {:?}", device);

    let command = ToolCommand::new("cryptsetup")
        .args(&["-q", "luksFormat"])
        .path_arg(device)
        .secret(passphrase);

    let output = cryptsetup(ctx, command)?;
    if output.success() {
        Ok(())
    } else {
        Err(classify(device, &output).into())
    }
}

/// Maps `device` to `/dev/mapper/<name>`, returning the mapped path.
pub fn open(ctx: &StorageContext, device: &Path, name: &str, passphrase: &SecStr) -> Result<PathBuf> {
    tracing::info!("activating LUKS device {:?}, with DM_NAME of {}", device, name);

    let mapped = mapper_path(name);
    if mapped.exists() {
        return Err(LuksError::DeviceBusy(device.display().to_string()).into());
    }

    let command = ToolCommand::new("cryptsetup")
        .arg("luksOpen")
        .path_arg(device)
        .arg(name)
        .secret(passphrase);

    let output = cryptsetup(ctx, command)?;
    if output.success() {
        Ok(mapped)
    } else {
        Err(classify(device, &output).into())
    }
}

pub fn close(ctx: &StorageContext, name: &str) -> Result<()> {
    tracing::info!("deactivating LUKS mapping {}", name);

    let output = cryptsetup(ctx, ToolCommand::new("cryptsetup").args(&["luksClose", name]))?;
    if output.success() {
        Ok(())
    } else {
        Err(classify(&mapper_path(name), &output).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::context::testing::context;
    use crate::errors::OperationError;
    use std::sync::Arc;

    #[test]
    fn open_distinguishes_failures() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("cryptsetup luksOpen", EXIT_WRONG_PASSPHRASE, "");
        runner.respond("cryptsetup luksOpen", EXIT_BUSY, "");
        runner.respond("cryptsetup luksOpen", 1, "");
        let ctx = context(runner.clone());

        let secret = SecStr::from("correct horse");
        let device = Path::new("/dev/sda3");

        match open(&ctx, device, "luks-test-sda3", &secret) {
            Err(OperationError::Luks(LuksError::WrongPassphrase(_))) => (),
            other => panic!("expected a wrong passphrase, got {:?}", other),
        }

        match open(&ctx, device, "luks-test-sda3", &secret) {
            Err(OperationError::Luks(LuksError::DeviceBusy(_))) => (),
            other => panic!("expected a busy device, got {:?}", other),
        }

        match open(&ctx, device, "luks-test-sda3", &secret) {
            Err(OperationError::Luks(LuksError::Command { status: 1, .. })) => (),
            other => panic!("expected a command failure, got {:?}", other),
        }

        let mapped = open(&ctx, device, "luks-test-sda3", &secret).unwrap();
        assert_eq!(mapped, PathBuf::from("/dev/mapper/luks-test-sda3"));

        for call in runner.calls() {
            assert!(!call.line.contains("correct horse"));
            assert_eq!(call.stdin.as_deref(), Some(&b"correct horse\n"[..]));
        }
    }
}
