// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use crate::arch::Platform;
use crate::command::{CommandRunner, SystemRunner};
use crate::config::StorageConfig;
use crate::fs_types::FilesystemTypeRegistry;
use crate::lvm::LvmState;
use crate::raid::MinorTable;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Process-wide storage state, created once at startup and passed by reference.
pub struct StorageContext {
    pub config: StorageConfig,
    pub platform: Platform,
    pub registry: FilesystemTypeRegistry,
    pub minors: MinorTable,
    pub lvm: LvmState,
    runner: Arc<dyn CommandRunner>,
    active: Mutex<BTreeSet<PathBuf>>,
}

impl StorageContext {
    /// Detects the platform, probes for LVM, and runs real tools.
    pub fn new(config: StorageConfig) -> Self {
        let platform = Platform::detect(&config);
        let lvm = LvmState::probe(&config.lvm_conf_dir);
        let runner = Arc::new(SystemRunner::new(config.log_dir.clone()));

        Self::with_runner(config, platform, runner, lvm)
    }

    pub fn with_runner(
        config: StorageConfig,
        platform: Platform,
        runner: Arc<dyn CommandRunner>,
        lvm: LvmState,
    ) -> Self {
        Self {
            config,
            platform,
            registry: FilesystemTypeRegistry::builtin(),
            minors: MinorTable::default(),
            lvm,
            runner,
            active: Mutex::new(BTreeSet::new()),
        }
    }

    /// Replaces the filesystem catalog, which tests use to pin kernel support.
    pub fn registry(mut self, registry: FilesystemTypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        &*self.runner
    }

    pub fn root_path(&self) -> &Path {
        &self.config.root_path
    }

    /// Installed memory, unless overridden by the configuration.
    pub fn memory_mb(&self) -> u64 {
        if let Some(memory) = self.config.memory_mb {
            return memory;
        }

        match std::fs::read_to_string("/proc/meminfo") {
            Ok(meminfo) => parse_mem_total(&meminfo).unwrap_or(0),
            Err(why) => {
                tracing::warn!("unable to read /proc/meminfo: {}", why);
                0
            }
        }
    }

    fn active(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records that `path` has been materialized by this process.
    pub fn mark_active(&self, path: &Path) {
        self.active().insert(path.to_path_buf());
    }

    pub fn mark_inactive(&self, path: &Path) {
        self.active().remove(path);
    }

    pub fn is_active(&self, path: &Path) -> bool {
        self.active().contains(path)
    }
}

/// `MemTotal` of `/proc/meminfo`, in megabytes.
fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kb / 1024)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::arch::Arch;
    use crate::command::testing::RecordingRunner;
    use crate::fs_types::KernelFilesystems;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SCRATCH: AtomicUsize = AtomicUsize::new(0);

    /// A unique, empty directory beneath the system temp dir.
    pub fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "storage-core-{}-{}-{}",
            tag,
            std::process::id(),
            SCRATCH.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// An x86_64 BIOS context whose tools are recorded instead of executed.
    pub fn context(runner: Arc<RecordingRunner>) -> StorageContext {
        context_on(runner, Platform::new(Arch::X86_64))
    }

    pub fn context_on(runner: Arc<RecordingRunner>, platform: Platform) -> StorageContext {
        let scratch = scratch_dir("ctx");
        let config = StorageConfig {
            log_dir: scratch.clone(),
            root_path: scratch.join("sysimage"),
            probe_dir: scratch.join("probe"),
            lvm_conf_dir: scratch.join("lvm"),
            memory_mb: Some(4096),
            ..StorageConfig::default()
        };

        let lvm = LvmState::assume(true, &config.lvm_conf_dir);
        let kernel = KernelFilesystems::preset(vec![
            "ext2", "ext3", "ext4", "xfs", "jfs", "vfat", "proc", "sysfs", "devpts", "tmpfs",
        ]);

        StorageContext::with_runner(config, platform, runner, lvm)
            .registry(FilesystemTypeRegistry::with_kernel(kernel))
    }
}
