// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Installer-wide storage settings, read from an env-style file.

use envfile::EnvFile;
use std::io;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH: &str = "/etc/distinst/storage.conf";

#[derive(Clone, Debug, PartialEq)]
pub struct StorageConfig {
    /// Overrides the architecture detected at compile time.
    pub arch: Option<String>,
    pub ppc_machine: Option<String>,
    /// Overrides the presence of `/sys/firmware/efi`.
    pub efi: Option<bool>,
    pub interactive: bool,
    /// Relabel disks with unreadable tables without asking.
    pub initialize_all: bool,
    pub log_dir: PathBuf,
    pub root_path: PathBuf,
    pub probe_dir: PathBuf,
    pub lvm_conf_dir: PathBuf,
    /// Devices which hold the installation media.
    pub protected: Vec<String>,
    pub memory_mb: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            arch: None,
            ppc_machine: None,
            efi: None,
            interactive: true,
            initialize_all: false,
            log_dir: PathBuf::from("/tmp"),
            root_path: PathBuf::from("/mnt/sysimage"),
            probe_dir: PathBuf::from("/tmp/distinst_root_probe"),
            lvm_conf_dir: PathBuf::from("/tmp/lvm"),
            protected: Vec::new(),
            memory_mb: None,
        }
    }
}

impl StorageConfig {
    /// Reads the configuration from the default location, falling back to defaults.
    pub fn load() -> Self {
        match Self::from_path(Path::new(CONFIG_PATH)) {
            Ok(config) => config,
            Err(why) => {
                tracing::debug!("using default storage configuration: {}", why);
                Self::default()
            }
        }
    }

    pub fn from_path(path: &Path) -> io::Result<Self> {
        let env = EnvFile::new(path)?;
        Ok(Self::from_lookup(|key| env.get(key)))
    }

    /// Builds a configuration from any key lookup, starting from the defaults.
    pub fn from_lookup<'a, F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let mut config = Self::default();

        let flag = |key: &str| get(key).map(|value| matches!(value, "1" | "true" | "yes"));

        config.arch = get("ARCH").map(String::from);
        config.ppc_machine = get("PPC_MACHINE").map(String::from);
        config.efi = flag("EFI");

        if let Some(interactive) = flag("INTERACTIVE") {
            config.interactive = interactive;
        }

        if let Some(initialize) = flag("INITIALIZE_ALL") {
            config.initialize_all = initialize;
        }

        if let Some(dir) = get("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        if let Some(root) = get("ROOT_PATH") {
            config.root_path = PathBuf::from(root);
        }

        if let Some(dir) = get("PROBE_DIR") {
            config.probe_dir = PathBuf::from(dir);
        }

        if let Some(dir) = get("LVM_CONF_DIR") {
            config.lvm_conf_dir = PathBuf::from(dir);
        }

        if let Some(devices) = get("PROTECTED") {
            config.protected = devices.split_whitespace().map(String::from).collect();
        }

        config.memory_mb = get("MEMORY_MB").and_then(|value| value.parse::<u64>().ok());

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn keys_override_defaults() {
        let mut store = BTreeMap::new();
        store.insert("ARCH", "ppc");
        store.insert("PPC_MACHINE", "pSeries");
        store.insert("INTERACTIVE", "0");
        store.insert("INITIALIZE_ALL", "1");
        store.insert("PROTECTED", "sr0 sdb1");
        store.insert("MEMORY_MB", "4096");

        let config = StorageConfig::from_lookup(|key| store.get(key).copied());

        assert_eq!(config.arch.as_deref(), Some("ppc"));
        assert_eq!(config.ppc_machine.as_deref(), Some("pSeries"));
        assert!(!config.interactive);
        assert!(config.initialize_all);
        assert_eq!(config.protected, vec!["sr0".to_owned(), "sdb1".to_owned()]);
        assert_eq!(config.memory_mb, Some(4096));
        assert_eq!(config.root_path, PathBuf::from("/mnt/sysimage"));
    }

    #[test]
    fn missing_keys_keep_defaults() {
        let config = StorageConfig::from_lookup(|_| None);
        assert_eq!(config, StorageConfig::default());
    }
}
