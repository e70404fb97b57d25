//! Storage-class memory model: tier configuration, namespaces and mounts.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bdev::Rank;

/// Backing class of the SCM tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScmClass {
    /// Real persistent memory exposed as DAX block devices.
    Dcpm,
    /// tmpfs ramdisk emulation.
    #[default]
    Ram,
}

impl fmt::Display for ScmClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScmClass::Dcpm => write!(f, "dcpm"),
            ScmClass::Ram => write!(f, "ram"),
        }
    }
}

/// The single SCM tier of an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmTierConfig {
    /// Backing class.
    #[serde(default)]
    pub class: ScmClass,
    /// Where the SCM filesystem is mounted.
    pub mountpoint: PathBuf,
    /// Persistent-memory block devices (dcpm only).
    #[serde(default)]
    pub device_list: Vec<String>,
    /// Ramdisk size in bytes (ram only).
    #[serde(default)]
    pub ramdisk_size: Option<u64>,
}

impl ScmTierConfig {
    /// Create a ramdisk tier of the given size.
    pub fn ramdisk(mountpoint: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            class: ScmClass::Ram,
            mountpoint: mountpoint.into(),
            device_list: Vec::new(),
            ramdisk_size: Some(size),
        }
    }

    /// Create a persistent-memory tier over the given devices.
    pub fn dcpm(mountpoint: impl Into<PathBuf>, device_list: Vec<String>) -> Self {
        Self {
            class: ScmClass::Dcpm,
            mountpoint: mountpoint.into(),
            device_list,
            ramdisk_size: None,
        }
    }

    /// True for ramdisk-backed SCM.
    pub fn is_ramdisk(&self) -> bool {
        self.class == ScmClass::Ram
    }
}

/// A mounted SCM filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmMount {
    /// Mountpoint path.
    pub path: PathBuf,
    /// Backing class.
    pub class: ScmClass,
    /// Devices backing the mount.
    pub device_list: Vec<String>,
    /// Owning rank, if an engine is running on it.
    pub rank: Option<Rank>,
    /// Filesystem size in bytes.
    pub total_bytes: u64,
    /// Free bytes in the filesystem.
    pub avail_bytes: u64,
    /// Bytes usable for cluster data; derived by the capacity accountant.
    pub usable_bytes: u64,
}

/// A persistent-memory namespace, or the pseudo-namespace of a ramdisk mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmNamespace {
    /// Namespace UUID (empty for ramdisk).
    pub uuid: String,
    /// Block device name, e.g. `pmem0`.
    pub blockdev: String,
    /// Namespace name, e.g. `namespace0.0`.
    pub name: String,
    /// NUMA node.
    pub numa_node: u32,
    /// Size in bytes.
    pub size: u64,
    /// Mount information, if mounted.
    pub mount: Option<ScmMount>,
}

/// A persistent-memory module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmModule {
    /// Memory channel.
    pub channel_id: u32,
    /// Slot position on the channel.
    pub channel_position: u32,
    /// Memory controller.
    pub controller_id: u32,
    /// CPU socket.
    pub socket_id: u32,
    /// Physical module ID.
    pub physical_id: u32,
    /// Capacity in bytes.
    pub capacity: u64,
}

/// Aggregate state of the SCM modules on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScmState {
    /// Could not be determined.
    #[default]
    Unknown,
    /// No modules present.
    NoModules,
    /// Modules present, regions not yet created.
    NoRegions,
    /// Regions with free capacity for namespaces.
    FreeCapacity,
    /// All capacity allocated to namespaces.
    NoFreeCapacity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramdisk_tier() {
        let tier = ScmTierConfig::ramdisk("/mnt/ferrum0", 16 << 30);
        assert!(tier.is_ramdisk());
        assert_eq!(tier.ramdisk_size, Some(16 << 30));
        assert!(tier.device_list.is_empty());
    }

    #[test]
    fn test_tier_deserialize() {
        let tier: ScmTierConfig = serde_json::from_str(
            r#"{"class": "dcpm", "mountpoint": "/mnt/pmem0", "device_list": ["/dev/pmem0"]}"#,
        )
        .unwrap();
        assert_eq!(tier.class, ScmClass::Dcpm);
        assert!(!tier.is_ramdisk());
        assert_eq!(tier.device_list, vec!["/dev/pmem0".to_string()]);
    }
}
