//! Storage-provider seams.
//!
//! The control plane never talks to device drivers directly. It goes through
//! these traits, which the file, sysfs and ramdisk backends and the mock
//! providers implement.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bdev::{BdevTierConfig, NvmeController};
use crate::error::StorageResult;
use crate::scm::{ScmModule, ScmNamespace, ScmState, ScmTierConfig};

/// Local hardware-probe request for bdevs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdevScanRequest {
    /// Restrict the probe to these addresses; empty probes everything.
    pub device_list: Vec<String>,
}

impl BdevScanRequest {
    /// Probe restricted to the given addresses.
    pub fn for_devices(device_list: Vec<String>) -> Self {
        Self { device_list }
    }
}

/// Local hardware-probe result for bdevs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdevScanResponse {
    /// Discovered controllers.
    pub controllers: Vec<NvmeController>,
}

/// Outcome of formatting one device of a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdevDeviceFormat {
    /// Device address.
    pub address: String,
    /// Error message, if the device failed to format.
    pub error: Option<String>,
}

/// Outcome of formatting one tier, one entry per device in list order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdevFormatResponse {
    /// Per-device results.
    pub devices: Vec<BdevDeviceFormat>,
}

/// Request to bind devices to (or release them from) the user-space driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdevPrepareRequest {
    /// Devices to act on; empty means all.
    pub pci_allow_list: Vec<String>,
    /// User that will own the device files.
    pub target_user: String,
    /// Release devices back to the kernel driver instead of binding.
    pub reset: bool,
    /// 2 MiB hugepages to reserve for the engines; zero leaves the pool alone.
    #[serde(default)]
    pub nr_hugepages: u32,
}

/// Result of a prepare call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdevPrepareResponse {
    /// Devices that were rebound.
    pub prepared: Vec<String>,
    /// Hugepages reserved by the kernel; zero when none were requested.
    #[serde(default)]
    pub nr_hugepages: u32,
}

/// Request to persist an engine's device-local NVMe configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdevWriteConfigRequest {
    /// Engine index the config belongs to.
    pub engine_index: u32,
    /// Where the config file is written.
    pub config_path: PathBuf,
    /// The engine's bdev tiers.
    pub tiers: Vec<BdevTierConfig>,
}

/// Block-device provider.
#[async_trait]
pub trait BdevProvider: Send + Sync {
    /// Probe controllers attached to the node.
    async fn scan(&self, req: &BdevScanRequest) -> StorageResult<BdevScanResponse>;

    /// Format every device of a tier.
    ///
    /// Per-device failures are reported in the response; an `Err` means the
    /// tier as a whole could not be processed.
    async fn format(&self, tier: &BdevTierConfig) -> StorageResult<BdevFormatResponse>;

    /// Bind devices to the user-space driver.
    async fn prepare(&self, req: &BdevPrepareRequest) -> StorageResult<BdevPrepareResponse>;

    /// Persist the device-local configuration consumed by the engine.
    async fn write_config(&self, req: &BdevWriteConfigRequest) -> StorageResult<()>;
}

/// Format state of an SCM tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScmFormatState {
    /// Not mounted or not carrying a filesystem.
    NeedsFormat,
    /// Mounted; `empty` is set when the mount holds no files.
    Formatted {
        /// Mount holds no files.
        empty: bool,
    },
}

/// Size and free space of a mounted filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountUsage {
    /// Filesystem size in bytes.
    pub total_bytes: u64,
    /// Bytes available to unprivileged users.
    pub avail_bytes: u64,
}

/// SCM provider scan output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmScanResult {
    /// Modules.
    pub modules: Vec<ScmModule>,
    /// Namespaces, with mount information where mounted.
    pub namespaces: Vec<ScmNamespace>,
    /// Module state.
    pub state: ScmState,
}

/// Storage-class memory provider.
#[async_trait]
pub trait ScmProvider: Send + Sync {
    /// Discover SCM namespaces. Ramdisk tiers appear as pseudo-namespaces.
    async fn scan(&self, tiers: &[ScmTierConfig]) -> StorageResult<ScmScanResult>;

    /// Determine whether a tier needs formatting.
    async fn check_format(&self, tier: &ScmTierConfig) -> StorageResult<ScmFormatState>;

    /// Create the filesystem and mount it. `force` reformats a mounted tier.
    async fn format(&self, tier: &ScmTierConfig, force: bool) -> StorageResult<()>;

    /// Size and free space of a mountpoint.
    async fn usage(&self, mountpoint: &Path) -> StorageResult<MountUsage>;
}

/// Node memory information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemInfo {
    /// Total system memory in bytes.
    pub total_bytes: u64,
    /// Memory available for new allocations in bytes.
    pub available_bytes: u64,
    /// Configured hugepages.
    pub hugepages_total: u64,
    /// Hugepage size in bytes.
    pub hugepage_size: u64,
}

/// Node-level system facts.
#[async_trait]
pub trait SystemProvider: Send + Sync {
    /// Current memory information.
    async fn mem_info(&self) -> StorageResult<MemInfo>;
}
