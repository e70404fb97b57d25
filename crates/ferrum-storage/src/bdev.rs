//! Block-device (NVMe) model: tier configuration, discovered controllers and
//! per-rank SMD device records.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one storage-engine instance within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rank(pub u32);

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role bitset of an NVMe tier in the metadata-on-SSD layout.
///
/// An empty set is the legacy undivided role, which implies `DATA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BdevRoles(u32);

impl BdevRoles {
    /// Write-ahead-log role.
    pub const WAL: BdevRoles = BdevRoles(1 << 0);
    /// Metadata (index structures) role.
    pub const META: BdevRoles = BdevRoles(1 << 1);
    /// Directly addressable object data role.
    pub const DATA: BdevRoles = BdevRoles(1 << 2);
    /// All roles on one tier.
    pub const ALL: BdevRoles = BdevRoles(0b111);

    /// Legacy undivided role (no bits set).
    pub const fn none() -> Self {
        BdevRoles(0)
    }

    /// Build from raw bits, dropping unknown ones.
    pub const fn from_bits(bits: u32) -> Self {
        BdevRoles(bits & Self::ALL.0)
    }

    /// Raw bit value.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True for the legacy undivided role.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: BdevRoles) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if devices with these roles hold object data.
    pub const fn holds_data(self) -> bool {
        self.is_empty() || self.contains(Self::DATA)
    }
}

impl std::ops::BitOr for BdevRoles {
    type Output = BdevRoles;

    fn bitor(self, rhs: Self) -> Self::Output {
        BdevRoles(self.0 | rhs.0)
    }
}

impl fmt::Display for BdevRoles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NA");
        }
        let names: Vec<&str> = [(Self::WAL, "wal"), (Self::META, "meta"), (Self::DATA, "data")]
            .iter()
            .filter(|(role, _)| self.contains(*role))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(","))
    }
}

/// Backing class of a bdev tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BdevClass {
    /// Physical NVMe SSDs addressed by PCI address.
    #[default]
    Nvme,
    /// Memory-backed emulation.
    Malloc,
    /// Kernel block devices.
    Kdev,
    /// File-backed emulation.
    File,
}

impl fmt::Display for BdevClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BdevClass::Nvme => write!(f, "nvme"),
            BdevClass::Malloc => write!(f, "malloc"),
            BdevClass::Kdev => write!(f, "kdev"),
            BdevClass::File => write!(f, "file"),
        }
    }
}

/// A configured bundle of device addresses for one storage tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdevTierConfig {
    /// Backing class of all devices in the tier.
    #[serde(default)]
    pub class: BdevClass,
    /// PCI addresses (nvme) or paths (file/kdev) of the tier's devices.
    pub device_list: Vec<String>,
    /// Per-device byte size for file-backed and malloc emulation.
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Role bitset; empty means legacy undivided role.
    #[serde(default)]
    pub roles: BdevRoles,
}

impl BdevTierConfig {
    /// Create an NVMe tier with the given roles.
    pub fn nvme(device_list: Vec<String>, roles: BdevRoles) -> Self {
        Self {
            class: BdevClass::Nvme,
            device_list,
            file_size: None,
            roles,
        }
    }

    /// True if this tier is backed by NVMe controllers.
    pub fn is_nvme(&self) -> bool {
        self.class == BdevClass::Nvme
    }
}

/// Device state of an NVMe controller as reported by the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum NvmeDevState {
    /// Not yet used by any engine.
    #[default]
    New,
    /// In use and healthy.
    Normal,
    /// Evicted by the engine after faults.
    Faulty,
    /// Physically removed.
    Unplugged,
    /// LED identify in progress.
    Identify,
}

impl NvmeDevState {
    /// True if the controller's capacity can be reported as usable.
    pub fn is_normal(self) -> bool {
        self == NvmeDevState::Normal
    }
}

impl fmt::Display for NvmeDevState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NvmeDevState::New => "NEW",
            NvmeDevState::Normal => "NORMAL",
            NvmeDevState::Faulty => "EVICTED",
            NvmeDevState::Unplugged => "UNPLUGGED",
            NvmeDevState::Identify => "IDENTIFY",
        };
        write!(f, "{}", s)
    }
}

/// Health statistics of an NVMe controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeHealth {
    /// Composite temperature in Kelvin.
    pub temperature_kelvin: u32,
    /// Minutes spent above the warning temperature.
    pub warn_temp_time: u32,
    /// Minutes spent above the critical temperature.
    pub crit_temp_time: u32,
    /// Controller busy time in minutes.
    pub ctrl_busy_time: u64,
    /// Number of power cycles.
    pub power_cycles: u64,
    /// Power-on hours.
    pub power_on_hours: u64,
    /// Number of unsafe shutdowns.
    pub unsafe_shutdowns: u64,
    /// Number of media errors.
    pub media_errors: u64,
    /// Number of error log entries.
    pub error_log_entries: u64,
    /// Engine-side read errors.
    pub bio_read_errors: u32,
    /// Engine-side write errors.
    pub bio_write_errors: u32,
    /// Engine-side unmap errors.
    pub bio_unmap_errors: u32,
    /// Engine-side checksum errors.
    pub checksum_errors: u32,
    /// Temperature threshold warning.
    pub temp_warn: bool,
    /// Available spare below threshold.
    pub avail_spare_warn: bool,
    /// NVM subsystem reliability degraded.
    pub reliability_warn: bool,
    /// Media in read-only mode.
    pub read_only_warn: bool,
    /// Volatile memory backup failed.
    pub volatile_mem_warn: bool,
}

impl NvmeHealth {
    /// True if any critical warning flag is raised.
    pub fn has_warning(&self) -> bool {
        self.temp_warn
            || self.avail_spare_warn
            || self.reliability_warn
            || self.read_only_warn
            || self.volatile_mem_warn
    }
}

/// Namespace created on an NVMe controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeNamespace {
    /// Namespace ID.
    pub id: u32,
    /// Namespace size in bytes.
    pub size: u64,
}

/// One target ID in an SMD device's target list.
///
/// The system target carries engine-internal metadata and never counts
/// towards the per-device target count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum TargetId {
    /// A regular I/O target.
    Target(u32),
    /// The engine's system target.
    System,
}

impl From<i32> for TargetId {
    fn from(raw: i32) -> Self {
        if raw < 0 {
            TargetId::System
        } else {
            TargetId::Target(raw as u32)
        }
    }
}

impl TryFrom<i64> for TargetId {
    type Error = String;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        if raw < 0 {
            return Ok(TargetId::System);
        }
        u32::try_from(raw)
            .map(TargetId::Target)
            .map_err(|_| format!("target id {} out of range", raw))
    }
}

impl From<TargetId> for i64 {
    fn from(id: TargetId) -> Self {
        match id {
            TargetId::Target(n) => i64::from(n),
            TargetId::System => -1,
        }
    }
}

/// Per-controller, per-rank storage metadata record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmdDevice {
    /// Blobstore UUID.
    pub uuid: Uuid,
    /// Owning rank; `None` when no engine is running.
    pub rank: Option<Rank>,
    /// Targets served by this device. May contain duplicates and the system target.
    pub target_ids: Vec<TargetId>,
    /// Role bitset of the tier the device belongs to.
    pub roles: BdevRoles,
    /// Allocation cluster size in bytes.
    pub cluster_size: u64,
    /// Total capacity in bytes.
    pub total_bytes: u64,
    /// Available capacity in bytes.
    pub avail_bytes: u64,
    /// Capacity usable for cluster data; derived by the capacity accountant.
    pub usable_bytes: u64,
    /// Per-target metadata blob size.
    pub meta_size: u64,
    /// Per-target metadata WAL size.
    pub meta_wal_size: u64,
    /// RDB metadata size.
    pub rdb_size: u64,
    /// RDB WAL size.
    pub rdb_wal_size: u64,
}

impl SmdDevice {
    /// Distinct regular target IDs served by this device.
    pub fn targets(&self) -> BTreeSet<u32> {
        self.target_ids
            .iter()
            .filter_map(|id| match id {
                TargetId::Target(n) => Some(*n),
                TargetId::System => None,
            })
            .collect()
    }

    /// Number of distinct regular targets served by this device.
    pub fn target_count(&self) -> u64 {
        self.targets().len() as u64
    }
}

/// A discovered NVMe controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeController {
    /// PCI address (or emulated device path).
    pub pci_addr: String,
    /// Model name.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Firmware revision.
    pub fw_rev: String,
    /// NUMA socket the controller is attached to.
    pub socket_id: i32,
    /// Device state.
    pub state: NvmeDevState,
    /// Health statistics, if collected.
    pub health: Option<NvmeHealth>,
    /// Namespaces on the controller.
    pub namespaces: Vec<NvmeNamespace>,
    /// SMD devices, one per target group in use.
    pub smd_devices: Vec<SmdDevice>,
}

impl NvmeController {
    /// Create a controller record with only the address set.
    pub fn new(pci_addr: impl Into<String>) -> Self {
        Self {
            pci_addr: pci_addr.into(),
            ..Default::default()
        }
    }

    /// Sum of namespace sizes.
    pub fn total_bytes(&self) -> u64 {
        self.namespaces.iter().map(|ns| ns.size).sum()
    }

    /// Sum of usable bytes across SMD devices.
    pub fn usable_bytes(&self) -> u64 {
        self.smd_devices.iter().map(|d| d.usable_bytes).sum()
    }
}
