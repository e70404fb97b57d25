#![warn(missing_docs)]

//! Ferrum storage subsystem: NVMe/SCM device catalog, providers, capacity accounting
//!
//! This crate holds the device model shared by the node control plane:
//! NVMe controllers with their per-rank SMD devices, SCM namespaces and
//! mounts, the provider traits that probe and format them, and the
//! accountant that derives usable capacity from raw free space.

pub mod bdev;
pub mod capacity;
pub mod catalog;
pub mod config;
pub mod error;
pub mod local;
pub mod mock;
pub mod provider;
pub mod ramdisk;
pub mod scm;
pub mod sysfs;

pub use bdev::{
    BdevClass, BdevRoles, BdevTierConfig, NvmeController, NvmeDevState, NvmeHealth, NvmeNamespace,
    Rank, SmdDevice, TargetId,
};
pub use capacity::{
    CapacityAccountant, MetaRdbSizes, ScmReservations, CONTROL_METADATA_SCM_BYTES,
    FS_METADATA_SCM_BYTES, GIB, KIB, MIB,
};
pub use catalog::{
    DeviceCatalog, NvmeControllerResult, NvmeScanRequest, NvmeScanResponse, ResponseState,
    ResponseStatus, ScmMountResult, ScmScanRequest, ScmScanResponse,
};
pub use config::{ControlMetadataConfig, EngineStorageConfig, DEFAULT_RDB_SIZE, MD_CAP_ENV};
pub use error::{StorageError, StorageResult};
pub use local::LocalBdevProvider;
pub use mock::{MockBdevProvider, MockScmProvider, MockSystemProvider};
pub use provider::{
    BdevDeviceFormat, BdevFormatResponse, BdevPrepareRequest, BdevPrepareResponse, BdevProvider,
    BdevScanRequest, BdevScanResponse, BdevWriteConfigRequest, MemInfo, MountUsage,
    ScmFormatState, ScmProvider, ScmScanResult, SystemProvider,
};
pub use ramdisk::{MountScmProvider, ProcSystemProvider};
pub use scm::{ScmClass, ScmModule, ScmMount, ScmNamespace, ScmState, ScmTierConfig};
pub use sysfs::SysfsNvme;
