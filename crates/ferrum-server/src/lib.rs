#![warn(missing_docs)]

//! Ferrum node storage control: scan dispatch, format orchestration, device lifecycle
//!
//! The service here sits between node management requests and the storage
//! engines running on the node. It decides whether device data comes from a
//! local hardware probe or from the engines themselves, derives usable
//! capacity through `ferrum_storage`, and sequences SCM and NVMe formatting
//! before engines are allowed to start.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod scan;
pub mod service;
pub mod task_group;

pub use config::{EngineConfig, ServerConfig, NVME_CONFIG_FILE};
pub use engine::{EngineClient, EngineHandle, EngineInstance, EngineStorage, StorageReady};
pub use error::{ServerError, ServerResult};
pub use format::{
    ControlMetadataStore, DirectoryMetadataStore, FormatOrchestrator, StorageFormatRequest,
    StorageFormatResponse, SCM_ALREADY_FORMATTED, SCM_NOT_FORMATTED,
};
pub use scan::{wait_ready, BdevScanStrategy, ProviderScanStrategy, ScanCoordinator};
pub use service::{
    NvmeAddDeviceRequest, NvmeAddDeviceResponse, NvmeRebindRequest, NvmeRebindResponse,
    StorageControlService, StorageScanRequest, StorageScanResponse,
};
pub use task_group::{TaskGroup, DEFAULT_MAX_PARALLELISM};
