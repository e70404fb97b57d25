//! Device catalog and the scan/format request and response records.
//!
//! A [`DeviceCatalog`] is built from scratch by every scan call and never
//! cached across requests.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bdev::NvmeController;
use crate::scm::{ScmModule, ScmNamespace, ScmState};

/// Status code carried in a [`ResponseState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Operation succeeded.
    #[default]
    Success,
    /// Configuration problem.
    ErrConfig,
    /// NVMe operation failed.
    ErrNvme,
    /// SCM operation failed.
    ErrScm,
    /// Engine-side failure.
    ErrEngine,
    /// Anything else.
    ErrUnknown,
}

/// Outcome of an operation on one item, or of a whole call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseState {
    /// Status code.
    pub status: ResponseStatus,
    /// Error message when status is not success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Informational message, e.g. a skip reason.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub info: String,
}

impl ResponseState {
    /// Successful state with no message.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Successful state carrying an informational message.
    pub fn info(info: impl Into<String>) -> Self {
        Self {
            info: info.into(),
            ..Default::default()
        }
    }

    /// Failed state.
    pub fn error(status: ResponseStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            info: String::new(),
        }
    }

    /// True for success states.
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// NVMe scan request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NvmeScanRequest {
    /// Include health statistics.
    #[serde(default)]
    pub health: bool,
    /// Include per-rank SMD device metadata and usable capacity.
    #[serde(default)]
    pub meta: bool,
    /// Return basic fields only.
    #[serde(default)]
    pub basic: bool,
    /// Memory ratio hint for metadata-on-SSD capacity projection.
    #[serde(default)]
    pub mem_ratio: f32,
    /// Caller-estimated per-target metadata size, passed to the engine.
    #[serde(default)]
    pub meta_size: u64,
    /// Caller-estimated RDB size, passed to the engine.
    #[serde(default)]
    pub rdb_size: u64,
}

/// NVMe scan response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeScanResponse {
    /// Discovered controllers.
    pub controllers: Vec<NvmeController>,
    /// Call-level state; may carry a partial-failure message.
    pub state: ResponseState,
}

/// SCM scan request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmScanRequest {
    /// Fill mount usage and usable capacity.
    #[serde(default)]
    pub usage: bool,
}

/// SCM scan response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmScanResponse {
    /// Persistent-memory modules.
    pub modules: Vec<ScmModule>,
    /// Namespaces (and ramdisk pseudo-namespaces).
    pub namespaces: Vec<ScmNamespace>,
    /// Module state summary.
    pub scm_state: ScmState,
    /// Call-level state.
    pub state: ResponseState,
}

/// Result of an operation on one NVMe controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeControllerResult {
    /// Controller address; empty for engine-level entries.
    pub pci_addr: String,
    /// Index of the engine the controller belongs to.
    pub engine_index: u32,
    /// Outcome.
    pub state: ResponseState,
}

/// Result of an SCM format on one engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmMountResult {
    /// SCM mountpoint.
    pub mountpoint: PathBuf,
    /// Index of the engine.
    pub engine_index: u32,
    /// Outcome.
    pub state: ResponseState,
}

/// In-memory view of discovered devices for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCatalog {
    /// NVMe controllers in discovery order.
    pub controllers: Vec<NvmeController>,
    /// SCM namespaces.
    pub namespaces: Vec<ScmNamespace>,
    /// SCM modules.
    pub modules: Vec<ScmModule>,
}

impl DeviceCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the given controllers.
    pub fn from_controllers(controllers: Vec<NvmeController>) -> Self {
        let mut catalog = Self::new();
        catalog.merge_controllers(controllers);
        catalog
    }

    /// Merge controllers into the catalog, keyed by address.
    ///
    /// A controller reported twice keeps its first record; SMD devices from
    /// later records are appended to it.
    pub fn merge_controllers(&mut self, controllers: Vec<NvmeController>) {
        for ctrlr in controllers {
            match self
                .controllers
                .iter_mut()
                .find(|c| c.pci_addr == ctrlr.pci_addr)
            {
                Some(existing) => {
                    debug!(
                        pci_addr = %ctrlr.pci_addr,
                        "merging duplicate controller record"
                    );
                    existing.smd_devices.extend(ctrlr.smd_devices);
                    if existing.health.is_none() {
                        existing.health = ctrlr.health;
                    }
                }
                None => self.controllers.push(ctrlr),
            }
        }
    }

    /// Controller with the given address.
    pub fn controller(&self, pci_addr: &str) -> Option<&NvmeController> {
        self.controllers.iter().find(|c| c.pci_addr == pci_addr)
    }

    /// Keep only controllers whose address is in `addresses`, ordered as
    /// `addresses`.
    pub fn restrict_to(&mut self, addresses: &[String]) {
        let mut kept = Vec::with_capacity(addresses.len());
        for addr in addresses {
            if let Some(pos) = self.controllers.iter().position(|c| &c.pci_addr == addr) {
                kept.push(self.controllers.swap_remove(pos));
            }
        }
        self.controllers = kept;
    }

    /// Strip fields the caller did not ask for.
    pub fn trim(&mut self, req: &NvmeScanRequest) {
        for ctrlr in &mut self.controllers {
            if !req.health || req.basic {
                ctrlr.health = None;
            }
            if req.basic {
                ctrlr.serial.clear();
                ctrlr.model.clear();
                ctrlr.fw_rev.clear();
            }
            if !req.meta {
                ctrlr.smd_devices.clear();
            }
        }
    }

    /// Convert into an NVMe scan response.
    pub fn into_nvme_response(self, state: ResponseState) -> NvmeScanResponse {
        NvmeScanResponse {
            controllers: self.controllers,
            state,
        }
    }
}
