//! Storage control service.
//!
//! [`StorageControlService`] is the entry point the CLI (and any RPC front
//! end) calls. It owns the engine list and forwards to the scan coordinator,
//! the format orchestrator and the bdev provider.

use std::sync::Arc;

use ferrum_storage::{
    BdevPrepareRequest, BdevPrepareResponse, BdevProvider, CapacityAccountant, NvmeScanRequest,
    NvmeScanResponse, ResponseState, ResponseStatus, ScmNamespace, ScmProvider, ScmScanRequest,
    ScmScanResponse, SystemProvider,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::engine::{EngineHandle, EngineInstance, EngineStorage};
use crate::error::{ServerError, ServerResult};
use crate::format::{
    DirectoryMetadataStore, FormatOrchestrator, StorageFormatRequest, StorageFormatResponse,
};
use crate::scan::{ProviderScanStrategy, ScanCoordinator};

/// Combined SCM and NVMe scan request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageScanRequest {
    /// NVMe part.
    #[serde(default)]
    pub nvme: NvmeScanRequest,
    /// SCM part.
    #[serde(default)]
    pub scm: ScmScanRequest,
}

/// Combined scan response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageScanResponse {
    /// NVMe controllers.
    pub nvme: NvmeScanResponse,
    /// SCM modules and namespaces.
    pub scm: ScmScanResponse,
}

/// Rebind a device to the user-space driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeRebindRequest {
    /// PCI address of the device.
    pub pci_addr: String,
}

/// Outcome of a rebind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeRebindResponse {
    /// Call state.
    pub state: ResponseState,
}

/// Register a newly attached device with an engine's NVMe tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeAddDeviceRequest {
    /// PCI address of the device.
    pub pci_addr: String,
    /// Engine receiving the device.
    pub engine_index: u32,
    /// Bdev tier index; the first NVMe tier when unset.
    #[serde(default)]
    pub tier_index: Option<usize>,
}

/// Outcome of adding a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeAddDeviceResponse {
    /// Call state.
    pub state: ResponseState,
}

/// Per-node storage control service.
pub struct StorageControlService {
    engines: Vec<Arc<dyn EngineHandle>>,
    bdev: Arc<dyn BdevProvider>,
    scan: ScanCoordinator,
    format: FormatOrchestrator,
    nr_hugepages: u32,
}

impl StorageControlService {
    /// Service over already-built components.
    pub fn new(
        engines: Vec<Arc<dyn EngineHandle>>,
        bdev: Arc<dyn BdevProvider>,
        scan: ScanCoordinator,
        format: FormatOrchestrator,
    ) -> Self {
        Self {
            engines,
            bdev,
            scan,
            format,
            nr_hugepages: 0,
        }
    }

    /// Hugepages reserved by [`prepare`](Self::prepare) when the request
    /// leaves the count unset.
    pub fn with_nr_hugepages(mut self, nr_hugepages: u32) -> Self {
        self.nr_hugepages = nr_hugepages;
        self
    }

    /// Build the service and its engines from node configuration.
    pub fn from_config(
        config: &ServerConfig,
        bdev: Arc<dyn BdevProvider>,
        scm: Arc<dyn ScmProvider>,
        system: Arc<dyn SystemProvider>,
    ) -> ServerResult<Self> {
        config.validate()?;

        let engines = config
            .engines
            .iter()
            .map(|cfg| {
                let storage = EngineStorage::from_config(cfg, Arc::clone(&bdev), Arc::clone(&scm));
                Arc::new(EngineInstance::new(storage)) as Arc<dyn EngineHandle>
            })
            .collect::<Vec<_>>();

        let strategy = Arc::new(ProviderScanStrategy::new(
            Arc::clone(&bdev),
            config.ready_poll_interval(),
            config.ready_timeout(),
        ));
        let scan = ScanCoordinator::new(
            strategy,
            scm,
            CapacityAccountant::new(),
            config.control_metadata.clone(),
        )
        .with_hugepages_disabled(config.disable_hugepages);
        let format = FormatOrchestrator::new(
            system,
            Arc::new(DirectoryMetadataStore::new(&config.control_metadata)),
        );

        info!(
            node = %config.name,
            engines = engines.len(),
            "storage control service configured"
        );
        let nr_hugepages = if config.disable_hugepages {
            0
        } else {
            config.nr_hugepages
        };
        Ok(Self::new(engines, bdev, scan, format).with_nr_hugepages(nr_hugepages))
    }

    /// Engines managed by this node.
    pub fn engines(&self) -> &[Arc<dyn EngineHandle>] {
        &self.engines
    }

    /// Engine with the given index.
    pub fn engine(&self, index: u32) -> ServerResult<&Arc<dyn EngineHandle>> {
        self.engines
            .iter()
            .find(|e| e.index() == index)
            .ok_or(ServerError::EngineNotFound(index))
    }

    /// Scan NVMe devices.
    ///
    /// When metadata hints are requested the SCM mounts are sized first;
    /// failing that, hints are left to the engines.
    pub async fn scan_nvme(
        &self,
        req: &NvmeScanRequest,
        cancel: &CancellationToken,
    ) -> ServerResult<NvmeScanResponse> {
        let namespaces = if req.meta {
            self.scm_namespaces_with_usage().await
        } else {
            Vec::new()
        };
        self.scan.scan_nvme(&self.engines, req, &namespaces, cancel).await
    }

    /// Scan SCM.
    pub async fn scan_scm(&self, req: &ScmScanRequest) -> ServerResult<ScmScanResponse> {
        self.scan.scan_scm(&self.engines, req).await
    }

    /// Scan SCM with usage, then NVMe sized from those mounts.
    pub async fn storage_scan(
        &self,
        req: &StorageScanRequest,
        cancel: &CancellationToken,
    ) -> ServerResult<StorageScanResponse> {
        let scm_req = ScmScanRequest {
            usage: req.scm.usage || req.nvme.meta,
        };
        let scm = self.scan.scan_scm(&self.engines, &scm_req).await?;
        let nvme = self
            .scan
            .scan_nvme(&self.engines, &req.nvme, &scm.namespaces, cancel)
            .await?;
        Ok(StorageScanResponse { nvme, scm })
    }

    /// Format SCM and NVMe of every engine.
    pub async fn storage_format(
        &self,
        req: &StorageFormatRequest,
        cancel: &CancellationToken,
    ) -> ServerResult<StorageFormatResponse> {
        self.format.format(&self.engines, req, cancel).await
    }

    /// Bind devices to the user-space driver, or back to the kernel on reset.
    ///
    /// An empty allow list prepares every configured bdev. Unless resetting,
    /// a zero hugepage count takes the node's configured count.
    pub async fn prepare(&self, req: &BdevPrepareRequest) -> ServerResult<BdevPrepareResponse> {
        let mut req = req.clone();
        if req.pci_allow_list.is_empty() {
            req.pci_allow_list = self
                .engines
                .iter()
                .flat_map(|e| e.storage().bdev_addresses())
                .collect();
        }
        if req.reset {
            req.nr_hugepages = 0;
        } else if req.nr_hugepages == 0 {
            req.nr_hugepages = self.nr_hugepages;
        }

        let resp = self.bdev.prepare(&req).await?;
        if resp.nr_hugepages < req.nr_hugepages {
            warn!(
                requested = req.nr_hugepages,
                allocated = resp.nr_hugepages,
                "hugepage reservation fell short"
            );
        }
        Ok(resp)
    }

    /// Rebind one device to the user-space driver.
    pub async fn nvme_rebind(&self, req: &NvmeRebindRequest) -> NvmeRebindResponse {
        let prepare = BdevPrepareRequest {
            pci_allow_list: vec![req.pci_addr.clone()],
            ..Default::default()
        };
        let state = match self.bdev.prepare(&prepare).await {
            Ok(_) => {
                info!("rebound {} to the user-space driver", req.pci_addr);
                ResponseState::ok()
            }
            Err(e) => {
                warn!("rebind of {} failed: {}", req.pci_addr, e);
                ResponseState::error(ResponseStatus::ErrNvme, e.to_string())
            }
        };
        NvmeRebindResponse { state }
    }

    /// Add a device to an engine's NVMe tier and persist its device config.
    pub async fn nvme_add_device(&self, req: &NvmeAddDeviceRequest) -> NvmeAddDeviceResponse {
        let state = match self.add_device(req).await {
            Ok(()) => ResponseState::ok(),
            Err(e) => {
                warn!(engine = req.engine_index, "adding {} failed: {}", req.pci_addr, e);
                let status = match e {
                    ServerError::Storage(_) => ResponseStatus::ErrNvme,
                    _ => ResponseStatus::ErrConfig,
                };
                ResponseState::error(status, e.to_string())
            }
        };
        NvmeAddDeviceResponse { state }
    }

    async fn add_device(&self, req: &NvmeAddDeviceRequest) -> ServerResult<()> {
        let engine = self.engine(req.engine_index)?;
        engine
            .storage()
            .add_bdev(req.tier_index, &req.pci_addr)
            .await
    }

    async fn scm_namespaces_with_usage(&self) -> Vec<ScmNamespace> {
        match self
            .scan
            .scan_scm(&self.engines, &ScmScanRequest { usage: true })
            .await
        {
            Ok(resp) => resp.namespaces,
            Err(e) => {
                warn!("SCM scan for metadata hints failed: {}", e);
                Vec::new()
            }
        }
    }
}
