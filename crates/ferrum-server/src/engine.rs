//! Locally managed storage engines.
//!
//! [`EngineHandle`] is the seam the scan and format logic works against. The
//! engine process itself lives outside this crate; [`EngineInstance`] tracks
//! its lifecycle flags and reaches it through an [`EngineClient`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ferrum_storage::{
    BdevClass, BdevProvider, BdevScanRequest, BdevScanResponse, BdevTierConfig,
    BdevWriteConfigRequest, EngineStorageConfig, NvmeControllerResult, NvmeScanRequest,
    NvmeScanResponse, Rank, ResponseState, ResponseStatus, ScmFormatState, ScmProvider,
    ScmTierConfig, StorageError, StorageResult,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ServerError, ServerResult};

/// RPC seam to a running engine process.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Scan NVMe devices from the engine's in-process device state.
    async fn scan_nvme(&self, req: &NvmeScanRequest) -> ServerResult<NvmeScanResponse>;
}

/// A locally managed engine as seen by the control service.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Engine index on this node.
    fn index(&self) -> u32;

    /// True once the engine process has been started.
    fn is_started(&self) -> bool;

    /// True once the engine answers storage requests.
    fn is_ready(&self) -> bool;

    /// Rank assigned to the engine, if any.
    fn rank(&self) -> Option<Rank>;

    /// The engine's storage.
    fn storage(&self) -> &EngineStorage;

    /// Scan NVMe devices through the running engine.
    async fn scan_nvme(&self, req: &NvmeScanRequest) -> ServerResult<NvmeScanResponse>;

    /// Release the engine's startup wait once its storage is formatted.
    fn notify_storage_ready(&self, replace: bool);
}

/// Storage configuration and providers of one engine.
pub struct EngineStorage {
    index: u32,
    config: RwLock<EngineStorageConfig>,
    nvme_config_path: PathBuf,
    bdev: Arc<dyn BdevProvider>,
    scm: Arc<dyn ScmProvider>,
    // Serializes tier-list updates across the config write.
    update: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for EngineStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineStorage")
            .field("index", &self.index)
            .field("config", &*self.config.read())
            .field("nvme_config_path", &self.nvme_config_path)
            .finish_non_exhaustive()
    }
}

impl EngineStorage {
    /// Storage for engine `index`.
    pub fn new(
        index: u32,
        config: EngineStorageConfig,
        nvme_config_path: PathBuf,
        bdev: Arc<dyn BdevProvider>,
        scm: Arc<dyn ScmProvider>,
    ) -> Self {
        Self {
            index,
            config: RwLock::new(config),
            nvme_config_path,
            bdev,
            scm,
            update: tokio::sync::Mutex::new(()),
        }
    }

    /// Storage built from an engine's node configuration entry.
    pub fn from_config(
        config: &EngineConfig,
        bdev: Arc<dyn BdevProvider>,
        scm: Arc<dyn ScmProvider>,
    ) -> Self {
        Self::new(
            config.index,
            config.storage.clone(),
            config.nvme_config_path(),
            bdev,
            scm,
        )
    }

    /// Engine index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Snapshot of the storage configuration.
    pub fn config(&self) -> EngineStorageConfig {
        self.config.read().clone()
    }

    /// The SCM tier.
    pub fn scm_tier(&self) -> ScmTierConfig {
        self.config.read().scm.clone()
    }

    /// All configured bdev addresses.
    pub fn bdev_addresses(&self) -> Vec<String> {
        self.config.read().bdev_addresses()
    }

    /// True if any bdev is configured.
    pub fn has_bdevs(&self) -> bool {
        self.config.read().has_bdevs()
    }

    /// Probe this engine's bdevs locally.
    pub async fn scan_bdevs(&self) -> StorageResult<BdevScanResponse> {
        let addrs = self.bdev_addresses();
        if addrs.is_empty() {
            return Ok(BdevScanResponse::default());
        }
        self.bdev.scan(&BdevScanRequest::for_devices(addrs)).await
    }

    /// Whether the SCM tier needs formatting.
    pub async fn check_scm_format(&self) -> StorageResult<ScmFormatState> {
        self.scm.check_format(&self.scm_tier()).await
    }

    /// Format and mount the SCM tier.
    pub async fn format_scm(&self, force: bool) -> StorageResult<()> {
        self.scm.format(&self.scm_tier(), force).await
    }

    /// Format every bdev tier, one result per configured device.
    ///
    /// When every device formats cleanly the device-local NVMe config is
    /// rewritten; a failure to write it is reported as an engine-level
    /// result with an empty address.
    pub async fn format_nvme(&self) -> Vec<NvmeControllerResult> {
        let config = self.config();
        let tiers = config.bdev_tiers.clone();
        let present = self.present_nvme_addresses(config.nvme_addresses()).await;

        let mut results = Vec::new();
        for tier in &tiers {
            let mut tier = tier.clone();
            if tier.class == BdevClass::Nvme {
                let (found, missing): (Vec<String>, Vec<String>) = tier
                    .device_list
                    .drain(..)
                    .partition(|addr| present.as_ref().map_or(true, |p| p.contains(addr)));
                for addr in missing {
                    warn!(engine = self.index, "NVMe controller {} not found", addr);
                    results.push(self.result(
                        addr,
                        ResponseState::error(ResponseStatus::ErrNvme, "controller not found"),
                    ));
                }
                tier.device_list = found;
            }

            match self.bdev.format(&tier).await {
                Ok(resp) => {
                    for dev in resp.devices {
                        let state = match dev.error {
                            Some(err) => ResponseState::error(ResponseStatus::ErrNvme, err),
                            None => ResponseState::ok(),
                        };
                        results.push(self.result(dev.address, state));
                    }
                }
                Err(StorageError::EmptyDeviceList) => {
                    debug!(engine = self.index, "no devices left to format in {} tier", tier.class);
                }
                Err(e) => {
                    warn!(engine = self.index, "{} tier format failed: {}", tier.class, e);
                    let mut state = ResponseState::error(ResponseStatus::ErrNvme, e.to_string());
                    if let Some(hint) = e.resolution() {
                        state.info = hint.to_string();
                    }
                    for addr in &tier.device_list {
                        results.push(self.result(addr.clone(), state.clone()));
                    }
                }
            }
        }

        if !results.is_empty() && results.iter().all(|r| r.state.is_ok()) {
            if let Err(e) = self.write_nvme_config().await {
                warn!(engine = self.index, "writing NVMe config failed: {}", e);
                results.push(self.result(
                    String::new(),
                    ResponseState::error(ResponseStatus::ErrNvme, e.to_string()),
                ));
            }
        }
        results
    }

    // Addresses of configured NVMe-class controllers actually present.
    // `None` when the probe itself failed; formatting then proceeds blind.
    async fn present_nvme_addresses(&self, addrs: Vec<String>) -> Option<Vec<String>> {
        if addrs.is_empty() {
            return Some(Vec::new());
        }
        match self.bdev.scan(&BdevScanRequest::for_devices(addrs)).await {
            Ok(resp) => Some(resp.controllers.into_iter().map(|c| c.pci_addr).collect()),
            Err(e) => {
                warn!(engine = self.index, "pre-format scan failed: {}", e);
                None
            }
        }
    }

    fn result(&self, pci_addr: String, state: ResponseState) -> NvmeControllerResult {
        NvmeControllerResult {
            pci_addr,
            engine_index: self.index,
            state,
        }
    }

    /// Persist the device-local NVMe config.
    pub async fn write_nvme_config(&self) -> StorageResult<()> {
        let tiers = self.config.read().bdev_tiers.clone();
        self.write_tiers(tiers).await
    }

    async fn write_tiers(&self, tiers: Vec<BdevTierConfig>) -> StorageResult<()> {
        let req = BdevWriteConfigRequest {
            engine_index: self.index,
            config_path: self.nvme_config_path.clone(),
            tiers,
        };
        self.bdev.write_config(&req).await
    }

    /// Append a device to an NVMe tier; `None` selects the first NVMe tier.
    ///
    /// The device-local NVMe config is written with the new device first; the
    /// in-memory tier list only changes once that write succeeds.
    pub async fn add_bdev(&self, tier_index: Option<usize>, pci_addr: &str) -> ServerResult<()> {
        let _guard = self.update.lock().await;

        let mut tiers = self.config.read().bdev_tiers.clone();
        if tiers
            .iter()
            .flat_map(|t| t.device_list.iter())
            .any(|a| a == pci_addr)
        {
            return Err(ServerError::Config(format!(
                "{} already assigned to engine {}",
                pci_addr, self.index
            )));
        }
        let tier = match tier_index {
            Some(i) => tiers.get_mut(i).filter(|t| t.is_nvme()),
            None => tiers.iter_mut().find(|t| t.is_nvme()),
        };
        let Some(tier) = tier else {
            return Err(ServerError::TierNotFound {
                engine: self.index,
                tier: tier_index.map_or_else(|| "(any)".to_string(), |i| i.to_string()),
            });
        };
        tier.device_list.push(pci_addr.to_string());

        self.write_tiers(tiers.clone()).await?;
        self.config.write().bdev_tiers = tiers;
        info!(engine = self.index, "added {} to NVMe tier", pci_addr);
        Ok(())
    }
}

/// Signal carried to an engine waiting for its storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageReady {
    /// Join under the previous rank.
    pub replace: bool,
}

/// Production engine handle.
pub struct EngineInstance {
    storage: EngineStorage,
    started: AtomicBool,
    ready: AtomicBool,
    rank: Mutex<Option<Rank>>,
    client: RwLock<Option<Arc<dyn EngineClient>>>,
    storage_ready: watch::Sender<Option<StorageReady>>,
}

impl EngineInstance {
    /// Stopped engine over `storage`.
    pub fn new(storage: EngineStorage) -> Self {
        let (storage_ready, _) = watch::channel(None);
        Self {
            storage,
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            rank: Mutex::new(None),
            client: RwLock::new(None),
            storage_ready,
        }
    }

    /// Attach the RPC client of the running engine.
    pub fn set_client(&self, client: Arc<dyn EngineClient>) {
        *self.client.write() = Some(client);
    }

    /// Record whether the engine process is running.
    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
        if !started {
            self.ready.store(false, Ordering::SeqCst);
        }
    }

    /// Record whether the engine answers storage requests.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Record the engine's rank.
    pub fn set_rank(&self, rank: Option<Rank>) {
        *self.rank.lock() = rank;
    }

    /// Wait until the storage-ready signal fires.
    pub async fn await_storage_ready(&self) -> StorageReady {
        let mut rx = self.storage_ready.subscribe();
        loop {
            if let Some(ready) = *rx.borrow_and_update() {
                return ready;
            }
            // The sender lives in self, so this only fails if self is gone.
            if rx.changed().await.is_err() {
                return StorageReady { replace: false };
            }
        }
    }

    /// Last storage-ready signal, if any fired.
    pub fn storage_ready(&self) -> Option<StorageReady> {
        *self.storage_ready.borrow()
    }
}

#[async_trait]
impl EngineHandle for EngineInstance {
    fn index(&self) -> u32 {
        self.storage.index()
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.is_started() && self.ready.load(Ordering::SeqCst)
    }

    fn rank(&self) -> Option<Rank> {
        *self.rank.lock()
    }

    fn storage(&self) -> &EngineStorage {
        &self.storage
    }

    async fn scan_nvme(&self, req: &NvmeScanRequest) -> ServerResult<NvmeScanResponse> {
        let client = self.client.read().clone();
        let Some(client) = client else {
            return Err(ServerError::Engine {
                index: self.index(),
                reason: "engine not reachable".to_string(),
            });
        };
        client.scan_nvme(req).await
    }

    fn notify_storage_ready(&self, replace: bool) {
        info!(engine = self.index(), replace, "storage ready");
        self.storage_ready.send_replace(Some(StorageReady { replace }));
    }
}
