//! NVMe and SCM scan dispatch.
//!
//! An NVMe scan either probes hardware through the local bdev provider or
//! asks each running engine, depending on which engines own configured
//! devices and whether they have started. Which of the two is called goes
//! through a [`BdevScanStrategy`] supplied at construction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferrum_storage::{
    BdevProvider, BdevScanRequest, BdevScanResponse, CapacityAccountant, ControlMetadataConfig,
    DeviceCatalog, EngineStorageConfig, NvmeController, NvmeScanRequest, NvmeScanResponse,
    ResponseState, ResponseStatus, ScmNamespace, ScmProvider, ScmScanRequest, ScmScanResponse,
    ScmTierConfig, SmdDevice,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::EngineHandle;
use crate::error::{ServerError, ServerResult};
use crate::task_group::TaskGroup;

/// Poll `engine` until it is ready, it stops, or `timeout` passes.
pub async fn wait_ready(engine: &dyn EngineHandle, interval: Duration, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if engine.is_ready() {
            return true;
        }
        if !engine.is_started() || Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// The two ways of obtaining NVMe scan data.
#[async_trait]
pub trait BdevScanStrategy: Send + Sync {
    /// Probe hardware through the node-local provider.
    async fn local_scan(&self, req: &BdevScanRequest) -> ServerResult<BdevScanResponse>;

    /// Scan one engine's devices.
    async fn engine_scan(
        &self,
        engine: Arc<dyn EngineHandle>,
        req: NvmeScanRequest,
    ) -> ServerResult<NvmeScanResponse>;
}

/// Strategy backed by the bdev provider and engine RPC.
pub struct ProviderScanStrategy {
    bdev: Arc<dyn BdevProvider>,
    poll_interval: Duration,
    ready_timeout: Duration,
}

impl ProviderScanStrategy {
    /// Strategy waiting up to `ready_timeout` for started engines.
    pub fn new(bdev: Arc<dyn BdevProvider>, poll_interval: Duration, ready_timeout: Duration) -> Self {
        Self {
            bdev,
            poll_interval,
            ready_timeout,
        }
    }
}

#[async_trait]
impl BdevScanStrategy for ProviderScanStrategy {
    async fn local_scan(&self, req: &BdevScanRequest) -> ServerResult<BdevScanResponse> {
        Ok(self.bdev.scan(req).await?)
    }

    async fn engine_scan(
        &self,
        engine: Arc<dyn EngineHandle>,
        req: NvmeScanRequest,
    ) -> ServerResult<NvmeScanResponse> {
        let index = engine.index();
        if engine.is_started() && !engine.is_ready() {
            debug!(engine = index, "waiting for engine to become ready");
            wait_ready(engine.as_ref(), self.poll_interval, self.ready_timeout).await;
        }
        if engine.is_ready() {
            return engine.scan_nvme(&req).await;
        }
        if engine.is_started() {
            warn!(engine = index, "engine not ready in time, probing its devices locally");
        }
        let resp = engine.storage().scan_bdevs().await?;
        Ok(NvmeScanResponse {
            controllers: resp.controllers,
            state: ResponseState::ok(),
        })
    }
}

/// Decides where scan data comes from and post-processes it.
pub struct ScanCoordinator {
    strategy: Arc<dyn BdevScanStrategy>,
    scm: Arc<dyn ScmProvider>,
    accountant: CapacityAccountant,
    hugepages_disabled: bool,
    control_metadata: ControlMetadataConfig,
}

impl ScanCoordinator {
    /// Coordinator using `strategy` for NVMe and `scm` for SCM scans.
    pub fn new(
        strategy: Arc<dyn BdevScanStrategy>,
        scm: Arc<dyn ScmProvider>,
        accountant: CapacityAccountant,
        control_metadata: ControlMetadataConfig,
    ) -> Self {
        Self {
            strategy,
            scm,
            accountant,
            hugepages_disabled: false,
            control_metadata,
        }
    }

    /// Refuse NVMe scans on a node running without hugepages.
    pub fn with_hugepages_disabled(mut self, disabled: bool) -> Self {
        self.hugepages_disabled = disabled;
        self
    }

    /// Scan NVMe devices of the given engines.
    ///
    /// `scm_namespaces` are the results of a preceding SCM scan with usage;
    /// they size the per-engine metadata hints when `req.meta` is set.
    pub async fn scan_nvme(
        &self,
        engines: &[Arc<dyn EngineHandle>],
        req: &NvmeScanRequest,
        scm_namespaces: &[ScmNamespace],
        cancel: &CancellationToken,
    ) -> ServerResult<NvmeScanResponse> {
        if self.hugepages_disabled {
            return Err(ServerError::HugepagesDisabled);
        }

        let configured: Vec<String> = engines
            .iter()
            .flat_map(|e| e.storage().bdev_addresses())
            .collect();
        if configured.is_empty() {
            debug!("no bdevs configured, scanning locally");
            let resp = self.strategy.local_scan(&BdevScanRequest::default()).await?;
            return Ok(self.finish(resp.controllers, ResponseState::ok(), engines, req));
        }

        let bdev_engines: Vec<Arc<dyn EngineHandle>> = engines
            .iter()
            .filter(|e| e.storage().has_bdevs())
            .cloned()
            .collect();
        let all_started = bdev_engines.iter().all(|e| e.is_started());

        let (mut controllers, mut state) = self
            .dispatch(&bdev_engines, &configured, req, scm_namespaces, cancel)
            .await?;
        if controllers.len() != configured.len() {
            if all_started {
                debug!(
                    "scan returned {} controllers for {} configured bdevs",
                    controllers.len(),
                    configured.len()
                );
            } else {
                info!(
                    "scan returned {} controllers, {} configured; retrying",
                    controllers.len(),
                    configured.len()
                );
                (controllers, state) = self
                    .dispatch(&bdev_engines, &configured, req, scm_namespaces, cancel)
                    .await?;
                if controllers.len() != configured.len() {
                    warn!(
                        "scan still returned {} controllers for {} configured bdevs",
                        controllers.len(),
                        configured.len()
                    );
                }
            }
        }

        Ok(self.finish(controllers, state, engines, req))
    }

    async fn dispatch(
        &self,
        engines: &[Arc<dyn EngineHandle>],
        configured: &[String],
        req: &NvmeScanRequest,
        scm_namespaces: &[ScmNamespace],
        cancel: &CancellationToken,
    ) -> ServerResult<(Vec<NvmeController>, ResponseState)> {
        if !engines.iter().any(|e| e.is_started()) {
            debug!("no engine started, probing {} configured bdevs", configured.len());
            let resp = self
                .strategy
                .local_scan(&BdevScanRequest::for_devices(configured.to_vec()))
                .await?;
            return Ok((resp.controllers, ResponseState::ok()));
        }

        let mut group = TaskGroup::new();
        for engine in engines {
            let engine_req = self.engine_request(&engine.storage().config(), req, scm_namespaces);
            let strategy = Arc::clone(&self.strategy);
            let engine = Arc::clone(engine);
            group.spawn(engine.index(), scan_engine(strategy, engine, engine_req));
        }

        let results = group.collect(cancel).await?;
        let total = results.len();
        let mut catalog = DeviceCatalog::new();
        let mut failed = 0;
        let mut last_err = None;
        for (index, result) in results {
            match result {
                Ok(resp) => catalog.merge_controllers(resp.controllers),
                Err(e) => {
                    warn!(engine = index, "NVMe scan failed: {}", e);
                    failed += 1;
                    last_err = Some(e);
                }
            }
        }

        let state = match last_err {
            None => ResponseState::ok(),
            Some(err) if total == 1 || failed == total => return Err(err),
            Some(err) => ResponseState::error(ResponseStatus::ErrEngine, err.to_string()),
        };
        Ok((catalog.controllers, state))
    }

    fn engine_request(
        &self,
        config: &EngineStorageConfig,
        req: &NvmeScanRequest,
        scm_namespaces: &[ScmNamespace],
    ) -> ServerResult<NvmeScanRequest> {
        let mut engine_req = req.clone();
        if req.meta && (req.meta_size == 0 || req.rdb_size == 0) {
            let sizes = self
                .accountant
                .meta_rdb_sizes(config, scm_namespaces, req.mem_ratio)?;
            if engine_req.meta_size == 0 {
                engine_req.meta_size = sizes.meta_size;
            }
            if engine_req.rdb_size == 0 {
                engine_req.rdb_size = sizes.rdb_size;
            }
        }
        Ok(engine_req)
    }

    fn finish(
        &self,
        controllers: Vec<NvmeController>,
        state: ResponseState,
        engines: &[Arc<dyn EngineHandle>],
        req: &NvmeScanRequest,
    ) -> NvmeScanResponse {
        let mut catalog = DeviceCatalog::from_controllers(controllers);
        self.accountant.adjust_nvme(&mut catalog.controllers);
        synthesize_tier_roles(&mut catalog, engines);
        catalog.trim(req);
        catalog.into_nvme_response(state)
    }

    /// Scan SCM of the given engines.
    pub async fn scan_scm(
        &self,
        engines: &[Arc<dyn EngineHandle>],
        req: &ScmScanRequest,
    ) -> ServerResult<ScmScanResponse> {
        let tiers: Vec<ScmTierConfig> = engines.iter().map(|e| e.storage().scm_tier()).collect();
        let result = self.scm.scan(&tiers).await?;
        let mut namespaces = result.namespaces;

        if req.usage {
            for ns in namespaces.iter_mut() {
                let Some(mnt) = ns.mount.as_mut() else {
                    continue;
                };
                match self.scm.usage(&mnt.path).await {
                    Ok(usage) => {
                        mnt.total_bytes = usage.total_bytes;
                        mnt.avail_bytes = usage.avail_bytes;
                    }
                    Err(e) => warn!("SCM usage of {} unavailable: {}", mnt.path.display(), e),
                }
                mnt.rank = engines
                    .iter()
                    .find(|e| e.storage().scm_tier().mountpoint == mnt.path)
                    .and_then(|e| e.rank());
            }
            let configs: Vec<EngineStorageConfig> =
                engines.iter().map(|e| e.storage().config()).collect();
            self.accountant
                .adjust_scm(&mut namespaces, &configs, &self.control_metadata);
        }

        Ok(ScmScanResponse {
            modules: result.modules,
            namespaces,
            scm_state: result.state,
            state: ResponseState::ok(),
        })
    }
}

async fn scan_engine(
    strategy: Arc<dyn BdevScanStrategy>,
    engine: Arc<dyn EngineHandle>,
    req: ServerResult<NvmeScanRequest>,
) -> ServerResult<NvmeScanResponse> {
    let index = engine.index();
    let resp = strategy.engine_scan(engine, req?).await?;
    if !resp.state.is_ok() {
        return Err(ServerError::Engine {
            index,
            reason: resp.state.error,
        });
    }
    Ok(resp)
}

// Controllers probed without an engine carry no SMD records. Under role-tagged
// tiers, report the tier's roles so callers can see the intended layout.
fn synthesize_tier_roles(catalog: &mut DeviceCatalog, engines: &[Arc<dyn EngineHandle>]) {
    let configs: Vec<EngineStorageConfig> = engines.iter().map(|e| e.storage().config()).collect();
    for ctrlr in catalog.controllers.iter_mut() {
        if !ctrlr.smd_devices.is_empty() {
            continue;
        }
        let roles = configs
            .iter()
            .find_map(|c| c.tier_for_address(&ctrlr.pci_addr))
            .map(|t| t.roles);
        if let Some(roles) = roles.filter(|r| !r.is_empty()) {
            ctrlr.smd_devices.push(SmdDevice {
                rank: None,
                roles,
                ..Default::default()
            });
        }
    }
}
