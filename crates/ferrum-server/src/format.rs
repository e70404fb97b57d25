//! Storage format orchestration.
//!
//! Formatting runs in phases: the node-wide control-metadata store, then SCM
//! on every engine concurrently, then NVMe per engine. An engine whose SCM
//! failed or was left untouched does not get its NVMe formatted. Engines
//! without a hard error are released to start once both phases are done.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ferrum_storage::{
    ControlMetadataConfig, NvmeControllerResult, ResponseState, ResponseStatus, ScmFormatState,
    ScmMountResult, SystemProvider, MIB,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::EngineHandle;
use crate::error::{ServerError, ServerResult};
use crate::task_group::TaskGroup;

/// Reason reported for engines whose NVMe format was skipped.
pub const SCM_NOT_FORMATTED: &str = "SCM was not formatted";

/// Reason reported for SCM that was already formatted.
pub const SCM_ALREADY_FORMATTED: &str = "SCM is already formatted";

/// Minimum headroom kept above the total ramdisk size.
pub const RAMDISK_MIN_MARGIN: u64 = 64 * MIB;

/// Marker file identifying a formatted control-metadata directory.
pub const CONTROL_METADATA_MARKER: &str = "ferrum_control.json";

/// Storage format request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFormatRequest {
    /// Reformat storage that is already formatted.
    #[serde(default)]
    pub reformat: bool,
    /// Engines rejoin under their previous rank.
    #[serde(default)]
    pub replace: bool,
}

/// Storage format response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFormatResponse {
    /// NVMe controller results.
    pub crets: Vec<NvmeControllerResult>,
    /// SCM mount results.
    pub mrets: Vec<ScmMountResult>,
}

/// Node-wide control-plane metadata store.
#[async_trait]
pub trait ControlMetadataStore: Send + Sync {
    /// True if the node has a dedicated store configured.
    fn is_configured(&self) -> bool;

    /// True if the store has not been formatted.
    async fn needs_format(&self) -> ServerResult<bool>;

    /// Initialise the store, wiping existing contents when `force` is set.
    async fn format(&self, force: bool) -> ServerResult<()>;
}

#[derive(Serialize, Deserialize)]
struct ControlMetadataMarker {
    id: Uuid,
    version: u32,
}

/// Control-metadata store kept in a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryMetadataStore {
    path: Option<PathBuf>,
}

impl DirectoryMetadataStore {
    /// Store at the configured path; unconfigured if the path is unset.
    pub fn new(config: &ControlMetadataConfig) -> Self {
        Self {
            path: config.path.clone().filter(|_| config.has_path()),
        }
    }

    fn dir(&self) -> ServerResult<&Path> {
        self.path
            .as_deref()
            .ok_or_else(|| ServerError::ControlMetadata("no path configured".to_string()))
    }
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[async_trait]
impl ControlMetadataStore for DirectoryMetadataStore {
    fn is_configured(&self) -> bool {
        self.path.is_some()
    }

    async fn needs_format(&self) -> ServerResult<bool> {
        let marker = self.dir()?.join(CONTROL_METADATA_MARKER);
        Ok(!tokio::fs::try_exists(&marker).await?)
    }

    async fn format(&self, force: bool) -> ServerResult<()> {
        let dir = self.dir()?.to_path_buf();
        tokio::task::spawn_blocking(move || -> ServerResult<()> {
            let md_err = |e: std::io::Error| {
                ServerError::ControlMetadata(format!("{}: {}", dir.display(), e))
            };
            if force && dir.exists() {
                info!("wiping control metadata in {}", dir.display());
                clear_dir(&dir).map_err(md_err)?;
            }
            fs::create_dir_all(&dir).map_err(md_err)?;
            let marker = ControlMetadataMarker {
                id: Uuid::new_v4(),
                version: 1,
            };
            let bytes = serde_json::to_vec_pretty(&marker)
                .map_err(|e| ServerError::ControlMetadata(e.to_string()))?;
            fs::write(dir.join(CONTROL_METADATA_MARKER), bytes).map_err(md_err)?;
            info!("control metadata initialised in {}", dir.display());
            Ok(())
        })
        .await
        .map_err(|e| ServerError::ControlMetadata(e.to_string()))?
    }
}

/// Drives SCM and NVMe formatting across engines.
pub struct FormatOrchestrator {
    system: Arc<dyn SystemProvider>,
    control_metadata: Arc<dyn ControlMetadataStore>,
}

impl FormatOrchestrator {
    /// Orchestrator using `system` for memory checks.
    pub fn new(
        system: Arc<dyn SystemProvider>,
        control_metadata: Arc<dyn ControlMetadataStore>,
    ) -> Self {
        Self {
            system,
            control_metadata,
        }
    }

    /// Format storage of every engine.
    pub async fn format(
        &self,
        engines: &[Arc<dyn EngineHandle>],
        req: &StorageFormatRequest,
        cancel: &CancellationToken,
    ) -> ServerResult<StorageFormatResponse> {
        let md_formatted = self.format_control_metadata(req.reformat).await?;

        let scm = self.format_scm(engines, req.reformat, cancel).await?;

        let mut crets = Vec::new();
        let mut nvme_errored = HashSet::new();
        for engine in engines {
            let index = engine.index();
            let skip = scm.errored.contains(&index)
                || (scm.skipped.get(&index) == Some(&false) && !md_formatted);
            if skip {
                debug!(engine = index, "skipping NVMe format: {}", SCM_NOT_FORMATTED);
                crets.push(NvmeControllerResult {
                    pci_addr: String::new(),
                    engine_index: index,
                    state: ResponseState::info(SCM_NOT_FORMATTED),
                });
                continue;
            }
            if !engine.storage().has_bdevs() {
                continue;
            }

            info!(engine = index, "formatting NVMe");
            let results = engine.storage().format_nvme().await;
            if results.iter().any(|r| !r.state.is_ok()) {
                warn!(engine = index, "NVMe format reported errors");
                nvme_errored.insert(index);
            }
            crets.extend(results);
        }

        for engine in engines {
            let index = engine.index();
            if scm.errored.contains(&index) || nvme_errored.contains(&index) {
                warn!(engine = index, "storage not ready, engine stays blocked");
                continue;
            }
            engine.notify_storage_ready(req.replace);
        }

        Ok(StorageFormatResponse {
            crets,
            mrets: scm.results,
        })
    }

    async fn format_control_metadata(&self, reformat: bool) -> ServerResult<bool> {
        if !self.control_metadata.is_configured() {
            return Ok(false);
        }
        let needs = self.control_metadata.needs_format().await?;
        if !needs && !reformat {
            debug!("control metadata already initialised");
            return Ok(false);
        }
        self.control_metadata.format(reformat).await.map_err(|e| {
            error!("control metadata format failed: {}", e);
            e
        })?;
        Ok(true)
    }

    async fn format_scm(
        &self,
        engines: &[Arc<dyn EngineHandle>],
        reformat: bool,
        cancel: &CancellationToken,
    ) -> ServerResult<ScmPhase> {
        let mut phase = ScmPhase::default();
        let mut to_format: Vec<(Arc<dyn EngineHandle>, bool)> = Vec::new();

        for engine in engines {
            let index = engine.index();
            let tier = engine.storage().scm_tier();
            match engine.storage().check_scm_format().await {
                Err(e) => {
                    error!(engine = index, "SCM format check failed: {}", e);
                    phase.fail(index, tier.mountpoint, e.to_string());
                }
                Ok(ScmFormatState::NeedsFormat) => to_format.push((Arc::clone(engine), false)),
                Ok(ScmFormatState::Formatted { .. }) if reformat => {
                    to_format.push((Arc::clone(engine), true))
                }
                Ok(ScmFormatState::Formatted { empty }) => {
                    info!(engine = index, "{} at {}", SCM_ALREADY_FORMATTED, tier.mountpoint.display());
                    phase.skipped.insert(index, empty && tier.is_ramdisk());
                    phase.results.push(ScmMountResult {
                        mountpoint: tier.mountpoint,
                        engine_index: index,
                        state: ResponseState::info(SCM_ALREADY_FORMATTED),
                    });
                }
            }
        }

        if to_format.len() == engines.len() {
            self.check_ramdisk_memory(engines).await?;
        }

        let mut group = TaskGroup::new();
        for (engine, force) in to_format {
            group.spawn(engine.index(), async move {
                let tier = engine.storage().scm_tier();
                info!(engine = engine.index(), force, "formatting SCM at {}", tier.mountpoint.display());
                let result = engine.storage().format_scm(force).await;
                (tier.mountpoint, result)
            });
        }
        for (index, (mountpoint, result)) in group.collect(cancel).await? {
            match result {
                Ok(()) => phase.results.push(ScmMountResult {
                    mountpoint,
                    engine_index: index,
                    state: ResponseState::ok(),
                }),
                Err(e) => {
                    error!(engine = index, "SCM format failed: {}", e);
                    phase.fail(index, mountpoint, e.to_string());
                }
            }
        }

        let order: HashMap<u32, usize> = engines
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.index(), pos))
            .collect();
        phase
            .results
            .sort_by_key(|r| order.get(&r.engine_index).copied().unwrap_or(usize::MAX));
        Ok(phase)
    }

    async fn check_ramdisk_memory(&self, engines: &[Arc<dyn EngineHandle>]) -> ServerResult<()> {
        let total: u64 = engines
            .iter()
            .map(|e| e.storage().scm_tier())
            .filter(|t| t.is_ramdisk())
            .map(|t| t.ramdisk_size.unwrap_or(0))
            .sum();
        if total == 0 {
            return Ok(());
        }

        let required = total + (total / 20).max(RAMDISK_MIN_MARGIN);
        let mem = self.system.mem_info().await?;
        debug!(
            required,
            available = mem.available_bytes,
            "checking memory for ramdisk SCM"
        );
        if mem.available_bytes < required {
            return Err(ServerError::InsufficientMemory {
                required,
                available: mem.available_bytes,
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct ScmPhase {
    results: Vec<ScmMountResult>,
    errored: HashSet<u32>,
    // Engines left unformatted, with whether their mount was an empty ramdisk.
    skipped: HashMap<u32, bool>,
}

impl ScmPhase {
    fn fail(&mut self, index: u32, mountpoint: PathBuf, reason: String) {
        self.errored.insert(index);
        self.results.push(ScmMountResult {
            mountpoint,
            engine_index: index,
            state: ResponseState::error(ResponseStatus::ErrScm, reason),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineInstance, EngineStorage};
    use ferrum_storage::{
        BdevRoles, BdevTierConfig, EngineStorageConfig, MockBdevProvider, MockScmProvider,
        MockSystemProvider, NvmeController, ScmTierConfig, GIB,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    struct Node {
        bdev: Arc<MockBdevProvider>,
        scm: Arc<MockScmProvider>,
        engines: Vec<Arc<EngineInstance>>,
    }

    impl Node {
        fn new(count: u32) -> Self {
            let addrs: Vec<String> = (0..count).map(|i| format!("0000:{:02x}:00.0", 0x81 + i)).collect();
            let bdev = Arc::new(MockBdevProvider::new(
                addrs.iter().map(|a| NvmeController::new(a.as_str())).collect(),
            ));
            let scm = Arc::new(MockScmProvider::new());
            let engines = (0..count)
                .map(|i| {
                    let storage = EngineStorage::new(
                        i,
                        EngineStorageConfig {
                            target_count: 4,
                            scm: ScmTierConfig::ramdisk(format!("/mnt/ferrum{}", i), 4 * GIB),
                            bdev_tiers: vec![BdevTierConfig::nvme(
                                vec![addrs[i as usize].clone()],
                                BdevRoles::none(),
                            )],
                            env_vars: vec![],
                        },
                        PathBuf::from(format!("/mnt/ferrum{}/ferrum_nvme.conf", i)),
                        Arc::clone(&bdev) as Arc<dyn ferrum_storage::BdevProvider>,
                        Arc::clone(&scm) as Arc<dyn ferrum_storage::ScmProvider>,
                    );
                    Arc::new(EngineInstance::new(storage))
                })
                .collect();
            Self { bdev, scm, engines }
        }

        fn handles(&self) -> Vec<Arc<dyn EngineHandle>> {
            self.engines
                .iter()
                .map(|e| Arc::clone(e) as Arc<dyn EngineHandle>)
                .collect()
        }
    }

    fn orchestrator(available: u64, md: Option<&Path>) -> FormatOrchestrator {
        FormatOrchestrator::new(
            Arc::new(MockSystemProvider::with_available(available)),
            Arc::new(DirectoryMetadataStore::new(&ControlMetadataConfig {
                path: md.map(Path::to_path_buf),
                device: None,
            })),
        )
    }

    #[tokio::test]
    async fn test_fresh_node_formats_everything() {
        let node = Node::new(2);
        let resp = orchestrator(64 * GIB, None)
            .format(&node.handles(), &StorageFormatRequest::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resp.mrets.len(), 2);
        assert!(resp.mrets.iter().all(|m| m.state.is_ok()));
        assert_eq!(resp.mrets[0].engine_index, 0);
        assert_eq!(resp.crets.len(), 2);
        assert!(resp.crets.iter().all(|c| c.state.is_ok()));
        assert_eq!(node.scm.formats().len(), 2);
        assert_eq!(node.bdev.written_configs().len(), 2);
        assert!(node.engines.iter().all(|e| e.storage_ready().is_some()));
    }

    #[tokio::test]
    async fn test_insufficient_memory_aborts() {
        let node = Node::new(2);
        let err = orchestrator(8 * GIB, None)
            .format(&node.handles(), &StorageFormatRequest::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InsufficientMemory { .. }));
        assert!(node.scm.formats().is_empty());
        assert!(node.engines.iter().all(|e| e.storage_ready().is_none()));
    }

    #[tokio::test]
    async fn test_scm_failure_isolates_engine() {
        let node = Node::new(2);
        node.scm.fail_format("/mnt/ferrum1", "mount failed");
        let resp = orchestrator(64 * GIB, None)
            .format(&node.handles(), &StorageFormatRequest::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(resp.mrets[0].state.is_ok());
        assert_eq!(resp.mrets[1].state.status, ResponseStatus::ErrScm);
        let skipped = resp.crets.iter().find(|c| c.engine_index == 1).unwrap();
        assert_eq!(skipped.state.info, SCM_NOT_FORMATTED);
        assert!(skipped.state.is_ok());
        assert_eq!(node.bdev.formatted().len(), 1);
        assert!(node.engines[0].storage_ready().is_some());
        assert!(node.engines[1].storage_ready().is_none());
    }

    #[tokio::test]
    async fn test_formatted_scm_skips_nvme_but_releases_engine() {
        let node = Node::new(1);
        node.scm
            .set_state("/mnt/ferrum0", ScmFormatState::Formatted { empty: false });
        let resp = orchestrator(64 * GIB, None)
            .format(
                &node.handles(),
                &StorageFormatRequest {
                    replace: true,
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(resp.mrets[0].state.info, SCM_ALREADY_FORMATTED);
        assert_eq!(resp.crets.len(), 1);
        assert_eq!(resp.crets[0].state.info, SCM_NOT_FORMATTED);
        assert!(node.bdev.formatted().is_empty());
        assert!(node.engines[0].storage_ready().unwrap().replace);
    }

    #[tokio::test]
    async fn test_empty_ramdisk_still_formats_nvme() {
        let node = Node::new(1);
        node.scm
            .set_state("/mnt/ferrum0", ScmFormatState::Formatted { empty: true });
        let resp = orchestrator(64 * GIB, None)
            .format(&node.handles(), &StorageFormatRequest::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(node.scm.formats().is_empty());
        assert_eq!(resp.crets.len(), 1);
        assert!(resp.crets[0].state.info.is_empty());
        assert_eq!(node.bdev.formatted().len(), 1);
    }

    #[tokio::test]
    async fn test_reformat_forces_scm() {
        let node = Node::new(1);
        node.scm
            .set_state("/mnt/ferrum0", ScmFormatState::Formatted { empty: false });
        orchestrator(64 * GIB, None)
            .format(
                &node.handles(),
                &StorageFormatRequest {
                    reformat: true,
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(node.scm.formats(), vec![(PathBuf::from("/mnt/ferrum0"), true)]);
        assert_eq!(node.bdev.formatted().len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_control_metadata_unblocks_nvme() {
        let tmp = TempDir::new().unwrap();
        let md = tmp.path().join("control");
        let node = Node::new(1);
        node.scm
            .set_state("/mnt/ferrum0", ScmFormatState::Formatted { empty: false });

        let orch = orchestrator(64 * GIB, Some(&md));
        orch.format(&node.handles(), &StorageFormatRequest::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(md.join(CONTROL_METADATA_MARKER).exists());
        assert_eq!(node.bdev.formatted().len(), 1);

        // Metadata now exists, so a second pass skips NVMe again.
        let resp = orch
            .format(&node.handles(), &StorageFormatRequest::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.crets[0].state.info, SCM_NOT_FORMATTED);
        assert_eq!(node.bdev.formatted().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_scm_phase() {
        let node = Node::new(2);
        node.scm.set_format_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let err = orchestrator(64 * GIB, None)
            .format(&node.handles(), &StorageFormatRequest::default(), &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, ServerError::Cancelled));
        assert!(node.engines.iter().all(|e| e.storage_ready().is_none()));
    }

    #[tokio::test]
    async fn test_directory_store_force_wipes() {
        let tmp = TempDir::new().unwrap();
        let store = DirectoryMetadataStore::new(&ControlMetadataConfig {
            path: Some(tmp.path().join("md")),
            device: None,
        });
        assert!(store.is_configured());
        assert!(store.needs_format().await.unwrap());

        store.format(false).await.unwrap();
        assert!(!store.needs_format().await.unwrap());
        fs::write(tmp.path().join("md/raft.db"), b"state").unwrap();

        store.format(true).await.unwrap();
        assert!(!tmp.path().join("md/raft.db").exists());
        assert!(!store.needs_format().await.unwrap());
    }

    #[test]
    fn test_unconfigured_store() {
        let store = DirectoryMetadataStore::new(&ControlMetadataConfig::default());
        assert!(!store.is_configured());
    }
}
