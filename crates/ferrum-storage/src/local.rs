//! Node-local bdev provider.
//!
//! Discovers NVMe controllers through sysfs, emulates file-backed bdevs and
//! writes the engine's device-local NVMe configuration. Formatting real NVMe
//! namespaces needs the user-space driver and is reported as unsupported;
//! the error carries a resolution hint, and engines with NVMe-class tiers
//! stay blocked on storage readiness under this provider.

use std::fs::{self, OpenOptions};
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bdev::{BdevClass, BdevTierConfig, NvmeController, NvmeNamespace};
use crate::catalog::DeviceCatalog;
use crate::error::{StorageError, StorageResult};
use crate::provider::{
    BdevDeviceFormat, BdevFormatResponse, BdevPrepareRequest, BdevPrepareResponse, BdevProvider,
    BdevScanRequest, BdevScanResponse, BdevWriteConfigRequest,
};
use crate::sysfs::{SysfsNvme, USERSPACE_DRIVER};

/// Model string reported for file-backed devices.
pub const FILE_BDEV_MODEL: &str = "file-backed bdev";

/// Bdev provider for the local node.
#[derive(Debug, Clone, Default)]
pub struct LocalBdevProvider {
    sysfs: SysfsNvme,
}

impl LocalBdevProvider {
    /// Provider using the given sysfs accessor.
    pub fn new(sysfs: SysfsNvme) -> Self {
        Self { sysfs }
    }

    fn scan_blocking(sysfs: &SysfsNvme, req: &BdevScanRequest) -> StorageResult<BdevScanResponse> {
        let mut catalog = DeviceCatalog::from_controllers(sysfs.discover()?);
        if req.device_list.is_empty() {
            return Ok(BdevScanResponse {
                controllers: catalog.controllers,
            });
        }

        let mut extra = Vec::new();
        for addr in &req.device_list {
            if catalog.controller(addr).is_some() {
                continue;
            }
            if let Some(ctrlr) = file_device(addr).or_else(|| sysfs.pci_device(addr)) {
                extra.push(ctrlr);
            } else {
                debug!("configured bdev {} not found", addr);
            }
        }
        catalog.merge_controllers(extra);
        catalog.restrict_to(&req.device_list);
        Ok(BdevScanResponse {
            controllers: catalog.controllers,
        })
    }
}

fn file_device(addr: &str) -> Option<NvmeController> {
    let path = Path::new(addr);
    if !path.is_absolute() {
        return None;
    }
    let meta = fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    Some(NvmeController {
        pci_addr: addr.to_string(),
        model: FILE_BDEV_MODEL.to_string(),
        namespaces: vec![NvmeNamespace {
            id: 1,
            size: meta.len(),
        }],
        ..Default::default()
    })
}

fn format_file_tier(tier: &BdevTierConfig) -> StorageResult<BdevFormatResponse> {
    let size = tier.file_size.filter(|s| *s > 0).ok_or_else(|| {
        StorageError::InvalidConfig("file-backed bdev tier requires file_size".to_string())
    })?;

    let devices = tier
        .device_list
        .iter()
        .map(|addr| {
            let result = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(addr)
                .and_then(|f| f.set_len(size));
            match result {
                Ok(()) => {
                    debug!("created {} byte file bdev {}", size, addr);
                    BdevDeviceFormat {
                        address: addr.clone(),
                        error: None,
                    }
                }
                Err(e) => {
                    warn!("failed to create file bdev {}: {}", addr, e);
                    BdevDeviceFormat {
                        address: addr.clone(),
                        error: Some(e.to_string()),
                    }
                }
            }
        })
        .collect();
    Ok(BdevFormatResponse { devices })
}

#[derive(Serialize)]
struct NvmeConfigTier<'a> {
    tier: usize,
    class: BdevClass,
    roles: u32,
    devices: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
}

#[derive(Serialize)]
struct NvmeConfigDocument<'a> {
    engine_index: u32,
    tiers: Vec<NvmeConfigTier<'a>>,
}

/// Write the device-local NVMe config for an engine.
///
/// The file is replaced atomically via a temporary sibling.
pub fn write_nvme_config(req: &BdevWriteConfigRequest) -> StorageResult<()> {
    let doc = NvmeConfigDocument {
        engine_index: req.engine_index,
        tiers: req
            .tiers
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.device_list.is_empty())
            .map(|(idx, t)| NvmeConfigTier {
                tier: idx,
                class: t.class,
                roles: t.roles.bits(),
                devices: &t.device_list,
                size: t.file_size,
            })
            .collect(),
    };
    let bytes = serde_json::to_vec_pretty(&doc)?;

    if let Some(parent) = req.config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = req.config_path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, &req.config_path)?;
    info!(
        "wrote NVMe config for engine {} to {}",
        req.engine_index,
        req.config_path.display()
    );
    Ok(())
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::IoError(std::io::Error::other(e))
}

#[async_trait]
impl BdevProvider for LocalBdevProvider {
    async fn scan(&self, req: &BdevScanRequest) -> StorageResult<BdevScanResponse> {
        let sysfs = self.sysfs.clone();
        let req = req.clone();
        tokio::task::spawn_blocking(move || Self::scan_blocking(&sysfs, &req))
            .await
            .map_err(join_error)?
    }

    async fn format(&self, tier: &BdevTierConfig) -> StorageResult<BdevFormatResponse> {
        if tier.device_list.is_empty() {
            return Err(StorageError::EmptyDeviceList);
        }
        match tier.class {
            BdevClass::File => {
                let tier = tier.clone();
                tokio::task::spawn_blocking(move || format_file_tier(&tier))
                    .await
                    .map_err(join_error)?
            }
            BdevClass::Malloc => Ok(BdevFormatResponse {
                devices: tier
                    .device_list
                    .iter()
                    .map(|addr| BdevDeviceFormat {
                        address: addr.clone(),
                        error: None,
                    })
                    .collect(),
            }),
            class => Err(StorageError::UnsupportedClass {
                class: class.to_string(),
            }),
        }
    }

    async fn prepare(&self, req: &BdevPrepareRequest) -> StorageResult<BdevPrepareResponse> {
        let sysfs = self.sysfs.clone();
        let req = req.clone();
        tokio::task::spawn_blocking(move || -> StorageResult<BdevPrepareResponse> {
            let addrs = if req.pci_allow_list.is_empty() {
                sysfs
                    .discover()?
                    .into_iter()
                    .map(|c| c.pci_addr)
                    .collect()
            } else {
                req.pci_allow_list.clone()
            };
            let driver = (!req.reset).then_some(USERSPACE_DRIVER);
            for addr in &addrs {
                sysfs.bind(addr, driver).map_err(|e| StorageError::DeviceError {
                    device: addr.clone(),
                    reason: e.to_string(),
                })?;
            }
            if !req.target_user.is_empty() {
                debug!("devices prepared for user {}", req.target_user);
            }

            let mut nr_hugepages = 0;
            if !req.reset && req.nr_hugepages > 0 {
                nr_hugepages = sysfs.set_nr_hugepages(req.nr_hugepages)?;
                if nr_hugepages < req.nr_hugepages {
                    warn!(
                        "only {} of {} requested hugepages allocated",
                        nr_hugepages, req.nr_hugepages
                    );
                }
            }
            Ok(BdevPrepareResponse {
                prepared: addrs,
                nr_hugepages,
            })
        })
        .await
        .map_err(join_error)?
    }

    async fn write_config(&self, req: &BdevWriteConfigRequest) -> StorageResult<()> {
        let req = req.clone();
        tokio::task::spawn_blocking(move || write_nvme_config(&req))
            .await
            .map_err(join_error)?
    }
}
