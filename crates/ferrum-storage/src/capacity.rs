//! Usable-capacity accounting.
//!
//! Scan results report raw available bytes. The accountant derives how much
//! of that is usable for cluster data once write-ahead-log, metadata, RDB and
//! control-plane reservations are taken out.
//!
//! NVMe sizing is done in whole allocation clusters. Every eligible device of
//! a rank is then capped at the rank's smallest per-target cluster share, so
//! targets see the same allowance whichever device backs them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::bdev::{BdevRoles, NvmeController, Rank};
use crate::config::{ControlMetadataConfig, EngineStorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::scm::ScmNamespace;

/// One kibibyte.
pub const KIB: u64 = 1 << 10;
/// One mebibyte.
pub const MIB: u64 = 1 << 20;
/// One gibibyte.
pub const GIB: u64 = 1 << 30;

/// SCM space reserved for control-plane metadata.
pub const CONTROL_METADATA_SCM_BYTES: u64 = 128 * MIB;
/// SCM space reserved for filesystem overhead.
pub const FS_METADATA_SCM_BYTES: u64 = MIB;

/// Fixed SCM reservations applied on top of the RDB size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmReservations {
    /// Control-plane metadata bytes, applied when SCM carries it.
    pub control_metadata_bytes: u64,
    /// Filesystem overhead bytes, always applied.
    pub fs_metadata_bytes: u64,
}

impl Default for ScmReservations {
    fn default() -> Self {
        Self {
            control_metadata_bytes: CONTROL_METADATA_SCM_BYTES,
            fs_metadata_bytes: FS_METADATA_SCM_BYTES,
        }
    }
}

/// Metadata sizes handed to a running engine with a scan request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRdbSizes {
    /// Per-target metadata blob size in bytes.
    pub meta_size: u64,
    /// RDB size in bytes.
    pub rdb_size: u64,
}

/// Number of whole clusters needed to hold `size` bytes.
pub fn clusters_for(size: u64, cluster_size: u64) -> u64 {
    size.div_ceil(cluster_size)
}

/// Round `bytes` down to a whole number of clusters.
pub fn round_down_to_cluster(bytes: u64, cluster_size: u64) -> u64 {
    (bytes / cluster_size) * cluster_size
}

/// Position of an eligible SMD device and its sizing inputs.
struct EligibleDevice {
    ctrlr_idx: usize,
    dev_idx: usize,
    rank: Option<Rank>,
    targets: u64,
    cluster_size: u64,
}

/// Derives usable bytes for NVMe SMD devices and SCM mounts.
#[derive(Debug, Clone, Default)]
pub struct CapacityAccountant {
    reservations: ScmReservations,
}

impl CapacityAccountant {
    /// Accountant with the default reservations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accountant with custom SCM reservations.
    pub fn with_reservations(reservations: ScmReservations) -> Self {
        Self { reservations }
    }

    /// The SCM reservations in use.
    pub fn reservations(&self) -> &ScmReservations {
        &self.reservations
    }

    /// Populate `usable_bytes` on every SMD device of `controllers`.
    pub fn adjust_nvme(&self, controllers: &mut [NvmeController]) {
        let mut eligible = Vec::new();
        let mut min_share: HashMap<Option<Rank>, u64> = HashMap::new();

        for (ctrlr_idx, ctrlr) in controllers.iter_mut().enumerate() {
            let state = ctrlr.state;
            let pci_addr = ctrlr.pci_addr.clone();

            for (dev_idx, dev) in ctrlr.smd_devices.iter_mut().enumerate() {
                dev.usable_bytes = 0;
                if dev.cluster_size > 0 {
                    dev.total_bytes = round_down_to_cluster(dev.total_bytes, dev.cluster_size);
                    dev.avail_bytes = round_down_to_cluster(dev.avail_bytes, dev.cluster_size);
                }

                if !state.is_normal() {
                    debug!(
                        "SMD device {} (rank {:?}, ctrlr {}) not usable: device state {}",
                        dev.uuid, dev.rank, pci_addr, state
                    );
                    dev.avail_bytes = 0;
                    continue;
                }
                if !dev.roles.holds_data() {
                    debug!(
                        "SMD device {} (rank {:?}, ctrlr {}) not used to store data (roles {})",
                        dev.uuid, dev.rank, pci_addr, dev.roles
                    );
                    continue;
                }
                let targets = dev.target_count();
                if dev.cluster_size == 0 || targets == 0 {
                    warn!(
                        "SMD device {} (rank {:?}, ctrlr {}) not usable: missing storage info",
                        dev.uuid, dev.rank, pci_addr
                    );
                    continue;
                }

                let avail_clusters = dev.avail_bytes / dev.cluster_size;
                let remaining = if dev.roles.is_empty() {
                    avail_clusters
                } else {
                    let reserved = Self::reserved_clusters(dev, targets, &pci_addr);
                    if reserved >= avail_clusters {
                        debug!(
                            "SMD device {} (rank {:?}, ctrlr {}): reserved {} clusters >= available {}",
                            dev.uuid, dev.rank, pci_addr, reserved, avail_clusters
                        );
                        continue;
                    }
                    avail_clusters - reserved
                };

                let share = remaining / targets;
                min_share
                    .entry(dev.rank)
                    .and_modify(|m| *m = (*m).min(share))
                    .or_insert(share);
                eligible.push(EligibleDevice {
                    ctrlr_idx,
                    dev_idx,
                    rank: dev.rank,
                    targets,
                    cluster_size: dev.cluster_size,
                });
            }
        }

        for e in eligible {
            let share = min_share.get(&e.rank).copied().unwrap_or(0);
            let dev = &mut controllers[e.ctrlr_idx].smd_devices[e.dev_idx];
            dev.usable_bytes = e.targets * share * e.cluster_size;
            debug!(
                "SMD device {} (rank {:?}): usable {} bytes ({} targets x {} clusters)",
                dev.uuid, e.rank, dev.usable_bytes, e.targets, share
            );
        }
    }

    fn reserved_clusters(dev: &crate::bdev::SmdDevice, targets: u64, pci_addr: &str) -> u64 {
        let cs = dev.cluster_size;
        let mut reserved = 0;

        if dev.roles.contains(BdevRoles::META) {
            reserved += clusters_for(dev.meta_size, cs) * targets;
            if dev.rdb_size > 0 {
                reserved += clusters_for(dev.rdb_size, cs);
            } else {
                warn!(
                    "SMD device {} (ctrlr {}) has meta role but no RDB size",
                    dev.uuid, pci_addr
                );
            }
        }
        if dev.roles.contains(BdevRoles::WAL) {
            reserved += clusters_for(dev.meta_wal_size, cs) * targets;
            if dev.rdb_wal_size > 0 {
                reserved += clusters_for(dev.rdb_wal_size, cs);
            } else {
                warn!(
                    "SMD device {} (ctrlr {}) has WAL role but no RDB WAL size",
                    dev.uuid, pci_addr
                );
            }
        }
        reserved
    }

    /// Populate `usable_bytes` on every mounted SCM namespace.
    ///
    /// `engines` supplies the owning engine of each mount, matched by
    /// mountpoint.
    pub fn adjust_scm(
        &self,
        namespaces: &mut [ScmNamespace],
        engines: &[EngineStorageConfig],
        control_metadata: &ControlMetadataConfig,
    ) {
        for ns in namespaces.iter_mut() {
            let Some(mnt) = ns.mount.as_mut() else {
                continue;
            };
            mnt.usable_bytes = mnt.avail_bytes;

            let Some(engine) = engines.iter().find(|e| e.scm.mountpoint == mnt.path) else {
                error!(
                    "Skipping SCM {}: no engine configured with this mountpoint",
                    mnt.path.display()
                );
                mnt.usable_bytes = 0;
                continue;
            };

            let rdb_size = match engine.rdb_size() {
                Ok(size) => size,
                Err(e) => {
                    error!("Skipping SCM {}: {}", mnt.path.display(), e);
                    mnt.usable_bytes = 0;
                    continue;
                }
            };
            debug!("Removing RDB size {} from SCM {}", rdb_size, mnt.path.display());
            if !reserve(&mut mnt.usable_bytes, rdb_size) {
                warn!("No more usable space in SCM {}", mnt.path.display());
                continue;
            }

            let scm_holds_control_md = if !engine.has_bdev_meta_role() {
                true
            } else {
                match control_metadata.path.as_ref() {
                    Some(md_path) => md_path
                        .to_string_lossy()
                        .starts_with(mnt.path.to_string_lossy().as_ref()),
                    None => {
                        warn!(
                            "SCM {}: metadata on NVMe but no control metadata path configured",
                            mnt.path.display()
                        );
                        false
                    }
                }
            };
            if scm_holds_control_md {
                debug!("Removing control plane metadata from SCM {}", mnt.path.display());
                if !reserve(&mut mnt.usable_bytes, self.reservations.control_metadata_bytes) {
                    warn!("No more usable space in SCM {}", mnt.path.display());
                    continue;
                }
            }

            if !reserve(&mut mnt.usable_bytes, self.reservations.fs_metadata_bytes) {
                warn!("No more usable space in SCM {}", mnt.path.display());
            }
        }
    }

    /// Metadata and RDB sizes to send to a running engine with a scan.
    ///
    /// `namespaces` must already have been through [`Self::adjust_scm`].
    pub fn meta_rdb_sizes(
        &self,
        engine: &EngineStorageConfig,
        namespaces: &[ScmNamespace],
        mem_ratio: f32,
    ) -> StorageResult<MetaRdbSizes> {
        if !(0.0..=1.0).contains(&mem_ratio) {
            return Err(StorageError::InvalidConfig(format!(
                "memory ratio {} out of range (0, 1]",
                mem_ratio
            )));
        }
        let rdb_size = engine.rdb_size()?;

        let usable = namespaces
            .iter()
            .filter_map(|ns| ns.mount.as_ref())
            .find(|m| m.path == engine.scm.mountpoint)
            .map(|m| m.usable_bytes);
        let Some(usable) = usable else {
            debug!(
                "no SCM mount at {}; sending zero meta size",
                engine.scm.mountpoint.display()
            );
            return Ok(MetaRdbSizes {
                meta_size: 0,
                rdb_size,
            });
        };

        let mut meta_size = usable / u64::from(engine.target_count.max(1));
        if mem_ratio > 0.0 {
            meta_size = (meta_size as f64 / f64::from(mem_ratio)) as u64;
        }
        Ok(MetaRdbSizes { meta_size, rdb_size })
    }
}

/// Subtract `amount` from `usable`; clamp to zero and return false on
/// underflow.
fn reserve(usable: &mut u64, amount: u64) -> bool {
    match usable.checked_sub(amount) {
        Some(left) => {
            *usable = left;
            true
        }
        None => {
            *usable = 0;
            false
        }
    }
}
