//! In-memory providers for tests and hardware-less development.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::bdev::{BdevTierConfig, NvmeController};
use crate::catalog::DeviceCatalog;
use crate::error::{StorageError, StorageResult};
use crate::provider::{
    BdevDeviceFormat, BdevFormatResponse, BdevPrepareRequest, BdevPrepareResponse, BdevProvider,
    BdevScanRequest, BdevScanResponse, BdevWriteConfigRequest, MemInfo, MountUsage,
    ScmFormatState, ScmProvider, ScmScanResult, SystemProvider,
};
use crate::scm::ScmTierConfig;

fn mock_err(reason: &str) -> StorageError {
    StorageError::DeviceError {
        device: "mock".to_string(),
        reason: reason.to_string(),
    }
}

/// Scripted bdev provider.
///
/// Scan calls pop queued results first and fall back to the configured
/// controller set, restricted to the requested addresses.
#[derive(Debug, Default)]
pub struct MockBdevProvider {
    controllers: Mutex<Vec<NvmeController>>,
    scan_queue: Mutex<VecDeque<Result<Vec<NvmeController>, String>>>,
    scan_calls: Mutex<Vec<BdevScanRequest>>,
    tier_error: Mutex<Option<String>>,
    device_errors: Mutex<HashMap<String, String>>,
    formatted: Mutex<Vec<BdevTierConfig>>,
    prepared: Mutex<Vec<BdevPrepareRequest>>,
    prepare_error: Mutex<Option<String>>,
    configs: Mutex<Vec<BdevWriteConfigRequest>>,
    config_error: Mutex<Option<String>>,
}

impl MockBdevProvider {
    /// Provider reporting the given controllers.
    pub fn new(controllers: Vec<NvmeController>) -> Self {
        Self {
            controllers: Mutex::new(controllers),
            ..Default::default()
        }
    }

    /// Queue a one-shot scan result.
    pub fn push_scan_result(&self, result: Result<Vec<NvmeController>, String>) {
        self.scan_queue.lock().push_back(result);
    }

    /// Fail every tier format with `reason`.
    pub fn fail_format(&self, reason: impl Into<String>) {
        *self.tier_error.lock() = Some(reason.into());
    }

    /// Fail formatting of a single device.
    pub fn fail_device(&self, addr: impl Into<String>, reason: impl Into<String>) {
        self.device_errors.lock().insert(addr.into(), reason.into());
    }

    /// Fail every prepare call with `reason`.
    pub fn fail_prepare(&self, reason: impl Into<String>) {
        *self.prepare_error.lock() = Some(reason.into());
    }

    /// Fail every config write with `reason`.
    pub fn fail_write_config(&self, reason: impl Into<String>) {
        *self.config_error.lock() = Some(reason.into());
    }

    /// Let config writes succeed again.
    pub fn clear_write_config_failure(&self) {
        *self.config_error.lock() = None;
    }

    /// Scan requests received so far.
    pub fn scan_calls(&self) -> Vec<BdevScanRequest> {
        self.scan_calls.lock().clone()
    }

    /// Tiers formatted so far.
    pub fn formatted(&self) -> Vec<BdevTierConfig> {
        self.formatted.lock().clone()
    }

    /// Prepare requests received so far.
    pub fn prepared(&self) -> Vec<BdevPrepareRequest> {
        self.prepared.lock().clone()
    }

    /// Config write requests received so far.
    pub fn written_configs(&self) -> Vec<BdevWriteConfigRequest> {
        self.configs.lock().clone()
    }
}

#[async_trait]
impl BdevProvider for MockBdevProvider {
    async fn scan(&self, req: &BdevScanRequest) -> StorageResult<BdevScanResponse> {
        self.scan_calls.lock().push(req.clone());
        let scripted = self.scan_queue.lock().pop_front();
        let controllers = match scripted {
            Some(Ok(ctrlrs)) => ctrlrs,
            Some(Err(reason)) => return Err(mock_err(&reason)),
            None => self.controllers.lock().clone(),
        };
        let mut catalog = DeviceCatalog::from_controllers(controllers);
        if !req.device_list.is_empty() {
            catalog.restrict_to(&req.device_list);
        }
        Ok(BdevScanResponse {
            controllers: catalog.controllers,
        })
    }

    async fn format(&self, tier: &BdevTierConfig) -> StorageResult<BdevFormatResponse> {
        if tier.device_list.is_empty() {
            return Err(StorageError::EmptyDeviceList);
        }
        if let Some(reason) = self.tier_error.lock().clone() {
            return Err(mock_err(&reason));
        }
        self.formatted.lock().push(tier.clone());
        let errors = self.device_errors.lock();
        let devices = tier
            .device_list
            .iter()
            .map(|addr| BdevDeviceFormat {
                address: addr.clone(),
                error: errors.get(addr).cloned(),
            })
            .collect();
        Ok(BdevFormatResponse { devices })
    }

    async fn prepare(&self, req: &BdevPrepareRequest) -> StorageResult<BdevPrepareResponse> {
        self.prepared.lock().push(req.clone());
        if let Some(reason) = self.prepare_error.lock().clone() {
            return Err(mock_err(&reason));
        }
        Ok(BdevPrepareResponse {
            prepared: req.pci_allow_list.clone(),
            nr_hugepages: if req.reset { 0 } else { req.nr_hugepages },
        })
    }

    async fn write_config(&self, req: &BdevWriteConfigRequest) -> StorageResult<()> {
        if let Some(reason) = self.config_error.lock().clone() {
            return Err(mock_err(&reason));
        }
        self.configs.lock().push(req.clone());
        Ok(())
    }
}

/// Scripted SCM provider.
///
/// Tiers start out needing a format; a successful format marks the tier as
/// formatted and empty.
#[derive(Debug, Default)]
pub struct MockScmProvider {
    scan_result: Mutex<ScmScanResult>,
    scan_error: Mutex<Option<String>>,
    states: Mutex<HashMap<PathBuf, ScmFormatState>>,
    check_errors: Mutex<HashMap<PathBuf, String>>,
    format_errors: Mutex<HashMap<PathBuf, String>>,
    usage: Mutex<HashMap<PathBuf, MountUsage>>,
    format_delay: Mutex<Option<Duration>>,
    formats: Mutex<Vec<(PathBuf, bool)>>,
    scan_count: AtomicUsize,
}

impl MockScmProvider {
    /// Provider with nothing formatted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan result.
    pub fn set_scan_result(&self, result: ScmScanResult) {
        *self.scan_result.lock() = result;
    }

    /// Fail every scan with `reason`.
    pub fn fail_scan(&self, reason: impl Into<String>) {
        *self.scan_error.lock() = Some(reason.into());
    }

    /// Set the format state of a mountpoint.
    pub fn set_state(&self, mountpoint: impl Into<PathBuf>, state: ScmFormatState) {
        self.states.lock().insert(mountpoint.into(), state);
    }

    /// Fail the format check of a mountpoint.
    pub fn fail_check(&self, mountpoint: impl Into<PathBuf>, reason: impl Into<String>) {
        self.check_errors
            .lock()
            .insert(mountpoint.into(), reason.into());
    }

    /// Fail formatting of a mountpoint.
    pub fn fail_format(&self, mountpoint: impl Into<PathBuf>, reason: impl Into<String>) {
        self.format_errors
            .lock()
            .insert(mountpoint.into(), reason.into());
    }

    /// Set usage reported for a mountpoint.
    pub fn set_usage(&self, mountpoint: impl Into<PathBuf>, usage: MountUsage) {
        self.usage.lock().insert(mountpoint.into(), usage);
    }

    /// Delay every format call.
    pub fn set_format_delay(&self, delay: Duration) {
        *self.format_delay.lock() = Some(delay);
    }

    /// Formats performed so far as `(mountpoint, force)`.
    pub fn formats(&self) -> Vec<(PathBuf, bool)> {
        self.formats.lock().clone()
    }

    /// Number of scan calls.
    pub fn scan_count(&self) -> usize {
        self.scan_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ScmProvider for MockScmProvider {
    async fn scan(&self, _tiers: &[ScmTierConfig]) -> StorageResult<ScmScanResult> {
        self.scan_count.fetch_add(1, Ordering::Relaxed);
        if let Some(reason) = self.scan_error.lock().clone() {
            return Err(mock_err(&reason));
        }
        Ok(self.scan_result.lock().clone())
    }

    async fn check_format(&self, tier: &ScmTierConfig) -> StorageResult<ScmFormatState> {
        if let Some(reason) = self.check_errors.lock().get(&tier.mountpoint) {
            return Err(StorageError::ScmError {
                mountpoint: tier.mountpoint.clone(),
                reason: reason.clone(),
            });
        }
        Ok(self
            .states
            .lock()
            .get(&tier.mountpoint)
            .copied()
            .unwrap_or(ScmFormatState::NeedsFormat))
    }

    async fn format(&self, tier: &ScmTierConfig, force: bool) -> StorageResult<()> {
        let delay = *self.format_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.formats.lock().push((tier.mountpoint.clone(), force));
        if let Some(reason) = self.format_errors.lock().get(&tier.mountpoint) {
            return Err(StorageError::ScmError {
                mountpoint: tier.mountpoint.clone(),
                reason: reason.clone(),
            });
        }
        debug!("mock formatted {}", tier.mountpoint.display());
        self.states
            .lock()
            .insert(tier.mountpoint.clone(), ScmFormatState::Formatted { empty: true });
        Ok(())
    }

    async fn usage(&self, mountpoint: &Path) -> StorageResult<MountUsage> {
        self.usage
            .lock()
            .get(mountpoint)
            .copied()
            .ok_or_else(|| StorageError::ScmError {
                mountpoint: mountpoint.to_path_buf(),
                reason: "not mounted".to_string(),
            })
    }
}

/// System provider returning fixed memory information.
#[derive(Debug, Default)]
pub struct MockSystemProvider {
    mem: Mutex<MemInfo>,
    calls: AtomicUsize,
}

impl MockSystemProvider {
    /// Provider reporting `available_bytes` of available memory.
    pub fn with_available(available_bytes: u64) -> Self {
        Self {
            mem: Mutex::new(MemInfo {
                total_bytes: available_bytes,
                available_bytes,
                ..Default::default()
            }),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `mem_info` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SystemProvider for MockSystemProvider {
    async fn mem_info(&self) -> StorageResult<MemInfo> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(*self.mem.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdev::BdevRoles;

    #[tokio::test]
    async fn test_mock_bdev_scan_restricts_and_scripts() {
        let provider = MockBdevProvider::new(vec![
            NvmeController::new("0000:81:00.0"),
            NvmeController::new("0000:82:00.0"),
        ]);
        provider.push_scan_result(Err("probe failed".to_string()));

        let req = BdevScanRequest::for_devices(vec!["0000:82:00.0".to_string()]);
        assert!(provider.scan(&req).await.is_err());
        let resp = provider.scan(&req).await.unwrap();
        assert_eq!(resp.controllers.len(), 1);
        assert_eq!(resp.controllers[0].pci_addr, "0000:82:00.0");
        assert_eq!(provider.scan_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_bdev_format_device_error() {
        let provider = MockBdevProvider::default();
        provider.fail_device("b", "bad media");
        let tier = BdevTierConfig::nvme(vec!["a".to_string(), "b".to_string()], BdevRoles::none());
        let resp = provider.format(&tier).await.unwrap();
        assert!(resp.devices[0].error.is_none());
        assert_eq!(resp.devices[1].error.as_deref(), Some("bad media"));
    }

    #[tokio::test]
    async fn test_mock_scm_format_transitions_state() {
        let provider = MockScmProvider::new();
        let tier = ScmTierConfig::ramdisk("/mnt/ferrum0", 1 << 30);
        assert_eq!(
            provider.check_format(&tier).await.unwrap(),
            ScmFormatState::NeedsFormat
        );
        provider.format(&tier, false).await.unwrap();
        assert_eq!(
            provider.check_format(&tier).await.unwrap(),
            ScmFormatState::Formatted { empty: true }
        );
        assert_eq!(provider.formats(), vec![(PathBuf::from("/mnt/ferrum0"), false)]);
    }
}
