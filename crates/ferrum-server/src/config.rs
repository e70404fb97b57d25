//! Node configuration for the storage control service.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ferrum_storage::{ControlMetadataConfig, EngineStorageConfig};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// File name of the device-local NVMe config inside the SCM mount.
pub const NVME_CONFIG_FILE: &str = "ferrum_nvme.conf";

/// One locally managed engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine index on this node.
    pub index: u32,
    /// Storage section.
    #[serde(flatten)]
    pub storage: EngineStorageConfig,
    /// Override for the device-local NVMe config path.
    #[serde(default)]
    pub nvme_config_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Where the engine's device-local NVMe config is written.
    pub fn nvme_config_path(&self) -> PathBuf {
        self.nvme_config_path
            .clone()
            .unwrap_or_else(|| self.storage.scm.mountpoint.join(NVME_CONFIG_FILE))
    }
}

/// Storage control service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Node name used in log output.
    pub name: String,
    /// Run without hugepages; NVMe access is then impossible.
    pub disable_hugepages: bool,
    /// Hugepages to reserve when preparing devices.
    pub nr_hugepages: u32,
    /// Node-wide control-plane metadata store.
    pub control_metadata: ControlMetadataConfig,
    /// Engines managed by this node.
    pub engines: Vec<EngineConfig>,
    /// Interval between engine readiness checks during scans.
    pub ready_poll_interval_ms: u64,
    /// Longest wait for a started engine to become ready.
    pub ready_timeout_ms: u64,
    /// Root of the sysfs tree used for NVMe discovery.
    pub sysfs_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::from("localhost"),
            disable_hugepages: false,
            nr_hugepages: 4096,
            control_metadata: ControlMetadataConfig::default(),
            engines: Vec::new(),
            ready_poll_interval_ms: 250,
            ready_timeout_ms: 5000,
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ServerConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ServerConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Readiness poll interval.
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms.max(1))
    }

    /// Readiness wait budget.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Engine with the given index.
    pub fn engine(&self, index: u32) -> Option<&EngineConfig> {
        self.engines.iter().find(|e| e.index == index)
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> ServerResult<()> {
        if self.engines.is_empty() {
            return Err(ServerError::Config("no engines configured".to_string()));
        }

        let mut indexes = HashSet::new();
        let mut mountpoints = HashSet::new();
        let mut bdevs = HashSet::new();
        for engine in &self.engines {
            if !indexes.insert(engine.index) {
                return Err(ServerError::Config(format!(
                    "engine index {} used more than once",
                    engine.index
                )));
            }
            engine.storage.validate().map_err(|e| ServerError::Engine {
                index: engine.index,
                reason: e.to_string(),
            })?;
            if !mountpoints.insert(engine.storage.scm.mountpoint.clone()) {
                return Err(ServerError::Config(format!(
                    "SCM mountpoint {} shared by more than one engine",
                    engine.storage.scm.mountpoint.display()
                )));
            }
            for addr in engine.storage.bdev_addresses() {
                if !bdevs.insert(addr.clone()) {
                    return Err(ServerError::Config(format!(
                        "bdev {} assigned to more than one engine",
                        addr
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrum_storage::{BdevRoles, BdevTierConfig, ScmClass, ScmTierConfig};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn engine(index: u32, mountpoint: &str, bdevs: &[&str]) -> EngineConfig {
        EngineConfig {
            index,
            storage: EngineStorageConfig {
                target_count: 4,
                scm: ScmTierConfig::ramdisk(mountpoint, 1 << 30),
                bdev_tiers: vec![BdevTierConfig::nvme(
                    bdevs.iter().map(|s| s.to_string()).collect(),
                    BdevRoles::none(),
                )],
                env_vars: vec![],
            },
            nvme_config_path: None,
        }
    }

    #[test]
    fn test_default_values() {
        let config = ServerConfig::default();
        assert!(!config.disable_hugepages);
        assert!(config.engines.is_empty());
        assert_eq!(config.ready_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.sysfs_root, PathBuf::from("/sys"));
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
name = "node-a"
disable_hugepages = true

[control_metadata]
path = "/var/lib/ferrum/control"

[[engines]]
index = 0
target_count = 8
env_vars = ["FERRUM_MD_CAP=1024"]

[engines.scm]
class = "ram"
mountpoint = "/mnt/ferrum0"
ramdisk_size = 17179869184

[[engines.bdev_tiers]]
device_list = ["0000:81:00.0"]
roles = 3

[[engines.bdev_tiers]]
device_list = ["0000:82:00.0", "0000:83:00.0"]
roles = 4
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "node-a");
        assert!(config.disable_hugepages);
        assert_eq!(config.engines.len(), 1);
        let e = &config.engines[0];
        assert_eq!(e.storage.target_count, 8);
        assert_eq!(e.storage.scm.class, ScmClass::Ram);
        assert_eq!(e.storage.bdev_tiers[0].roles, BdevRoles::WAL | BdevRoles::META);
        assert_eq!(e.storage.bdev_tiers[1].device_list.len(), 2);
        assert_eq!(e.storage.rdb_size().unwrap(), 1024 << 20);
        assert_eq!(
            e.nvme_config_path(),
            PathBuf::from("/mnt/ferrum0").join(NVME_CONFIG_FILE)
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "engines": [{{
                    "index": 1,
                    "target_count": 2,
                    "scm": {{"mountpoint": "/mnt/ferrum1", "ramdisk_size": 1073741824}},
                    "nvme_config_path": "/etc/ferrum/nvme1.conf"
                }}]
            }}"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.engines[0].index, 1);
        assert_eq!(
            config.engines[0].nvme_config_path(),
            PathBuf::from("/etc/ferrum/nvme1.conf")
        );
        assert_eq!(config.ready_timeout_ms, 5000);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ServerConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_shared_bdev() {
        let config = ServerConfig {
            engines: vec![
                engine(0, "/mnt/a", &["0000:81:00.0"]),
                engine(1, "/mnt/b", &["0000:81:00.0"]),
            ],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_index_and_mount() {
        let dup_index = ServerConfig {
            engines: vec![engine(0, "/mnt/a", &[]), engine(0, "/mnt/b", &[])],
            ..Default::default()
        };
        assert!(dup_index.validate().is_err());

        let dup_mount = ServerConfig {
            engines: vec![engine(0, "/mnt/a", &[]), engine(1, "/mnt/a", &[])],
            ..Default::default()
        };
        assert!(dup_mount.validate().is_err());
    }

    #[test]
    fn test_validate_requires_engines() {
        assert!(ServerConfig::default().validate().is_err());
    }
}
