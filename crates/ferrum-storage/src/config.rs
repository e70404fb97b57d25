//! Per-engine storage configuration.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bdev::{BdevRoles, BdevTierConfig};
use crate::capacity::MIB;
use crate::error::{StorageError, StorageResult};
use crate::scm::{ScmClass, ScmTierConfig};

/// Engine environment variable overriding the RDB size, in MiB.
pub const MD_CAP_ENV: &str = "FERRUM_MD_CAP";

/// RDB size used when no override is configured.
pub const DEFAULT_RDB_SIZE: u64 = 128 * MIB;

/// Location of the node-wide control-plane metadata store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMetadataConfig {
    /// Directory holding control-plane metadata.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Block device formatted and mounted at `path`, if any.
    #[serde(default)]
    pub device: Option<String>,
}

impl ControlMetadataConfig {
    /// True if a dedicated control-metadata path is configured.
    pub fn has_path(&self) -> bool {
        self.path
            .as_ref()
            .is_some_and(|p| !p.as_os_str().is_empty())
    }
}

/// Storage configuration of one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStorageConfig {
    /// Number of I/O targets the engine runs.
    pub target_count: u32,
    /// The engine's SCM tier.
    pub scm: ScmTierConfig,
    /// NVMe/emulated bdev tiers, in configuration order.
    #[serde(default)]
    pub bdev_tiers: Vec<BdevTierConfig>,
    /// Environment of the engine process as `KEY=VALUE` strings.
    #[serde(default)]
    pub env_vars: Vec<String>,
}

impl EngineStorageConfig {
    /// All configured bdev addresses, in tier and device-list order.
    pub fn bdev_addresses(&self) -> Vec<String> {
        self.bdev_tiers
            .iter()
            .flat_map(|t| t.device_list.iter().cloned())
            .collect()
    }

    /// Configured addresses of NVMe-class tiers only.
    pub fn nvme_addresses(&self) -> Vec<String> {
        self.bdev_tiers
            .iter()
            .filter(|t| t.is_nvme())
            .flat_map(|t| t.device_list.iter().cloned())
            .collect()
    }

    /// True if any bdev device is configured.
    pub fn has_bdevs(&self) -> bool {
        self.bdev_tiers.iter().any(|t| !t.device_list.is_empty())
    }

    /// True if some bdev tier carries the metadata role.
    pub fn has_bdev_meta_role(&self) -> bool {
        self.bdev_tiers
            .iter()
            .any(|t| t.roles.contains(BdevRoles::META))
    }

    /// Tier that lists `addr`, if any.
    pub fn tier_for_address(&self, addr: &str) -> Option<&BdevTierConfig> {
        self.bdev_tiers
            .iter()
            .find(|t| t.device_list.iter().any(|d| d == addr))
    }

    /// Value of an engine environment variable.
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env_vars.iter().rev().find_map(|kv| {
            let (key, value) = kv.split_once('=')?;
            (key == name).then_some(value)
        })
    }

    /// RDB reservation size in bytes from the engine's metadata-capacity
    /// override.
    ///
    /// Absent override yields the default; an unparsable one is an error.
    pub fn rdb_size(&self) -> StorageResult<u64> {
        let Some(raw) = self.env_var(MD_CAP_ENV) else {
            return Ok(DEFAULT_RDB_SIZE);
        };
        let mib: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
            StorageError::InvalidMdCap {
                var: MD_CAP_ENV,
                value: raw.to_string(),
                reason: e.to_string(),
            }
        })?;
        let bytes = mib.saturating_mul(MIB);
        if bytes < DEFAULT_RDB_SIZE {
            warn!(
                "metadata capacity {} MiB too low; using {} MiB",
                mib,
                DEFAULT_RDB_SIZE / MIB
            );
            return Ok(DEFAULT_RDB_SIZE);
        }
        Ok(bytes)
    }

    /// Check the engine storage section for internal consistency.
    pub fn validate(&self) -> StorageResult<()> {
        if self.target_count == 0 {
            return Err(StorageError::InvalidConfig(
                "target_count must be nonzero".to_string(),
            ));
        }
        match self.scm.class {
            ScmClass::Ram if self.scm.ramdisk_size.unwrap_or(0) == 0 => {
                return Err(StorageError::InvalidConfig(format!(
                    "ramdisk SCM at {} requires ramdisk_size",
                    self.scm.mountpoint.display()
                )));
            }
            ScmClass::Dcpm if self.scm.device_list.is_empty() => {
                return Err(StorageError::InvalidConfig(format!(
                    "dcpm SCM at {} requires device_list",
                    self.scm.mountpoint.display()
                )));
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for addr in self.bdev_addresses() {
            if !seen.insert(addr.clone()) {
                return Err(StorageError::InvalidConfig(format!(
                    "bdev {} listed more than once",
                    addr
                )));
            }
        }

        let role_tagged = self.bdev_tiers.iter().any(|t| !t.roles.is_empty());
        if role_tagged {
            if self.bdev_tiers.iter().any(|t| t.roles.is_empty()) {
                return Err(StorageError::InvalidConfig(
                    "cannot mix role-tagged and legacy bdev tiers".to_string(),
                ));
            }
            if !self
                .bdev_tiers
                .iter()
                .any(|t| t.roles.contains(BdevRoles::DATA))
            {
                return Err(StorageError::InvalidConfig(
                    "role-tagged bdev tiers need at least one data tier".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_cfg() -> EngineStorageConfig {
        EngineStorageConfig {
            target_count: 8,
            scm: ScmTierConfig::ramdisk("/mnt/ferrum0", 16 << 30),
            bdev_tiers: vec![BdevTierConfig::nvme(
                vec!["0000:81:00.0".to_string(), "0000:82:00.0".to_string()],
                BdevRoles::none(),
            )],
            env_vars: vec![],
        }
    }

    #[test]
    fn test_rdb_size_default() {
        assert_eq!(engine_cfg().rdb_size().unwrap(), DEFAULT_RDB_SIZE);
    }

    #[test]
    fn test_rdb_size_override() {
        let mut cfg = engine_cfg();
        cfg.env_vars = vec![format!("{}=1024", MD_CAP_ENV)];
        assert_eq!(cfg.rdb_size().unwrap(), 1024 * MIB);
    }

    #[test]
    fn test_rdb_size_override_below_default_clamped() {
        let mut cfg = engine_cfg();
        cfg.env_vars = vec![format!("{}=16", MD_CAP_ENV)];
        assert_eq!(cfg.rdb_size().unwrap(), DEFAULT_RDB_SIZE);
    }

    #[test]
    fn test_rdb_size_unparsable() {
        let mut cfg = engine_cfg();
        cfg.env_vars = vec![format!("{}=big", MD_CAP_ENV)];
        assert!(matches!(
            cfg.rdb_size(),
            Err(StorageError::InvalidMdCap { .. })
        ));
    }

    #[test]
    fn test_env_var_last_wins() {
        let mut cfg = engine_cfg();
        cfg.env_vars = vec!["A=1".to_string(), "B=2".to_string(), "A=3".to_string()];
        assert_eq!(cfg.env_var("A"), Some("3"));
        assert_eq!(cfg.env_var("C"), None);
    }

    #[test]
    fn test_validate_duplicate_bdev() {
        let mut cfg = engine_cfg();
        cfg.bdev_tiers.push(BdevTierConfig::nvme(
            vec!["0000:81:00.0".to_string()],
            BdevRoles::none(),
        ));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_roles_need_data() {
        let mut cfg = engine_cfg();
        cfg.bdev_tiers = vec![
            BdevTierConfig::nvme(vec!["a".to_string()], BdevRoles::WAL),
            BdevTierConfig::nvme(vec!["b".to_string()], BdevRoles::META),
        ];
        assert!(cfg.validate().is_err());

        cfg.bdev_tiers[1].roles = BdevRoles::META | BdevRoles::DATA;
        assert!(cfg.validate().is_ok());
        assert!(cfg.has_bdev_meta_role());
    }

    #[test]
    fn test_validate_ramdisk_size_required() {
        let mut cfg = engine_cfg();
        cfg.scm.ramdisk_size = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_control_metadata_has_path() {
        assert!(!ControlMetadataConfig::default().has_path());
        let md = ControlMetadataConfig {
            path: Some(PathBuf::from("/var/ferrum/md")),
            device: None,
        };
        assert!(md.has_path());
    }
}
