//! NVMe discovery and driver binding through sysfs.
//!
//! Controllers bound to the kernel `nvme` driver show up under
//! `class/nvme`. Controllers already handed to a user-space driver only
//! exist under `bus/pci/devices` and are reported with their address alone.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::bdev::{NvmeController, NvmeNamespace};

/// Driver devices are bound to for user-space access.
pub const USERSPACE_DRIVER: &str = "vfio-pci";

/// Sector size used by the `size` attribute of block devices.
const SECTOR_SIZE: u64 = 512;

/// Pool of default-sized (2 MiB) hugepages, relative to the sysfs root.
const HUGEPAGES_DIR: &str = "kernel/mm/hugepages/hugepages-2048kB";

/// Sysfs accessor rooted at a configurable path.
#[derive(Debug, Clone)]
pub struct SysfsNvme {
    root: PathBuf,
}

impl Default for SysfsNvme {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsNvme {
    /// Accessor rooted at `root` (normally `/sys`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn class_dir(&self) -> PathBuf {
        self.root.join("class/nvme")
    }

    fn pci_device_dir(&self, pci_addr: &str) -> PathBuf {
        self.root.join("bus/pci/devices").join(pci_addr)
    }

    /// Enumerate controllers bound to the kernel driver.
    pub fn discover(&self) -> io::Result<Vec<NvmeController>> {
        let dir = self.class_dir();
        if !dir.exists() {
            debug!("{} missing, no kernel-bound NVMe controllers", dir.display());
            return Ok(Vec::new());
        }

        let mut entries: Vec<_> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();

        let mut controllers = Vec::new();
        for path in entries {
            let Some(address) = read_attr(&path.join("address")) else {
                continue;
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let socket_id = read_attr(&path.join("device/numa_node"))
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(0)
                .max(0);

            controllers.push(NvmeController {
                pci_addr: address,
                model: read_attr(&path.join("model")).unwrap_or_default(),
                serial: read_attr(&path.join("serial")).unwrap_or_default(),
                fw_rev: read_attr(&path.join("firmware_rev")).unwrap_or_default(),
                socket_id,
                namespaces: read_namespaces(&path, &name),
                ..Default::default()
            });
        }
        Ok(controllers)
    }

    /// Controller record for a PCI device not bound to the kernel driver.
    pub fn pci_device(&self, pci_addr: &str) -> Option<NvmeController> {
        let dir = self.pci_device_dir(pci_addr);
        if !dir.exists() {
            return None;
        }
        let socket_id = read_attr(&dir.join("numa_node"))
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(0)
            .max(0);
        Some(NvmeController {
            pci_addr: pci_addr.to_string(),
            socket_id,
            ..Default::default()
        })
    }

    /// Bind a device to `driver`, or back to its default driver when `None`.
    pub fn bind(&self, pci_addr: &str, driver: Option<&str>) -> io::Result<()> {
        let dir = self.pci_device_dir(pci_addr);
        if !dir.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("PCI device {} not found", pci_addr),
            ));
        }

        fs::write(dir.join("driver_override"), driver.unwrap_or("\n"))?;
        let unbind = dir.join("driver/unbind");
        if unbind.exists() {
            fs::write(&unbind, pci_addr)?;
        }
        fs::write(self.root.join("bus/pci/drivers_probe"), pci_addr)?;

        info!(
            "bound {} to {}",
            pci_addr,
            driver.unwrap_or("default driver")
        );
        Ok(())
    }

    /// Request `count` 2 MiB hugepages and return how many the kernel
    /// actually reserved, which may be fewer under memory pressure.
    pub fn set_nr_hugepages(&self, count: u32) -> io::Result<u32> {
        let path = self.root.join(HUGEPAGES_DIR).join("nr_hugepages");
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found, hugepages unsupported", path.display()),
            ));
        }
        fs::write(&path, count.to_string())?;
        let allocated = read_attr(&path)
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unreadable {}", path.display()),
                )
            })?;
        info!("{} of {} hugepages allocated", allocated, count);
        Ok(allocated)
    }
}

fn read_attr(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_namespaces(ctrlr_dir: &Path, ctrlr_name: &str) -> Vec<NvmeNamespace> {
    let Ok(entries) = fs::read_dir(ctrlr_dir) else {
        return Vec::new();
    };
    let prefix = format!("{}n", ctrlr_name);
    let mut namespaces: Vec<NvmeNamespace> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            let id = name.strip_prefix(&prefix)?.parse::<u32>().ok()?;
            let sectors = read_attr(&e.path().join("size"))?.parse::<u64>().ok()?;
            Some(NvmeNamespace {
                id,
                size: sectors * SECTOR_SIZE,
            })
        })
        .collect();
    namespaces.sort_by_key(|ns| ns.id);
    namespaces
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn fake_controller(root: &Path, name: &str, addr: &str) {
        let dir = root.join("class/nvme").join(name);
        write(&dir.join("address"), &format!("{}\n", addr));
        write(&dir.join("model"), "Fake NVMe  \n");
        write(&dir.join("serial"), "SN123\n");
        write(&dir.join("firmware_rev"), "1.0\n");
        write(&dir.join("device/numa_node"), "1\n");
        write(&dir.join(format!("{}n1/size", name)), "2048\n");
        write(&dir.join(format!("{}n2/size", name)), "1024\n");
    }

    #[test]
    fn test_discover_reads_attributes() {
        let tmp = TempDir::new().unwrap();
        fake_controller(tmp.path(), "nvme1", "0000:82:00.0");
        fake_controller(tmp.path(), "nvme0", "0000:81:00.0");

        let ctrlrs = SysfsNvme::new(tmp.path()).discover().unwrap();
        assert_eq!(ctrlrs.len(), 2);
        assert_eq!(ctrlrs[0].pci_addr, "0000:81:00.0");
        assert_eq!(ctrlrs[0].model, "Fake NVMe");
        assert_eq!(ctrlrs[0].serial, "SN123");
        assert_eq!(ctrlrs[0].socket_id, 1);
        assert_eq!(ctrlrs[0].namespaces.len(), 2);
        assert_eq!(ctrlrs[0].namespaces[0].size, 2048 * 512);
        assert_eq!(ctrlrs[0].total_bytes(), 3072 * 512);
    }

    #[test]
    fn test_discover_without_class_dir() {
        let tmp = TempDir::new().unwrap();
        assert!(SysfsNvme::new(tmp.path()).discover().unwrap().is_empty());
    }

    #[test]
    fn test_bind_writes_override_and_probe() {
        let tmp = TempDir::new().unwrap();
        let dev = tmp.path().join("bus/pci/devices/0000:81:00.0");
        write(&dev.join("driver_override"), "");
        write(&dev.join("driver/unbind"), "");
        write(&tmp.path().join("bus/pci/drivers_probe"), "");

        let sysfs = SysfsNvme::new(tmp.path());
        sysfs.bind("0000:81:00.0", Some(USERSPACE_DRIVER)).unwrap();

        assert_eq!(fs::read_to_string(dev.join("driver_override")).unwrap(), USERSPACE_DRIVER);
        assert_eq!(fs::read_to_string(dev.join("driver/unbind")).unwrap(), "0000:81:00.0");
        assert_eq!(
            fs::read_to_string(tmp.path().join("bus/pci/drivers_probe")).unwrap(),
            "0000:81:00.0"
        );
    }

    #[test]
    fn test_bind_missing_device() {
        let tmp = TempDir::new().unwrap();
        let err = SysfsNvme::new(tmp.path()).bind("0000:99:00.0", None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_pci_device_lookup() {
        let tmp = TempDir::new().unwrap();
        write(&tmp.path().join("bus/pci/devices/0000:81:00.0/numa_node"), "-1\n");
        let sysfs = SysfsNvme::new(tmp.path());
        let ctrlr = sysfs.pci_device("0000:81:00.0").unwrap();
        assert_eq!(ctrlr.socket_id, 0);
        assert!(sysfs.pci_device("0000:82:00.0").is_none());
    }

    #[test]
    fn test_set_nr_hugepages() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(HUGEPAGES_DIR).join("nr_hugepages");
        write(&path, "0\n");

        let sysfs = SysfsNvme::new(tmp.path());
        assert_eq!(sysfs.set_nr_hugepages(4096).unwrap(), 4096);
        assert_eq!(fs::read_to_string(&path).unwrap(), "4096");
    }

    #[test]
    fn test_set_nr_hugepages_without_pool() {
        let tmp = TempDir::new().unwrap();
        let err = SysfsNvme::new(tmp.path()).set_nr_hugepages(16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
