//! Mount-based SCM provider and `/proc`-backed system facts.
//!
//! Ramdisk tiers are tmpfs mounts sized from configuration. Persistent-memory
//! tiers are formatted with `mkfs.ext4` and mounted with DAX enabled.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::provider::{
    MemInfo, MountUsage, ScmFormatState, ScmProvider, ScmScanResult, SystemProvider,
};
use crate::scm::{ScmClass, ScmMount, ScmNamespace, ScmState, ScmTierConfig};

/// One line of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted device or pseudo-filesystem name.
    pub source: String,
    /// Mountpoint.
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: String,
}

/// Parse a `/proc/self/mounts` style table.
pub fn parse_mounts(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = unescape_mount_field(fields.next()?);
            let target = PathBuf::from(unescape_mount_field(fields.next()?));
            let fstype = fields.next()?.to_string();
            Some(MountEntry {
                source,
                target,
                fstype,
            })
        })
        .collect()
}

// The kernel escapes space, tab, newline and backslash as three-digit octal.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(v) = u8::from_str_radix(oct, 8) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `/proc/meminfo` contents.
pub fn parse_meminfo(contents: &str) -> MemInfo {
    let mut info = MemInfo::default();
    for line in contents.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let Some(value) = parts.next().and_then(|v| v.parse::<u64>().ok()) else {
            continue;
        };
        let scale = match parts.next() {
            Some("kB") => 1024,
            _ => 1,
        };
        match key {
            "MemTotal" => info.total_bytes = value * scale,
            "MemAvailable" => info.available_bytes = value * scale,
            "HugePages_Total" => info.hugepages_total = value,
            "Hugepagesize" => info.hugepage_size = value * scale,
            _ => {}
        }
    }
    info
}

fn scm_err(mountpoint: &Path, reason: impl Into<String>) -> StorageError {
    StorageError::ScmError {
        mountpoint: mountpoint.to_path_buf(),
        reason: reason.into(),
    }
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn statvfs(path: &Path) -> io::Result<MountUsage> {
    let c_path = cstring(path)?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated string and st is a valid out pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let frsize = st.f_frsize as u64;
    Ok(MountUsage {
        total_bytes: st.f_blocks as u64 * frsize,
        avail_bytes: st.f_bavail as u64 * frsize,
    })
}

fn mount(source: &str, target: &Path, fstype: &str, opts: &str) -> io::Result<()> {
    let c_source = CString::new(source).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let c_target = cstring(target)?;
    let c_fstype = CString::new(fstype).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let c_opts = CString::new(opts).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: all pointers come from live CStrings.
    let rc = unsafe {
        libc::mount(
            c_source.as_ptr(),
            c_target.as_ptr(),
            c_fstype.as_ptr(),
            libc::MS_NOATIME,
            c_opts.as_ptr() as *const libc::c_void,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn unmount(target: &Path) -> io::Result<()> {
    let c_target = cstring(target)?;
    // SAFETY: c_target is a valid NUL-terminated string.
    let rc = unsafe { libc::umount2(c_target.as_ptr(), 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn dir_is_empty(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .all(|e| e.file_name() == "lost+found"))
}

/// SCM provider backed by kernel mounts.
#[derive(Debug, Clone)]
pub struct MountScmProvider {
    mounts_path: PathBuf,
    block_class_dir: PathBuf,
}

impl Default for MountScmProvider {
    fn default() -> Self {
        Self::new("/proc/self/mounts", "/sys/class/block")
    }
}

impl MountScmProvider {
    /// Provider reading the mount table at `mounts_path` and block device
    /// attributes under `block_class_dir`.
    pub fn new(mounts_path: impl Into<PathBuf>, block_class_dir: impl Into<PathBuf>) -> Self {
        Self {
            mounts_path: mounts_path.into(),
            block_class_dir: block_class_dir.into(),
        }
    }

    fn mounts(&self) -> io::Result<Vec<MountEntry>> {
        Ok(parse_mounts(&fs::read_to_string(&self.mounts_path)?))
    }

    fn mount_at(&self, mountpoint: &Path) -> io::Result<Option<MountEntry>> {
        Ok(self.mounts()?.into_iter().find(|m| m.target == mountpoint))
    }

    fn pmem_size(&self, device: &str) -> u64 {
        let name = Path::new(device)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        fs::read_to_string(self.block_class_dir.join(&name).join("size"))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|sectors| sectors * 512)
            .unwrap_or(0)
    }

    fn scan_blocking(&self, tiers: &[ScmTierConfig]) -> StorageResult<ScmScanResult> {
        let mounts = self.mounts()?;
        let mut namespaces = Vec::new();

        for tier in tiers {
            let mount = match mounts.iter().find(|m| m.target == tier.mountpoint) {
                Some(_) => {
                    let usage = statvfs(&tier.mountpoint)?;
                    Some(ScmMount {
                        path: tier.mountpoint.clone(),
                        class: tier.class,
                        device_list: tier.device_list.clone(),
                        rank: None,
                        total_bytes: usage.total_bytes,
                        avail_bytes: usage.avail_bytes,
                        usable_bytes: 0,
                    })
                }
                None => None,
            };

            match tier.class {
                ScmClass::Ram => namespaces.push(ScmNamespace {
                    blockdev: "ramdisk".to_string(),
                    name: tier.mountpoint.display().to_string(),
                    size: tier.ramdisk_size.unwrap_or(0),
                    mount,
                    ..Default::default()
                }),
                ScmClass::Dcpm => {
                    for (idx, dev) in tier.device_list.iter().enumerate() {
                        namespaces.push(ScmNamespace {
                            blockdev: dev.trim_start_matches("/dev/").to_string(),
                            size: self.pmem_size(dev),
                            mount: if idx == 0 { mount.clone() } else { None },
                            ..Default::default()
                        });
                    }
                }
            }
        }

        let state = if tiers.iter().any(|t| t.class == ScmClass::Dcpm) {
            ScmState::Unknown
        } else {
            ScmState::NoModules
        };
        Ok(ScmScanResult {
            modules: Vec::new(),
            namespaces,
            state,
        })
    }

    fn check_blocking(&self, tier: &ScmTierConfig) -> StorageResult<ScmFormatState> {
        if self.mount_at(&tier.mountpoint)?.is_none() {
            return Ok(ScmFormatState::NeedsFormat);
        }
        let empty = dir_is_empty(&tier.mountpoint)?;
        Ok(ScmFormatState::Formatted { empty })
    }

    fn format_blocking(&self, tier: &ScmTierConfig, force: bool) -> StorageResult<()> {
        let mp = &tier.mountpoint;
        if self.mount_at(mp)?.is_some() {
            if !force {
                return Err(scm_err(mp, "already mounted, reformat not requested"));
            }
            info!("unmounting {} for reformat", mp.display());
            unmount(mp).map_err(|e| scm_err(mp, format!("unmount: {}", e)))?;
        }
        fs::create_dir_all(mp)?;

        match tier.class {
            ScmClass::Ram => {
                let size = tier
                    .ramdisk_size
                    .filter(|s| *s > 0)
                    .ok_or_else(|| scm_err(mp, "ramdisk size not configured"))?;
                mount("tmpfs", mp, "tmpfs", &format!("mode=0755,size={}", size))
                    .map_err(|e| scm_err(mp, format!("mount tmpfs: {}", e)))?;
            }
            ScmClass::Dcpm => {
                let dev = tier
                    .device_list
                    .first()
                    .ok_or_else(|| scm_err(mp, "no pmem device configured"))?;
                let status = Command::new("mkfs.ext4")
                    .args(["-F", "-q", "-b", "4096", dev])
                    .status()
                    .map_err(|e| scm_err(mp, format!("mkfs.ext4: {}", e)))?;
                if !status.success() {
                    return Err(scm_err(mp, format!("mkfs.ext4 {} exited with {}", dev, status)));
                }
                mount(dev, mp, "ext4", "dax")
                    .map_err(|e| scm_err(mp, format!("mount {}: {}", dev, e)))?;
            }
        }
        info!("formatted {} SCM at {}", tier.class, mp.display());
        Ok(())
    }
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::IoError(io::Error::other(e))
}

#[async_trait]
impl ScmProvider for MountScmProvider {
    async fn scan(&self, tiers: &[ScmTierConfig]) -> StorageResult<ScmScanResult> {
        let this = self.clone();
        let tiers = tiers.to_vec();
        tokio::task::spawn_blocking(move || this.scan_blocking(&tiers))
            .await
            .map_err(join_error)?
    }

    async fn check_format(&self, tier: &ScmTierConfig) -> StorageResult<ScmFormatState> {
        let this = self.clone();
        let tier = tier.clone();
        tokio::task::spawn_blocking(move || this.check_blocking(&tier))
            .await
            .map_err(join_error)?
    }

    async fn format(&self, tier: &ScmTierConfig, force: bool) -> StorageResult<()> {
        let this = self.clone();
        let tier = tier.clone();
        tokio::task::spawn_blocking(move || this.format_blocking(&tier, force))
            .await
            .map_err(join_error)?
    }

    async fn usage(&self, mountpoint: &Path) -> StorageResult<MountUsage> {
        let mountpoint = mountpoint.to_path_buf();
        tokio::task::spawn_blocking(move || {
            statvfs(&mountpoint).map_err(|e| scm_err(&mountpoint, e.to_string()))
        })
        .await
        .map_err(join_error)?
    }
}

/// System provider reading `/proc/meminfo`.
#[derive(Debug, Clone)]
pub struct ProcSystemProvider {
    meminfo_path: PathBuf,
}

impl Default for ProcSystemProvider {
    fn default() -> Self {
        Self::new("/proc/meminfo")
    }
}

impl ProcSystemProvider {
    /// Provider reading the given meminfo file.
    pub fn new(meminfo_path: impl Into<PathBuf>) -> Self {
        Self {
            meminfo_path: meminfo_path.into(),
        }
    }
}

#[async_trait]
impl SystemProvider for ProcSystemProvider {
    async fn mem_info(&self) -> StorageResult<MemInfo> {
        let contents = tokio::fs::read_to_string(&self.meminfo_path).await?;
        let info = parse_meminfo(&contents);
        if info.total_bytes == 0 {
            warn!("{} reported no MemTotal", self.meminfo_path.display());
        }
        debug!(
            total = info.total_bytes,
            available = info.available_bytes,
            "read memory info"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
tmpfs /mnt/ferrum0 tmpfs rw,relatime,size=1048576k 0 0
/dev/pmem1 /mnt/with\\040space ext4 rw,dax 0 0
";

    #[test]
    fn test_parse_mounts() {
        let mounts = parse_mounts(MOUNTS);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[1].target, PathBuf::from("/mnt/ferrum0"));
        assert_eq!(mounts[1].fstype, "tmpfs");
        assert_eq!(mounts[2].target, PathBuf::from("/mnt/with space"));
        assert_eq!(mounts[2].source, "/dev/pmem1");
    }

    #[test]
    fn test_parse_meminfo() {
        let info = parse_meminfo(
            "MemTotal:       16384 kB\nMemFree: 100 kB\nMemAvailable:    8192 kB\n\
             HugePages_Total:     512\nHugepagesize:       2048 kB\n",
        );
        assert_eq!(info.total_bytes, 16384 * 1024);
        assert_eq!(info.available_bytes, 8192 * 1024);
        assert_eq!(info.hugepages_total, 512);
        assert_eq!(info.hugepage_size, 2048 * 1024);
    }

    fn provider_with_mount(tmp: &TempDir, mounted: Option<&Path>) -> MountScmProvider {
        let table = match mounted {
            Some(p) => format!("tmpfs {} tmpfs rw 0 0\n", p.display()),
            None => String::new(),
        };
        let mounts = tmp.path().join("mounts");
        fs::write(&mounts, table).unwrap();
        MountScmProvider::new(mounts, tmp.path().join("block"))
    }

    #[tokio::test]
    async fn test_check_format_unmounted_needs_format() {
        let tmp = TempDir::new().unwrap();
        let provider = provider_with_mount(&tmp, None);
        let tier = ScmTierConfig::ramdisk(tmp.path().join("scm"), 1 << 30);
        assert_eq!(
            provider.check_format(&tier).await.unwrap(),
            ScmFormatState::NeedsFormat
        );
    }

    #[tokio::test]
    async fn test_check_format_mounted_reports_emptiness() {
        let tmp = TempDir::new().unwrap();
        let mp = tmp.path().join("scm");
        fs::create_dir_all(&mp).unwrap();
        let provider = provider_with_mount(&tmp, Some(&mp));
        let tier = ScmTierConfig::ramdisk(&mp, 1 << 30);

        assert_eq!(
            provider.check_format(&tier).await.unwrap(),
            ScmFormatState::Formatted { empty: true }
        );
        fs::write(mp.join("pool"), b"x").unwrap();
        assert_eq!(
            provider.check_format(&tier).await.unwrap(),
            ScmFormatState::Formatted { empty: false }
        );
    }

    #[tokio::test]
    async fn test_format_mounted_without_force_fails() {
        let tmp = TempDir::new().unwrap();
        let mp = tmp.path().join("scm");
        fs::create_dir_all(&mp).unwrap();
        let provider = provider_with_mount(&tmp, Some(&mp));
        let err = provider
            .format(&ScmTierConfig::ramdisk(&mp, 1 << 30), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ScmError { .. }));
    }

    #[tokio::test]
    async fn test_scan_reports_ramdisk_pseudo_namespace() {
        let tmp = TempDir::new().unwrap();
        let mp = tmp.path().join("scm");
        fs::create_dir_all(&mp).unwrap();
        let provider = provider_with_mount(&tmp, Some(&mp));
        let unmounted = tmp.path().join("scm1");

        let result = provider
            .scan(&[
                ScmTierConfig::ramdisk(&mp, 1 << 30),
                ScmTierConfig::ramdisk(&unmounted, 1 << 30),
            ])
            .await
            .unwrap();
        assert_eq!(result.state, ScmState::NoModules);
        assert_eq!(result.namespaces.len(), 2);
        let mount = result.namespaces[0].mount.as_ref().unwrap();
        assert_eq!(mount.path, mp);
        assert!(mount.total_bytes > 0);
        assert!(result.namespaces[1].mount.is_none());
    }

    #[tokio::test]
    async fn test_proc_system_provider() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("meminfo");
        fs::write(&path, "MemTotal: 2048 kB\nMemAvailable: 1024 kB\n").unwrap();
        let info = ProcSystemProvider::new(&path).mem_info().await.unwrap();
        assert_eq!(info.total_bytes, 2048 * 1024);
        assert_eq!(info.available_bytes, 1024 * 1024);
    }
}
