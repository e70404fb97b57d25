//! Command-line front end; every command prints its response as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ferrum_storage::{
    BdevPrepareRequest, LocalBdevProvider, MountScmProvider, NvmeScanRequest, ProcSystemProvider,
    ScmScanRequest, SysfsNvme,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::format::StorageFormatRequest;
use crate::service::{
    NvmeAddDeviceRequest, NvmeRebindRequest, StorageControlService, StorageScanRequest,
};

/// Parsed command line.
#[derive(Parser)]
#[command(name = "ferrum-server")]
#[command(about = "Ferrum node storage control", long_about = None)]
pub struct Cli {
    /// Server configuration file (TOML or JSON).
    #[arg(short, long, env = "FERRUM_CONFIG", default_value = "/etc/ferrum/server.toml")]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Command to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[allow(missing_docs)]
#[derive(Subcommand)]
pub enum Command {
    /// Scan SCM and NVMe storage.
    Scan {
        #[arg(long)]
        health: bool,
        /// Include per-rank device metadata.
        #[arg(long)]
        meta: bool,
        #[arg(long)]
        basic: bool,
        /// Fraction of metadata held in memory (0 < ratio <= 1).
        #[arg(long, default_value = "0")]
        mem_ratio: f32,
        /// Fill SCM mount usage.
        #[arg(long)]
        usage: bool,
    },
    /// Format SCM and NVMe storage of every engine.
    Format {
        #[arg(long)]
        reformat: bool,
        /// Rejoin under the previous ranks.
        #[arg(long)]
        replace: bool,
    },
    /// Bind NVMe devices to the user-space driver.
    Prepare {
        /// Devices to bind; all configured bdevs when empty.
        #[arg(long = "pci-allow", value_delimiter = ',')]
        pci_allow: Vec<String>,
        /// Hand the devices back to the kernel driver.
        #[arg(long)]
        reset: bool,
        #[arg(long, default_value = "")]
        target_user: String,
        /// Hugepages to reserve; 0 uses the configured count.
        #[arg(long, default_value = "0")]
        nr_hugepages: u32,
    },
    /// Rebind a single device to the user-space driver.
    Rebind { pci_addr: String },
    /// Add a device to an engine's NVMe tier.
    AddDevice {
        pci_addr: String,
        #[arg(short, long, default_value = "0")]
        engine: u32,
        #[arg(short, long)]
        tier: Option<usize>,
    },
    /// Print the effective configuration.
    ShowConfig,
}

impl Cli {
    /// Load the configuration and execute the command.
    pub async fn run(self) -> Result<()> {
        let config = ServerConfig::from_file(&self.config)?;
        if let Command::ShowConfig = self.command {
            return print_json(&config);
        }

        let service = StorageControlService::from_config(
            &config,
            Arc::new(LocalBdevProvider::new(SysfsNvme::new(config.sysfs_root.clone()))),
            Arc::new(MountScmProvider::default()),
            Arc::new(ProcSystemProvider::default()),
        )
        .map_err(with_resolution)?;

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling");
                on_signal.cancel();
            }
        });

        match self.command {
            Command::Scan {
                health,
                meta,
                basic,
                mem_ratio,
                usage,
            } => {
                let req = StorageScanRequest {
                    nvme: NvmeScanRequest {
                        health,
                        meta,
                        basic,
                        mem_ratio,
                        ..Default::default()
                    },
                    scm: ScmScanRequest { usage },
                };
                let resp = service
                    .storage_scan(&req, &cancel)
                    .await
                    .map_err(with_resolution)?;
                print_json(&resp)
            }
            Command::Format { reformat, replace } => {
                let req = StorageFormatRequest { reformat, replace };
                let resp = service
                    .storage_format(&req, &cancel)
                    .await
                    .map_err(with_resolution)?;
                print_json(&resp)
            }
            Command::Prepare {
                pci_allow,
                reset,
                target_user,
                nr_hugepages,
            } => {
                let req = BdevPrepareRequest {
                    pci_allow_list: pci_allow,
                    target_user,
                    reset,
                    nr_hugepages,
                };
                let resp = service.prepare(&req).await.map_err(with_resolution)?;
                print_json(&resp)
            }
            Command::Rebind { pci_addr } => {
                print_json(&service.nvme_rebind(&NvmeRebindRequest { pci_addr }).await)
            }
            Command::AddDevice {
                pci_addr,
                engine,
                tier,
            } => {
                let req = NvmeAddDeviceRequest {
                    pci_addr,
                    engine_index: engine,
                    tier_index: tier,
                };
                print_json(&service.nvme_add_device(&req).await)
            }
            Command::ShowConfig => print_json(&config),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn with_resolution(err: ServerError) -> anyhow::Error {
    match err.resolution() {
        Some(hint) => anyhow::anyhow!("{}\nresolution: {}", err, hint),
        None => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scan_flags() {
        let cli = Cli::try_parse_from([
            "ferrum-server",
            "--config",
            "/tmp/node.toml",
            "scan",
            "--meta",
            "--mem-ratio",
            "0.5",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/node.toml"));
        match cli.command {
            Command::Scan {
                meta, mem_ratio, ..
            } => {
                assert!(meta);
                assert_eq!(mem_ratio, 0.5);
            }
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn test_parse_add_device() {
        let cli = Cli::try_parse_from([
            "ferrum-server",
            "add-device",
            "0000:85:00.0",
            "--engine",
            "1",
            "--tier",
            "2",
        ])
        .unwrap();
        match cli.command {
            Command::AddDevice {
                pci_addr,
                engine,
                tier,
            } => {
                assert_eq!(pci_addr, "0000:85:00.0");
                assert_eq!(engine, 1);
                assert_eq!(tier, Some(2));
            }
            _ => panic!("expected add-device"),
        }
    }

    #[test]
    fn test_parse_prepare_allow_list() {
        let cli = Cli::try_parse_from([
            "ferrum-server",
            "prepare",
            "--pci-allow",
            "0000:81:00.0,0000:82:00.0",
        ])
        .unwrap();
        match cli.command {
            Command::Prepare {
                pci_allow,
                reset,
                nr_hugepages,
                ..
            } => {
                assert_eq!(pci_allow.len(), 2);
                assert!(!reset);
                assert_eq!(nr_hugepages, 0);
            }
            _ => panic!("expected prepare"),
        }
    }

    #[test]
    fn test_resolution_is_attached() {
        let err = with_resolution(ServerError::HugepagesDisabled);
        assert!(err.to_string().contains("resolution:"));
        let plain = with_resolution(ServerError::Cancelled);
        assert!(!plain.to_string().contains("resolution:"));
    }
}
