//! Configuration management for the templar CLI.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use templar_hypervisor::pve::{DEFAULT_PVESM, DEFAULT_QM};
use templar_lifecycle::{AttachSettings, CacheSettings, RepairSettings, TemplateRegistry, VmSettings};

use crate::cli::{Args, Command};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/templar/templar.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hypervisor backend configuration
    pub hypervisor: HypervisorConfig,
    /// Storage pool selection
    pub storage: StorageConfig,
    /// Image cache
    pub cache: CacheSettings,
    /// Template VM hardware
    pub vm: VmSettings,
    /// Partition wait after attaching a disk
    pub attach: AttachSettings,
    /// Boot configuration repair
    pub repair: RepairSettings,
    /// Template catalog; the built-in catalog when not set
    pub templates: TemplateRegistry,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse and validate YAML configuration text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Failed to parse config file")?;
        config.templates.validate().context("Invalid template catalog")?;
        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
        }

        if let Command::Provision(provision) = &args.command {
            if let Some(ref pool) = provision.storage {
                self.storage.pool = Some(pool.clone());
            }
        }

        self
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// Path of the `qm` binary
    pub qm: String,
    /// Path of the `pvesm` binary
    pub pvesm: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::Pve,
            qm: DEFAULT_QM.to_string(),
            pvesm: DEFAULT_PVESM.to_string(),
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// Proxmox VE via qm/pvesm
    #[default]
    Pve,
    /// In-memory backend for development
    Mock,
}

/// Storage pool selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Pool for template disks; auto-selected when not set
    pub pool: Option<String>,
}
