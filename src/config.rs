use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub proxmox: ProxmoxConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub defaults: VmDefaults,

    #[serde(default)]
    pub provisioning: ProvisioningConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        serde_json::from_str(&text).map_err(|e| Error::Config {
            reason: format!("cannot parse {}: {e}", path.display()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,
    pub password: String,

    /// Authentication realm sent with the ticket request.
    #[serde(default = "default_realm")]
    pub realm: String,

    /// The node that all VM operations target.
    pub node: String,

    /// Proxmox hosts usually run with a self-signed certificate.
    #[serde(default)]
    pub allow_invalid_cert: bool,

    /// Retries for transient transport failures.
    /// Zero disables the retry middleware entirely.
    #[serde(default)]
    pub max_retries: u32,
}

fn default_port() -> u16 {
    8006
}

fn default_realm() -> String {
    "pam".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection string.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://vms.db?mode=rwc".to_string(),
        }
    }
}

/// Values used by VM creation when the caller leaves a field unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefaults {
    pub cores: u32,

    /// In MiB, the hypervisor's unit.
    pub memory_mib: u64,

    /// Disk size passed to the storage, in GiB.
    pub disk: u32,

    pub storage: String,
    pub template: String,
    pub bridge: String,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            cores: 1,
            memory_mib: 512,
            disk: 8,
            storage: "local-lvm".to_string(),
            template: "ubuntu-22.04-template".to_string(),
            bridge: "vmbr0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// How many candidate VMIDs to try before giving up.
    pub max_vmid_attempts: u32,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_vmid_attempts: 5,
        }
    }
}
