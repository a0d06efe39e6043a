//! Payloads exchanged with the Proxmox API.
//!
//! Response structs name the fields this crate reads and keep everything else
//! in `extra`, so callers still get the full passthrough payload.

use serde::{Deserialize, Deserializer, Serialize};

/// `/nodes/{node}/qemu/{vmid}/status/current`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmCurrentStatus {
    /// "running" or "stopped".
    pub status: String,

    /// Finer-grained QEMU state, e.g. "paused".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qmpstatus: Option<String>,

    /// Seconds.
    #[serde(default, deserialize_with = "opt_number", skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `/nodes/{node}/qemu/{vmid}/config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfigInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, deserialize_with = "opt_number", skip_serializing_if = "Option::is_none")]
    pub cores: Option<u64>,

    /// MiB.
    #[serde(default, deserialize_with = "opt_number", skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One entry of `/nodes/{node}/qemu`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmListEntry {
    #[serde(deserialize_with = "number")]
    pub vmid: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, deserialize_with = "opt_number", skip_serializing_if = "Option::is_none")]
    pub maxmem: Option<u64>,

    #[serde(default, deserialize_with = "opt_number", skip_serializing_if = "Option::is_none")]
    pub maxdisk: Option<u64>,

    #[serde(default, deserialize_with = "opt_number", skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Caller-facing parameters for VM creation. Unset fields fall back to
/// the configured [`crate::config::VmDefaults`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVm {
    pub vmid: u32,
    pub name: String,
    pub cores: Option<u32>,

    /// GiB. Multiplied by 1024 on the wire.
    pub memory: Option<u64>,

    /// GiB.
    pub disk: Option<u32>,

    pub storage: Option<String>,
    pub template: Option<String>,
    pub bridge: Option<String>,
}

/// Form body for `POST /nodes/{node}/qemu`.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CreateVmForm {
    pub vmid: u32,
    pub name: String,
    pub cores: u32,

    /// MiB.
    pub memory: u64,

    /// GiB, already folded into `scsi0`.
    #[serde(skip)]
    pub disk: u32,

    pub scsi0: String,
    pub ide2: String,
    pub net0: String,
    pub template: String,
    pub description: String,
}

/// Summary built from the status and config queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmResources {
    pub vmid: u32,
    pub status: String,
    pub cpu: u64,

    /// GiB, rounded down.
    pub memory: u64,

    /// Bytes used across guest filesystems.
    /// `None` when the guest agent could not report it.
    pub disk: Option<u64>,

    /// Seconds.
    pub uptime: u64,

    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Ticket {
    pub ticket: String,

    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_prevention_token: String,
}

/// `agent/get-fsinfo` wraps the guest agent reply in `result`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FsInfo {
    #[serde(default)]
    pub result: Vec<FsInfoEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FsInfoEntry {
    #[serde(rename = "used-bytes", default, deserialize_with = "opt_number")]
    pub used_bytes: Option<u64>,
}

/// Proxmox returns some integers as JSON strings depending on the endpoint
/// and version.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Float(f64),
    String(String),
}

impl NumberOrString {
    fn into_u64<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::Float(f) if f >= 0.0 => Ok(f as u64),
            NumberOrString::Float(f) => Err(E::custom(format!("negative number {f}"))),
            NumberOrString::String(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("expected an integer, got {s:?}"))),
        }
    }
}

pub(crate) fn parse_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    NumberOrString::deserialize(deserializer)?.into_u64()
}

fn opt_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Option::<NumberOrString>::deserialize(deserializer)?
        .map(NumberOrString::into_u64)
        .transpose()
}
