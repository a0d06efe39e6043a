//! Client for a Proxmox node's VM lifecycle API, plus a SQLite-backed store
//! of the VMs it provisioned.

pub mod api;
pub mod config;
pub mod error;
pub mod manager;
pub mod store;
pub mod types;

pub use api::Api;
pub use config::Config;
pub use error::{Error, Result};
pub use manager::{ProvisionRequest, VmManager};
pub use store::{NewVmRecord, VmRecord, VmStatus, VmStore};
