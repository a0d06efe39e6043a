use std::sync::Arc;

use rand::Rng;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;

use crate::config;
use crate::error::{Error, Result};
use crate::types::{
    CreateVm, CreateVmForm, FsInfo, Ticket, VmConfigInfo, VmCurrentStatus, VmListEntry,
    VmResources, parse_u64,
};

const GENERIC_API_ERROR: &str = "Proxmox API error";

/// Fallback range for [`Api::get_next_vmid`] when the cluster cannot be asked.
pub const FALLBACK_VMID_RANGE: std::ops::RangeInclusive<u32> = 100..=999;

/// Handle to the Proxmox management API of a single node.
///
/// Cloning is cheap and clones share the authenticated session.
#[derive(Clone)]
pub struct Api {
    inner: Arc<Inner>,
    client: ClientWithMiddleware,
}

struct Inner {
    base_url: String,
    username: String,
    password: String,
    realm: String,
    node: String,
    session: Mutex<Option<Session>>,
}

#[derive(Debug, Clone)]
struct Session {
    ticket: String,
    csrf: String,
}

impl Api {
    pub fn from_config(conf: &config::ProxmoxConfig) -> Result<Self> {
        let base_url = format!("https://{}:{}/api2/json", conf.host, conf.port);
        Self::with_base_url(base_url, conf)
    }

    /// Like [`Api::from_config`], but against an explicit `.../api2/json` root.
    pub fn with_base_url(base_url: impl Into<String>, conf: &config::ProxmoxConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(conf.allow_invalid_cert)
            .build()?;

        let mut builder = ClientBuilder::new(client);
        if conf.max_retries > 0 {
            let policy = ExponentialBackoff::builder().build_with_max_retries(conf.max_retries);
            builder = builder.with(RetryTransientMiddleware::new_with_policy(policy));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                base_url: base_url.into(),
                username: conf.username.clone(),
                password: conf.password.clone(),
                realm: conf.realm.clone(),
                node: conf.node.clone(),
                session: Mutex::new(None),
            }),
            client: builder.build(),
        })
    }

    pub fn node(&self) -> &str {
        &self.inner.node
    }

    /// Whether a ticket has been obtained yet.
    pub async fn is_authenticated(&self) -> bool {
        self.inner.session.lock().await.is_some()
    }

    /// Requests a fresh ticket and replaces the current session with it.
    pub async fn authenticate(&self) -> Result<bool> {
        let mut session = self.inner.session.lock().await;
        *session = Some(self.fetch_ticket().await?);
        Ok(true)
    }

    async fn fetch_ticket(&self) -> Result<Session> {
        tracing::info!("Getting new ticket");
        let res = self
            .client
            .post(format!("{}/access/ticket", self.inner.base_url))
            .form(&[
                ("username", self.inner.username.as_str()),
                ("password", self.inner.password.as_str()),
                ("realm", self.inner.realm.as_str()),
            ])
            .send()
            .await
            .map_err(Error::from)
            .inspect_err(|e| tracing::error!("Proxmox authentication error: {e}"))?;

        let json: serde_json::Value = res
            .json()
            .await
            .map_err(Error::from)
            .inspect_err(|e| tracing::error!("Proxmox authentication error: {e}"))?;

        let data = match json.get("data") {
            Some(data) if !data.is_null() => data.clone(),
            _ => {
                tracing::error!("Proxmox authentication error: no data in ticket response");
                return Err(Error::Authentication);
            }
        };

        let ticket: Ticket = serde_json::from_value(data).map_err(|e| {
            tracing::error!("Proxmox authentication error: malformed ticket: {e}");
            Error::Authentication
        })?;

        Ok(Session {
            ticket: ticket.ticket,
            csrf: ticket.csrf_prevention_token,
        })
    }

    /// Returns the cached session, authenticating once if there is none.
    /// The ticket is not checked for expiry.
    async fn session(&self) -> Result<Session> {
        let mut session = self.inner.session.lock().await;
        if let Some(existing) = session.as_ref() {
            tracing::debug!("Reusing cached ticket");
            return Ok(existing.clone());
        }
        let fresh = self.fetch_ticket().await?;
        *session = Some(fresh.clone());
        Ok(fresh)
    }

    /// Sends one authenticated request and returns the envelope's `data`.
    ///
    /// `data` is sent as a form body for POST and PUT only.
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        data: Option<&T>,
    ) -> Result<serde_json::Value> {
        tracing::debug!("Ticketed request {} {}", method, endpoint);
        let session = self.session().await?;
        let url = format!("{}{}", self.inner.base_url, endpoint);

        let sends_body = method == reqwest::Method::POST || method == reqwest::Method::PUT;
        let mut req = self
            .client
            .request(method, url)
            .header(reqwest::header::COOKIE, format!("PVEAuthCookie={}", session.ticket))
            .header("CSRFPreventionToken", session.csrf);
        if let (true, Some(data)) = (sends_body, data) {
            req = req.form(data);
        }

        let result: Result<serde_json::Value> = async {
            let res = req.send().await?;
            let envelope: serde_json::Value = res.json().await?;
            unwrap_envelope(envelope)
        }
        .await;

        result.inspect_err(|e| tracing::error!("Proxmox API request error: {e}"))
    }

    /// [`Api::request`] without a body, decoding `data` into `R`.
    async fn get_as<R: DeserializeOwned>(&self, endpoint: &str) -> Result<R> {
        let data = self
            .request::<()>(reqwest::Method::GET, endpoint, None)
            .await?;
        serde_json::from_value(data)
            .map_err(Error::from)
            .inspect_err(|e| tracing::error!("Unexpected payload from {endpoint}: {e}"))
    }

    async fn post(&self, endpoint: &str) -> Result<serde_json::Value> {
        self.request::<()>(reqwest::Method::POST, endpoint, None)
            .await
    }

    fn qemu_path(&self, vmid: u32, rest: &str) -> String {
        format!("/nodes/{}/qemu/{}{}", self.inner.node, vmid, rest)
    }

    /// Builds the creation form from `vm`, filling gaps from `defaults`.
    pub(crate) fn create_form(
        vm: &CreateVm,
        defaults: &config::VmDefaults,
    ) -> Result<CreateVmForm> {
        let storage = vm.storage.as_deref().unwrap_or(&defaults.storage);
        let bridge = vm.bridge.as_deref().unwrap_or(&defaults.bridge);
        let disk = vm.disk.unwrap_or(defaults.disk);
        let memory = match vm.memory {
            Some(gib) => gib.checked_mul(1024).ok_or_else(|| Error::InvalidRequest {
                reason: format!("memory of {gib} GiB does not fit in MiB"),
            })?,
            None => defaults.memory_mib,
        };

        Ok(CreateVmForm {
            vmid: vm.vmid,
            name: vm.name.clone(),
            cores: vm.cores.unwrap_or(defaults.cores),
            memory,
            disk,
            scsi0: format!("{storage}:{disk}"),
            ide2: format!("{storage}:cloudinit"),
            net0: format!("virtio,bridge={bridge}"),
            template: vm
                .template
                .clone()
                .unwrap_or_else(|| defaults.template.clone()),
            description: format!("VM provisioned for {}", vm.name),
        })
    }

    /// Issues the creation request. The VMID is not checked for collisions here;
    /// the hypervisor rejects duplicates.
    pub async fn create_vm(
        &self,
        vm: &CreateVm,
        defaults: &config::VmDefaults,
    ) -> Result<serde_json::Value> {
        let form = Self::create_form(vm, defaults)
            .inspect_err(|e| tracing::error!("Rejected VM {} ({}): {e}", vm.vmid, vm.name))?;
        self.submit_create(&form).await
    }

    pub(crate) async fn submit_create(&self, form: &CreateVmForm) -> Result<serde_json::Value> {
        tracing::debug!("Creating VM {} ({})", form.vmid, form.name);
        self.request(
            reqwest::Method::POST,
            &format!("/nodes/{}/qemu", self.inner.node),
            Some(form),
        )
        .await
    }

    pub async fn start_vm(&self, vmid: u32) -> Result<serde_json::Value> {
        tracing::debug!("Starting VM {vmid}");
        self.post(&self.qemu_path(vmid, "/status/start")).await
    }

    pub async fn stop_vm(&self, vmid: u32) -> Result<serde_json::Value> {
        tracing::debug!("Stopping VM {vmid}");
        self.post(&self.qemu_path(vmid, "/status/stop")).await
    }

    pub async fn restart_vm(&self, vmid: u32) -> Result<serde_json::Value> {
        tracing::debug!("Rebooting VM {vmid}");
        self.post(&self.qemu_path(vmid, "/status/reboot")).await
    }

    pub async fn delete_vm(&self, vmid: u32) -> Result<serde_json::Value> {
        tracing::debug!("Deleting VM {vmid}");
        self.request::<()>(reqwest::Method::DELETE, &self.qemu_path(vmid, ""), None)
            .await
    }

    pub async fn get_vm_status(&self, vmid: u32) -> Result<VmCurrentStatus> {
        tracing::debug!("Getting VM {vmid} status from hypervisor");
        self.get_as(&self.qemu_path(vmid, "/status/current")).await
    }

    pub async fn get_vm_config(&self, vmid: u32) -> Result<VmConfigInfo> {
        tracing::debug!("Getting VM {vmid} config from hypervisor");
        self.get_as(&self.qemu_path(vmid, "/config")).await
    }

    pub async fn list_vms(&self) -> Result<Vec<VmListEntry>> {
        tracing::debug!("Listing VMs on {}", self.inner.node);
        self.get_as(&format!("/nodes/{}/qemu", self.inner.node))
            .await
    }

    pub async fn get_vm_resources(&self, vmid: u32) -> Result<VmResources> {
        let status = self.get_vm_status(vmid).await?;
        let config = self.get_vm_config(vmid).await?;
        let disk = self.get_vm_disk_usage(vmid).await;

        Ok(VmResources {
            vmid,
            status: status.status,
            cpu: config.cores.unwrap_or(1),
            memory: config.memory.unwrap_or(0) / 1024,
            disk,
            uptime: status.uptime.unwrap_or(0),
            name: config.name,
        })
    }

    /// Bytes used across the guest's filesystems, as reported by the guest agent.
    /// `None` if the agent is not running or the reply could not be read.
    pub async fn get_vm_disk_usage(&self, vmid: u32) -> Option<u64> {
        match self
            .get_as::<FsInfo>(&self.qemu_path(vmid, "/agent/get-fsinfo"))
            .await
        {
            Ok(info) => Some(info.result.iter().filter_map(|fs| fs.used_bytes).sum()),
            Err(e) => {
                tracing::debug!("Disk usage unavailable for VM {vmid}: {e}");
                None
            }
        }
    }

    /// Asks the cluster for the next free VMID. If that fails for any reason,
    /// a random id from [`FALLBACK_VMID_RANGE`] is returned without any
    /// collision check.
    pub async fn get_next_vmid(&self) -> u32 {
        let res = self
            .request::<()>(reqwest::Method::GET, "/cluster/nextid", None)
            .await;

        match res.map(|data| parse_u64(&data).and_then(|id| u32::try_from(id).ok())) {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::warn!("Unparseable nextid from cluster, using a random VMID");
                random_vmid()
            }
            Err(e) => {
                tracing::warn!("Could not get nextid ({e}), using a random VMID");
                random_vmid()
            }
        }
    }
}

fn random_vmid() -> u32 {
    rand::rng().random_range(FALLBACK_VMID_RANGE)
}

/// Splits a Proxmox JSON envelope into its `data` or an API error.
fn unwrap_envelope(mut envelope: serde_json::Value) -> Result<serde_json::Value> {
    match envelope.get("errors") {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::Array(errors)) => {
            let message = errors
                .first()
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or(GENERIC_API_ERROR);
            return Err(Error::Api {
                message: message.to_string(),
            });
        }
        // Parameter validation failures come back as {"param": "reason"}.
        Some(serde_json::Value::Object(errors)) => {
            let message = errors
                .iter()
                .next()
                .map(|(k, v)| match v.as_str() {
                    Some(v) => format!("{k}: {}", v.trim()),
                    None => format!("{k}: {v}"),
                })
                .unwrap_or_else(|| GENERIC_API_ERROR.to_string());
            return Err(Error::Api { message });
        }
        Some(other) => {
            let message = other
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| GENERIC_API_ERROR.to_string());
            return Err(Error::Api { message });
        }
    }

    Ok(envelope
        .get_mut("data")
        .map(serde_json::Value::take)
        .unwrap_or(serde_json::Value::Null))
}
