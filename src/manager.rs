use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::api::Api;
use crate::config;
use crate::error::{Error, Result};
use crate::store::{NewVmRecord, VmRecord, VmStatus, VmStore};
use crate::types::CreateVm;

/// What a caller asks for when provisioning a VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Leave unset to have one allocated.
    pub vmid: Option<u32>,
    pub name: String,
    pub owner_id: String,
    pub owner_username: String,
    pub cores: Option<u32>,

    /// GiB.
    pub memory: Option<u64>,

    /// GiB.
    pub disk: Option<u32>,

    pub ssh_username: String,
    pub ssh_password: String,
}

/// Ties the hypervisor client to the record store, so that records are only
/// written for VMs the hypervisor accepted and statuses come from the
/// hypervisor rather than from callers.
#[derive(Clone)]
pub struct VmManager {
    api: Api,
    store: VmStore,
    defaults: config::VmDefaults,
    max_vmid_attempts: u32,
}

impl VmManager {
    pub fn new(
        api: Api,
        store: VmStore,
        defaults: config::VmDefaults,
        provisioning: &config::ProvisioningConfig,
    ) -> Self {
        Self {
            api,
            store,
            defaults,
            max_vmid_attempts: provisioning.max_vmid_attempts,
        }
    }

    pub fn api(&self) -> &Api {
        &self.api
    }

    pub fn store(&self) -> &VmStore {
        &self.store
    }

    /// Picks a VMID that no stored record uses yet.
    pub async fn allocate_vmid(&self) -> Result<u32> {
        for attempt in 1..=self.max_vmid_attempts {
            let candidate = self.api.get_next_vmid().await;
            if !self.store.vm_id_exists(candidate).await? {
                return Ok(candidate);
            }
            tracing::warn!(
                "VMID {candidate} is already recorded (attempt {attempt}/{})",
                self.max_vmid_attempts
            );
        }

        tracing::error!(
            "No free VMID after {} attempts",
            self.max_vmid_attempts
        );
        Err(Error::VmidExhausted {
            attempts: self.max_vmid_attempts,
        })
    }

    /// Creates the VM on the hypervisor, then records it. Names and VMIDs the
    /// store already holds are rejected before the hypervisor is asked.
    pub async fn provision(&self, req: ProvisionRequest) -> Result<VmRecord> {
        if self.store.get_by_name(&req.name).await?.is_some() {
            return Err(Error::Duplicate {
                field: "name",
                value: req.name,
            });
        }

        let vmid = match req.vmid {
            Some(vmid) => {
                if self.store.vm_id_exists(vmid).await? {
                    return Err(Error::Duplicate {
                        field: "vmId",
                        value: vmid.to_string(),
                    });
                }
                vmid
            }
            None => self.allocate_vmid().await?,
        };

        let form = Api::create_form(
            &CreateVm {
                vmid,
                name: req.name.clone(),
                cores: req.cores,
                memory: req.memory,
                disk: req.disk,
                ..Default::default()
            },
            &self.defaults,
        )?;
        self.api.submit_create(&form).await?;
        tracing::info!("Hypervisor accepted VM {vmid} ({})", req.name);

        self.store
            .insert(NewVmRecord {
                vm_id: vmid,
                name: req.name,
                owner_id: req.owner_id,
                owner_username: req.owner_username,
                cpu: form.cores,
                ram: form.memory,
                disk: form.disk,
                ip_address: None,
                ssh_username: req.ssh_username,
                ssh_password: req.ssh_password,
                node: self.api.node().to_string(),
            })
            .await
            .inspect_err(|e| {
                tracing::error!("VM {vmid} exists on the hypervisor but could not be recorded: {e}")
            })
    }

    /// Starts the VM and reconciles its record. `last_started` is stamped
    /// whenever the hypervisor then reports it running.
    pub async fn start(&self, vm_id: u32) -> Result<VmStatus> {
        self.store.get(vm_id).await?;
        self.api.start_vm(vm_id).await?;
        self.reconcile(vm_id, true).await
    }

    pub async fn stop(&self, vm_id: u32) -> Result<VmStatus> {
        self.store.get(vm_id).await?;
        self.api.stop_vm(vm_id).await?;
        self.reconcile(vm_id, false).await
    }

    pub async fn restart(&self, vm_id: u32) -> Result<VmStatus> {
        self.store.get(vm_id).await?;
        self.api.restart_vm(vm_id).await?;
        self.reconcile(vm_id, false).await
    }

    /// Reads the VM's state from the hypervisor and stores it on the record.
    /// A transition into running also stamps `last_started`.
    pub async fn sync_status(&self, vm_id: u32) -> Result<VmStatus> {
        self.reconcile(vm_id, false).await
    }

    async fn reconcile(&self, vm_id: u32, started: bool) -> Result<VmStatus> {
        let record = self.store.get(vm_id).await?;
        let current = self.api.get_vm_status(vm_id).await?;
        let status = VmStatus::from_hypervisor(&current.status, current.qmpstatus.as_deref());

        let last_started = (status == VmStatus::Running
            && (started || record.status != VmStatus::Running))
            .then(Utc::now);

        if status != record.status {
            tracing::info!("VM {vm_id} status {} -> {}", record.status, status);
        }
        self.store
            .record_status(vm_id, status, last_started)
            .await?;
        Ok(status)
    }

    /// Reconciles every stored record. Failures are logged and skipped.
    pub async fn sync_all(&self) -> Result<Vec<(u32, VmStatus)>> {
        let mut synced = Vec::new();
        for record in self.store.list().await? {
            match self.sync_status(record.vm_id).await {
                Ok(status) => synced.push((record.vm_id, status)),
                Err(e) => tracing::error!("Failed to sync VM {}: {e}", record.vm_id),
            }
        }
        Ok(synced)
    }

    /// Deletes the VM on the hypervisor and, once that was accepted, its record.
    pub async fn destroy(&self, vm_id: u32) -> Result<()> {
        self.store.get(vm_id).await?;
        self.api.delete_vm(vm_id).await?;
        self.store.delete(vm_id).await
    }
}
