mod common;

use std::sync::Arc;

use serde_json::json;

use proxmox_vm_manager::config::{ProvisioningConfig, VmDefaults};
use proxmox_vm_manager::{
    Api, Error, NewVmRecord, ProvisionRequest, VmManager, VmStatus, VmStore,
};

use common::Stub;

async fn setup(max_vmid_attempts: u32) -> (Arc<Stub>, VmManager) {
    let stub = Arc::new(Stub::default());
    let base_url = common::serve(stub.clone()).await;
    let api = Api::with_base_url(base_url, &common::proxmox_config()).unwrap();
    let store = VmStore::in_memory().await.unwrap();
    let manager = VmManager::new(
        api,
        store,
        VmDefaults::default(),
        &ProvisioningConfig { max_vmid_attempts },
    );
    (stub, manager)
}

fn request(name: &str) -> ProvisionRequest {
    ProvisionRequest {
        vmid: None,
        name: name.to_string(),
        owner_id: "42".to_string(),
        owner_username: "bob".to_string(),
        cores: Some(2),
        memory: Some(2),
        disk: Some(16),
        ssh_username: "ubuntu".to_string(),
        ssh_password: "pw".to_string(),
    }
}

fn existing(vm_id: u32, name: &str) -> NewVmRecord {
    NewVmRecord {
        vm_id,
        name: name.to_string(),
        owner_id: "42".to_string(),
        owner_username: "bob".to_string(),
        cpu: 1,
        ram: 512,
        disk: 8,
        ip_address: None,
        ssh_username: "ubuntu".to_string(),
        ssh_password: "pw".to_string(),
        node: "pve".to_string(),
    }
}

#[tokio::test]
async fn provision_creates_then_records() {
    let (stub, manager) = setup(5).await;
    stub.respond("GET /api2/json/cluster/nextid", json!({ "data": "104" }));

    let record = manager.provision(request("web")).await.unwrap();

    assert_eq!(record.vm_id, 104);
    assert_eq!(record.name, "web");
    assert_eq!(record.cpu, 2);
    assert_eq!(record.ram, 2048);
    assert_eq!(record.disk, 16);
    assert_eq!(record.node, "pve");
    assert_eq!(record.status, VmStatus::Stopped);

    let create = stub
        .api_requests()
        .into_iter()
        .find(|r| r.method == "POST")
        .unwrap();
    assert_eq!(create.form["vmid"], "104");
    assert_eq!(create.form["memory"], "2048");

    assert!(manager.store().vm_id_exists(104).await.unwrap());
}

#[tokio::test]
async fn provision_with_defaults_records_default_memory() {
    let (_stub, manager) = setup(5).await;

    let record = manager
        .provision(ProvisionRequest {
            vmid: Some(130),
            cores: None,
            memory: None,
            disk: None,
            ..request("tiny")
        })
        .await
        .unwrap();

    assert_eq!(record.vm_id, 130);
    assert_eq!(record.cpu, 1);
    assert_eq!(record.ram, 512);
    assert_eq!(record.disk, 8);
}

#[tokio::test]
async fn rejected_creation_leaves_no_record() {
    let (stub, manager) = setup(5).await;
    stub.respond(
        "POST /api2/json/nodes/pve/qemu",
        json!({ "errors": [{ "message": "VM 140 already exists on node 'pve'" }] }),
    );

    let err = manager
        .provision(ProvisionRequest {
            vmid: Some(140),
            ..request("web")
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Api { .. }));
    assert!(manager.store().list().await.unwrap().is_empty());
}

#[tokio::test]
async fn allocation_skips_recorded_ids_until_exhausted() {
    let (stub, manager) = setup(3).await;
    stub.respond("GET /api2/json/cluster/nextid", json!({ "data": 104 }));
    manager.store().insert(existing(104, "old")).await.unwrap();

    let err = manager.allocate_vmid().await.unwrap_err();
    assert!(matches!(err, Error::VmidExhausted { attempts: 3 }));

    let asked = stub
        .api_requests()
        .iter()
        .filter(|r| r.path == "/api2/json/cluster/nextid")
        .count();
    assert_eq!(asked, 3);
}

#[tokio::test]
async fn sync_status_follows_hypervisor() {
    let (stub, manager) = setup(5).await;
    manager.store().insert(existing(120, "web")).await.unwrap();
    stub.respond(
        "GET /api2/json/nodes/pve/qemu/120/status/current",
        json!({ "data": { "status": "running", "qmpstatus": "running", "uptime": 5 } }),
    );

    assert_eq!(manager.start(120).await.unwrap(), VmStatus::Running);
    let record = manager.store().get(120).await.unwrap();
    assert_eq!(record.status, VmStatus::Running);
    let first_start = record.last_started.unwrap();

    stub.respond(
        "GET /api2/json/nodes/pve/qemu/120/status/current",
        json!({ "data": { "status": "running", "qmpstatus": "paused" } }),
    );
    assert_eq!(manager.sync_status(120).await.unwrap(), VmStatus::Paused);

    let record = manager.store().get(120).await.unwrap();
    assert_eq!(record.status, VmStatus::Paused);
    assert_eq!(
        record.last_started.map(|t| t.timestamp()),
        Some(first_start.timestamp())
    );
}

#[tokio::test]
async fn lifecycle_on_unknown_record_does_not_reach_hypervisor() {
    let (stub, manager) = setup(5).await;

    assert!(matches!(
        manager.start(999).await,
        Err(Error::NotFound { vm_id: 999 })
    ));
    assert!(matches!(
        manager.destroy(999).await,
        Err(Error::NotFound { vm_id: 999 })
    ));
    assert!(stub.api_requests().is_empty());
}

#[tokio::test]
async fn sync_all_skips_failures() {
    let (stub, manager) = setup(5).await;
    manager.store().insert(existing(120, "a")).await.unwrap();
    manager.store().insert(existing(121, "b")).await.unwrap();
    stub.respond(
        "GET /api2/json/nodes/pve/qemu/120/status/current",
        json!({ "data": { "status": "stopped" } }),
    );
    stub.respond(
        "GET /api2/json/nodes/pve/qemu/121/status/current",
        json!({ "errors": [{ "message": "no such VM" }] }),
    );

    let synced = manager.sync_all().await.unwrap();
    assert_eq!(synced, vec![(120, VmStatus::Stopped)]);
}

#[tokio::test]
async fn destroy_removes_record_after_hypervisor_delete() {
    let (stub, manager) = setup(5).await;
    manager.store().insert(existing(120, "web")).await.unwrap();

    manager.destroy(120).await.unwrap();

    assert!(!manager.store().vm_id_exists(120).await.unwrap());
    assert!(
        stub.api_requests()
            .iter()
            .any(|r| r.method == "DELETE" && r.path == "/api2/json/nodes/pve/qemu/120")
    );
}

#[tokio::test]
async fn failed_delete_keeps_record() {
    let (stub, manager) = setup(5).await;
    manager.store().insert(existing(120, "web")).await.unwrap();
    stub.respond(
        "DELETE /api2/json/nodes/pve/qemu/120",
        json!({ "errors": [{ "message": "VM is locked (backup)" }] }),
    );

    assert!(manager.destroy(120).await.is_err());
    assert!(manager.store().vm_id_exists(120).await.unwrap());
}

#[tokio::test]
async fn duplicate_name_never_reaches_hypervisor() {
    let (stub, manager) = setup(5).await;
    manager.store().insert(existing(120, "web")).await.unwrap();

    let err = manager
        .provision(ProvisionRequest {
            vmid: Some(121),
            ..request("web")
        })
        .await
        .unwrap_err();

    match err {
        Error::Duplicate { field, value } => {
            assert_eq!(field, "name");
            assert_eq!(value, "web");
        }
        other => panic!("expected duplicate name, got {other:?}"),
    }
    assert!(!stub.api_requests().iter().any(|r| r.method == "POST"));
    assert!(!manager.store().vm_id_exists(121).await.unwrap());
}

#[tokio::test]
async fn duplicate_vmid_never_reaches_hypervisor() {
    let (stub, manager) = setup(5).await;
    manager.store().insert(existing(120, "web")).await.unwrap();

    let err = manager
        .provision(ProvisionRequest {
            vmid: Some(120),
            ..request("db")
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Duplicate { field: "vmId", .. }));
    assert!(stub.api_requests().is_empty());
}

#[tokio::test]
async fn oversized_memory_fails_provision_without_creating() {
    let (stub, manager) = setup(5).await;

    let err = manager
        .provision(ProvisionRequest {
            vmid: Some(150),
            memory: Some(u64::MAX / 512),
            ..request("huge")
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidRequest { .. }));
    assert!(stub.api_requests().is_empty());
    assert!(manager.store().list().await.unwrap().is_empty());
}

#[tokio::test]
async fn start_stamps_last_started_even_when_record_says_running() {
    let (stub, manager) = setup(5).await;
    manager.store().insert(existing(120, "web")).await.unwrap();
    stub.respond(
        "GET /api2/json/nodes/pve/qemu/120/status/current",
        json!({ "data": { "status": "running", "qmpstatus": "running" } }),
    );

    // Reconcile once so the record already reads running.
    manager.sync_status(120).await.unwrap();
    let first = manager.store().get(120).await.unwrap().last_started.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    assert_eq!(manager.start(120).await.unwrap(), VmStatus::Running);

    let second = manager.store().get(120).await.unwrap().last_started.unwrap();
    assert!(second > first);

    // A plain sync of an already-running VM leaves the stamp alone.
    manager.sync_status(120).await.unwrap();
    assert_eq!(
        manager.store().get(120).await.unwrap().last_started,
        Some(second)
    );
}
