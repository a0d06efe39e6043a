#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Form, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use proxmox_vm_manager::config::ProxmoxConfig;

pub const TICKET: &str = "PVE:root@pam:66F0A1B2::signature";
pub const CSRF: &str = "66F0A1B2:csrf-token";

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub cookie: Option<String>,
    pub csrf: Option<String>,
    pub form: HashMap<String, String>,
}

/// A fake Proxmox node. Creation requests are echoed back as `data`;
/// everything else answers from `responses`, keyed by "METHOD /path",
/// or with `{"data": null}`.
#[derive(Default)]
pub struct Stub {
    requests: Mutex<Vec<Recorded>>,
    responses: Mutex<HashMap<String, Value>>,
    pub reject_login: AtomicBool,
}

impl Stub {
    pub fn respond(&self, key: &str, body: Value) {
        self.responses.lock().unwrap().insert(key.to_string(), body);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests other than ticket requests.
    pub fn api_requests(&self) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.path != "/api2/json/access/ticket")
            .collect()
    }

    pub fn logins(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.path == "/api2/json/access/ticket")
            .count()
    }

    fn record(&self, method: &Method, uri: &Uri, headers: &HeaderMap, form: HashMap<String, String>) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        self.requests.lock().unwrap().push(Recorded {
            method: method.to_string(),
            path: uri.path().to_string(),
            cookie: header("cookie"),
            csrf: header("csrfpreventiontoken"),
            form,
        });
    }
}

async fn ticket(
    State(stub): State<Arc<Stub>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    stub.record(&method, &uri, &headers, form);
    if stub.reject_login.load(Ordering::SeqCst) {
        return Json(json!({ "data": null }));
    }
    Json(json!({
        "data": {
            "ticket": TICKET,
            "CSRFPreventionToken": CSRF,
            "username": "root@pam"
        }
    }))
}

async fn create(
    State(stub): State<Arc<Stub>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    stub.record(&method, &uri, &headers, form.clone());
    let key = format!("{method} {}", uri.path());
    if let Some(canned) = stub.responses.lock().unwrap().get(&key) {
        return Json(canned.clone());
    }
    Json(json!({ "data": form }))
}

async fn reply(
    State(stub): State<Arc<Stub>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Json<Value> {
    stub.record(&method, &uri, &headers, HashMap::new());
    let key = format!("{method} {}", uri.path());
    let canned = stub.responses.lock().unwrap().get(&key).cloned();
    Json(canned.unwrap_or_else(|| json!({ "data": null })))
}

/// Serves `stub` on an ephemeral port and returns the `/api2/json` base URL.
pub async fn serve(stub: Arc<Stub>) -> String {
    let app = Router::new()
        .route("/api2/json/access/ticket", post(ticket))
        .route("/api2/json/cluster/nextid", get(reply))
        .route("/api2/json/nodes/{node}/qemu", get(reply).post(create))
        .route("/api2/json/nodes/{node}/qemu/{vmid}", get(reply).delete(reply))
        .route(
            "/api2/json/nodes/{node}/qemu/{vmid}/{*rest}",
            get(reply).post(reply),
        )
        .with_state(stub);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}/api2/json")
}

pub fn proxmox_config() -> ProxmoxConfig {
    ProxmoxConfig {
        host: "127.0.0.1".to_string(),
        port: 8006,
        username: "root".to_string(),
        password: "secret".to_string(),
        realm: "pam".to_string(),
        node: "pve".to_string(),
        allow_invalid_cert: false,
        max_retries: 0,
    }
}
