//! Wiremock-backed tests of the REST resources and the Proxmox hypervisor adapter.

mod hypervisor_tests;
mod vm_tests;

use crate::{
    ProxmoxClient,
    core::domain::{
        model::proxmox_auth::ProxmoxAuth,
        value_object::{ProxmoxCSRFToken, ProxmoxTicket},
    },
};
use std::sync::Arc;
use std::time::Duration;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path_regex},
};

/// A logged-in client pointed at `server`, polling tasks every 10 ms.
async fn authenticated_client(server: &MockServer) -> Arc<ProxmoxClient> {
    let client = ProxmoxClient::builder()
        .endpoint(server.uri())
        .credentials("terraform@pve", "s3cret-pass")
        .task_polling(Duration::from_millis(10), Duration::from_secs(5))
        .build()
        .unwrap();
    let ticket = ProxmoxTicket::new_unchecked("PVE:terraform@pve:4EEC61E2::sig".to_string());
    let csrf = ProxmoxCSRFToken::new_unchecked("4EEC61E2:token".to_string());
    client
        .api_client
        .set_auth(ProxmoxAuth::new(ticket, Some(csrf)))
        .await;
    Arc::new(client)
}

fn data(value: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": value }))
}

/// Every task on `server` finishes with `exit_status`.
async fn tasks_finish_with(server: &MockServer, exit_status: &str) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/api2/json/nodes/pve/tasks/.+/status$"))
        .respond_with(data(serde_json::json!({
            "status": "stopped",
            "exitstatus": exit_status
        })))
        .mount(server)
        .await;
}
