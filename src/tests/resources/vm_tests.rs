use super::{authenticated_client, data, tasks_finish_with};
use crate::{
    ProxmoxError,
    core::domain::model::vm::{AgentExecParams, CloneVmParams},
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, body_partial_json, method, path, path_regex, query_param},
};

#[tokio::test]
async fn test_vms_list() {
    let server = MockServer::start().await;
    let client = authenticated_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu"))
        .respond_with(data(serde_json::json!([
            {
                "vmid": 9000,
                "name": "ubuntu-cloud",
                "status": "stopped",
                "template": 1
            },
            {
                "vmid": 201,
                "name": "k3s-master-0",
                "status": "running",
                "maxmem": 4294967296_u64,
                "uptime": 3600
            }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let vms = client.vms("pve").await.unwrap();
    assert_eq!(vms.len(), 2);
    assert_eq!(vms[0].template, Some(1));
    assert_eq!(vms[1].name.as_deref(), Some("k3s-master-0"));
    assert_eq!(vms[1].status, "running");
    assert_eq!(vms[1].uptime, Some(3600));
}

#[tokio::test]
async fn test_next_vmid_accepts_string_payload() {
    let server = MockServer::start().await;
    let client = authenticated_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/nextid"))
        .respond_with(data(serde_json::json!("104")))
        .mount(&server)
        .await;

    assert_eq!(client.next_vmid().await.unwrap(), 104);
}

#[tokio::test]
async fn test_clone_returns_task_id() {
    let server = MockServer::start().await;
    let client = authenticated_client(&server).await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/9000/clone"))
        .and(body_json(serde_json::json!({
            "newid": 201,
            "name": "k3s-master-0",
            "full": 1
        })))
        .respond_with(data(serde_json::json!(
            "UPID:pve:0000ABCD:00112233:65F0A1B2:qmclone:9000:terraform@pve:"
        )))
        .expect(1)
        .mount(&server)
        .await;

    let upid = client
        .clone_vm(
            "pve",
            9000,
            &CloneVmParams {
                newid: 201,
                name: "k3s-master-0".to_string(),
                full: 1,
                storage: None,
                description: None,
            },
        )
        .await
        .unwrap();
    assert!(upid.starts_with("UPID:pve:"));
}

#[tokio::test]
async fn test_wait_for_task_polls_until_stopped() {
    let server = MockServer::start().await;
    let client = authenticated_client(&server).await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/api2/json/nodes/pve/tasks/.+/status$"))
        .respond_with(data(serde_json::json!({ "status": "running" })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    tasks_finish_with(&server, "OK").await;

    client
        .wait_for_task("pve", "UPID:pve:0000ABCD:00112233:65F0A1B2:qmstart:201:terraform@pve:")
        .await
        .unwrap();
    let polls = server.received_requests().await.unwrap().len();
    assert_eq!(polls, 3);
}

#[tokio::test]
async fn test_wait_for_task_keeps_polling_through_unavailable_status() {
    let server = MockServer::start().await;
    let client = authenticated_client(&server).await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/api2/json/nodes/pve/tasks/.+/status$"))
        .respond_with(ResponseTemplate::new(503).set_body_string("service unavailable"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    tasks_finish_with(&server, "OK").await;

    client
        .wait_for_task("pve", "UPID:pve:0000ABCD:00112233:65F0A1B2:qmclone:9000:terraform@pve:")
        .await
        .unwrap();
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_wait_for_task_stops_on_rejected_status_request() {
    let server = MockServer::start().await;
    let client = authenticated_client(&server).await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/api2/json/nodes/pve/tasks/.+/status$"))
        .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client
        .wait_for_task("pve", "UPID:pve:0000ABCD:00112233:65F0A1B2:qmclone:9000:terraform@pve:")
        .await
        .unwrap_err();
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_failed_task_carries_exit_status() {
    let server = MockServer::start().await;
    let client = authenticated_client(&server).await;
    tasks_finish_with(&server, "clone failed: storage 'fast' does not exist").await;

    let err = client
        .wait_for_task("pve", "UPID:pve:0000ABCD:00112233:65F0A1B2:qmclone:9000:terraform@pve:")
        .await
        .unwrap_err();
    match err {
        ProxmoxError::TaskFailed { exit_status, .. } => {
            assert!(exit_status.contains("does not exist"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_agent_ping_not_running_is_api_error() {
    let server = MockServer::start().await;
    let client = authenticated_client(&server).await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/201/agent/ping"))
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
            "data": null,
            "message": "QEMU guest agent is not running\n"
        })))
        .mount(&server)
        .await;

    let err = client.agent_ping("pve", 201).await.unwrap_err();
    assert!(matches!(err, ProxmoxError::Api { status: 500, .. }));
}

#[tokio::test]
async fn test_agent_exec_waits_for_exit() {
    let server = MockServer::start().await;
    let client = authenticated_client(&server).await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/201/agent/exec"))
        .and(body_partial_json(serde_json::json!({
            "command": ["id", "-u", "k3sadmin"]
        })))
        .respond_with(data(serde_json::json!({ "pid": 4242 })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/201/agent/exec-status"))
        .and(query_param("pid", "4242"))
        .respond_with(data(serde_json::json!({
            "exited": 1,
            "exitcode": 1,
            "err-data": "id: 'k3sadmin': no such user\n"
        })))
        .mount(&server)
        .await;

    let status = client
        .agent_exec_wait(
            "pve",
            201,
            &AgentExecParams {
                command: vec!["id".into(), "-u".into(), "k3sadmin".into()],
                input_data: None,
            },
        )
        .await
        .unwrap();
    assert!(status.exited);
    assert_eq!(status.exitcode, Some(1));
    assert!(status.err_data.unwrap().contains("no such user"));
}

#[tokio::test]
async fn test_network_interfaces_unwraps_result() {
    let server = MockServer::start().await;
    let client = authenticated_client(&server).await;

    Mock::given(method("GET"))
        .and(path(
            "/api2/json/nodes/pve/qemu/201/agent/network-get-interfaces",
        ))
        .respond_with(data(serde_json::json!({
            "result": [
                {
                    "name": "eth0",
                    "hardware-address": "bc:24:11:aa:bb:cc",
                    "ip-addresses": [
                        { "ip-address": "192.168.1.100", "ip-address-type": "ipv4", "prefix": 24 },
                        { "ip-address": "fe80::be24:11ff:feaa:bbcc", "ip-address-type": "ipv6", "prefix": 64 }
                    ]
                }
            ]
        })))
        .mount(&server)
        .await;

    let interfaces = client.agent_network_interfaces("pve", 201).await.unwrap();
    assert_eq!(interfaces.len(), 1);
    assert_eq!(interfaces[0].ip_addresses[0].ip_address, "192.168.1.100");
    assert_eq!(interfaces[0].ip_addresses[1].prefix, Some(64));
}
