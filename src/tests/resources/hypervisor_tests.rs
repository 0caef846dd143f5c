use super::{authenticated_client, data, tasks_finish_with};
use crate::{
    AgentStatus, CloneRequest, CloudInit, Hypervisor, NodeName, PowerMode, PowerState,
    ProxmoxError, ProxmoxHypervisor, StaticIp, TemplateRef, VmHandle, VmHardwareConfig, VmId,
};
use std::net::IpAddr;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, body_partial_json, method, path, path_regex},
};

const UPID: &str = "UPID:pve:0000ABCD:00112233:65F0A1B2:qmclone:9000:terraform@pve:";

async fn hypervisor(server: &MockServer) -> ProxmoxHypervisor {
    ProxmoxHypervisor::new(authenticated_client(server).await, "pve")
}

fn handle(vmid: u32, name: &str) -> VmHandle {
    VmHandle {
        vmid: VmId::new(vmid).unwrap(),
        name: name.to_string(),
        node: "pve".to_string(),
    }
}

fn hardware() -> VmHardwareConfig {
    VmHardwareConfig {
        cores: 2,
        memory_mb: 4096,
        disk_size: Some("20G".to_string()),
        disk_device: "scsi0".to_string(),
        disk_storage: None,
        bridge: "vmbr0".to_string(),
        vlan_tag: None,
        description: Some("K3s node".to_string()),
        start_on_boot: true,
        cloud_init: CloudInit {
            user: "ubuntu".to_string(),
            ssh_keys: vec!["ssh-ed25519 AAAAC3Nza ops@lab".to_string()],
            static_ip: Some(StaticIp {
                address: "192.168.1.100".parse().unwrap(),
                prefix_len: 24,
                gateway: "192.168.1.1".parse().unwrap(),
            }),
            nameserver: Some("8.8.8.8".to_string()),
        },
    }
}

async fn mount_vm_list(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu"))
        .respond_with(data(serde_json::json!([
            { "vmid": 9000, "name": "k3s-master-0", "status": "stopped", "template": 1 },
            { "vmid": 201, "name": "k3s-master-0", "status": "running" },
            { "vmid": 305, "status": "stopped" }
        ])))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_find_vm_ignores_templates() {
    let server = MockServer::start().await;
    mount_vm_list(&server).await;
    let hypervisor = hypervisor(&server).await;

    let found = hypervisor
        .find_vm(&NodeName::new("k3s-master-0").unwrap())
        .await
        .unwrap();
    assert_eq!(found, Some(handle(201, "k3s-master-0")));
    assert_eq!(
        hypervisor
            .find_vm(&NodeName::new("k3s-worker-0").unwrap())
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_find_vm_by_id_sees_unnamed_vms() {
    let server = MockServer::start().await;
    mount_vm_list(&server).await;
    let hypervisor = hypervisor(&server).await;

    let found = hypervisor
        .find_vm_by_id(VmId::new(305).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.name, "");
    assert!(
        hypervisor
            .find_vm_by_id(VmId::new(306).unwrap())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_clone_asks_for_next_free_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/nextid"))
        .respond_with(data(serde_json::json!("104")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/9000/clone"))
        .and(body_json(serde_json::json!({
            "newid": 104,
            "name": "k3s-worker-0",
            "full": 1,
            "storage": "local-lvm"
        })))
        .respond_with(data(serde_json::json!(UPID)))
        .expect(1)
        .mount(&server)
        .await;
    tasks_finish_with(&server, "OK").await;

    let created = hypervisor(&server)
        .await
        .clone_vm(&CloneRequest {
            template: "local-lvm/9000".parse::<TemplateRef>().unwrap(),
            target: None,
            name: NodeName::new("k3s-worker-0").unwrap(),
        })
        .await
        .unwrap();
    assert_eq!(created, handle(104, "k3s-worker-0"));
}

#[tokio::test]
async fn test_clone_task_failure_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/9000/clone"))
        .respond_with(data(serde_json::json!(UPID)))
        .mount(&server)
        .await;
    tasks_finish_with(&server, "can't lock file '/var/lock/qemu-server/lock-9000.conf' - got timeout").await;

    let err = hypervisor(&server)
        .await
        .clone_vm(&CloneRequest {
            template: "9000".parse::<TemplateRef>().unwrap(),
            target: Some(VmId::new(201).unwrap()),
            name: NodeName::new("k3s-master-0").unwrap(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProxmoxError::TaskFailed { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_clone_is_not_reissued_when_task_status_flickers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/9000/clone"))
        .respond_with(data(serde_json::json!(UPID)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/api2/json/nodes/pve/tasks/.+/status$"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    tasks_finish_with(&server, "OK").await;

    let created = hypervisor(&server)
        .await
        .clone_vm(&CloneRequest {
            template: "9000".parse::<TemplateRef>().unwrap(),
            target: Some(VmId::new(201).unwrap()),
            name: NodeName::new("k3s-master-0").unwrap(),
        })
        .await
        .unwrap();
    assert_eq!(created, handle(201, "k3s-master-0"));
}

#[tokio::test]
async fn test_configure_applies_cloud_init_and_grows_disk() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/201/config"))
        .and(body_partial_json(serde_json::json!({
            "cores": 2,
            "memory": 4096,
            "net0": "virtio,bridge=vmbr0",
            "ciuser": "ubuntu",
            "sshkeys": "ssh-ed25519%20AAAAC3Nza%20ops%40lab",
            "ipconfig0": "ip=192.168.1.100/24,gw=192.168.1.1",
            "nameserver": "8.8.8.8",
            "agent": "1",
            "onboot": 1
        })))
        .respond_with(data(serde_json::Value::Null))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/201/config"))
        .respond_with(data(serde_json::json!({
            "name": "k3s-master-0",
            "scsi0": "local-lvm:vm-201-disk-0,size=2252M"
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api2/json/nodes/pve/qemu/201/resize"))
        .and(body_json(serde_json::json!({ "disk": "scsi0", "size": "20G" })))
        .respond_with(data(serde_json::Value::Null))
        .expect(1)
        .mount(&server)
        .await;

    hypervisor(&server)
        .await
        .configure_vm(&handle(201, "k3s-master-0"), &hardware())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_configure_moves_disk_to_requested_storage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/201/config"))
        .respond_with(data(serde_json::Value::Null))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/201/config"))
        .respond_with(data(serde_json::json!({
            "scsi0": "local-lvm:vm-201-disk-0,size=20G"
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api2/json/nodes/pve/qemu/201/resize"))
        .respond_with(data(serde_json::Value::Null))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/201/move_disk"))
        .and(body_json(serde_json::json!({
            "disk": "scsi0",
            "storage": "ceph",
            "delete": 1
        })))
        .respond_with(data(serde_json::json!(UPID)))
        .expect(1)
        .mount(&server)
        .await;
    tasks_finish_with(&server, "OK").await;

    let mut config = hardware();
    config.disk_storage = Some("ceph".to_string());
    hypervisor(&server)
        .await
        .configure_vm(&handle(201, "k3s-master-0"), &config)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_configure_rejects_missing_disk() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/201/config"))
        .respond_with(data(serde_json::Value::Null))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/201/config"))
        .respond_with(data(serde_json::json!({
            "virtio0": "local-lvm:vm-201-disk-0,size=20G"
        })))
        .mount(&server)
        .await;

    let err = hypervisor(&server)
        .await
        .configure_vm(&handle(201, "k3s-master-0"), &hardware())
        .await
        .unwrap_err();
    assert!(matches!(err, ProxmoxError::Validation(_)));
}

#[tokio::test]
async fn test_start_is_skipped_when_running() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/201/status/current"))
        .respond_with(data(serde_json::json!({
            "status": "running",
            "qmpstatus": "running",
            "agent": 1
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/201/status/start"))
        .respond_with(data(serde_json::json!(UPID)))
        .expect(0)
        .mount(&server)
        .await;

    let hypervisor = hypervisor(&server).await;
    let vm = handle(201, "k3s-master-0");
    assert_eq!(hypervisor.power_state(&vm).await.unwrap(), PowerState::Running);
    hypervisor.start_vm(&vm).await.unwrap();
}

#[tokio::test]
async fn test_power_modes_map_to_endpoints() {
    let server = MockServer::start().await;
    for action in ["reboot", "reset", "shutdown"] {
        Mock::given(method("POST"))
            .and(path(format!(
                "/api2/json/nodes/pve/qemu/201/status/{action}"
            )))
            .respond_with(data(serde_json::json!(UPID)))
            .expect(1)
            .mount(&server)
            .await;
    }
    tasks_finish_with(&server, "OK").await;

    let hypervisor = hypervisor(&server).await;
    let vm = handle(201, "k3s-master-0");
    hypervisor.restart_vm(&vm, PowerMode::Graceful).await.unwrap();
    hypervisor.restart_vm(&vm, PowerMode::Hard).await.unwrap();
    hypervisor.stop_vm(&vm, PowerMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_paused_vm_is_resumed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/201/status/current"))
        .respond_with(data(serde_json::json!({
            "status": "running",
            "qmpstatus": "paused"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/201/status/resume"))
        .respond_with(data(serde_json::json!(UPID)))
        .expect(1)
        .mount(&server)
        .await;
    tasks_finish_with(&server, "OK").await;

    let hypervisor = hypervisor(&server).await;
    let vm = handle(201, "k3s-master-0");
    assert_eq!(hypervisor.power_state(&vm).await.unwrap(), PowerState::Paused);
    hypervisor.resume_vm(&vm).await.unwrap();
}

#[tokio::test]
async fn test_agent_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/201/agent/ping"))
        .respond_with(data(serde_json::Value::Null))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/202/agent/ping"))
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
            "data": null,
            "message": "QEMU guest agent is not running\n"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/203/agent/ping"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let hypervisor = hypervisor(&server).await;
    assert_eq!(
        hypervisor
            .guest_agent_status(&handle(201, "a"))
            .await
            .unwrap(),
        AgentStatus::Ready
    );
    assert_eq!(
        hypervisor
            .guest_agent_status(&handle(202, "b"))
            .await
            .unwrap(),
        AgentStatus::NotReady
    );
    assert!(
        hypervisor
            .guest_agent_status(&handle(203, "c"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_network_interfaces_parse_addresses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(
            "/api2/json/nodes/pve/qemu/201/agent/network-get-interfaces",
        ))
        .respond_with(data(serde_json::json!({
            "result": [
                {
                    "name": "lo",
                    "ip-addresses": [
                        { "ip-address": "127.0.0.1", "ip-address-type": "ipv4", "prefix": 8 }
                    ]
                },
                {
                    "name": "eth0",
                    "ip-addresses": [
                        { "ip-address": "192.168.1.100", "ip-address-type": "ipv4", "prefix": 24 },
                        { "ip-address": "not-an-ip", "ip-address-type": "ipv4" }
                    ]
                }
            ]
        })))
        .mount(&server)
        .await;

    let interfaces = hypervisor(&server)
        .await
        .network_interfaces(&handle(201, "k3s-master-0"))
        .await
        .unwrap();
    assert_eq!(interfaces.len(), 2);
    assert_eq!(interfaces[1].name, "eth0");
    assert_eq!(
        interfaces[1].ip_addresses,
        vec!["192.168.1.100".parse::<IpAddr>().unwrap()]
    );
}

#[tokio::test]
async fn test_guest_exec_passes_input() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/201/agent/exec"))
        .and(body_json(serde_json::json!({
            "command": ["tee", "/etc/sudoers.d/90-k3sadmin"],
            "input-data": "k3sadmin ALL=(ALL) NOPASSWD:ALL\n"
        })))
        .respond_with(data(serde_json::json!({ "pid": 7 })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/201/agent/exec-status"))
        .respond_with(data(serde_json::json!({
            "exited": 1,
            "exitcode": 0,
            "out-data": "k3sadmin ALL=(ALL) NOPASSWD:ALL\n"
        })))
        .mount(&server)
        .await;

    let output = hypervisor(&server)
        .await
        .guest_exec(
            &handle(201, "k3s-master-0"),
            &["tee".to_string(), "/etc/sudoers.d/90-k3sadmin".to_string()],
            Some("k3sadmin ALL=(ALL) NOPASSWD:ALL\n".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(output.exit_code, 0);
    assert!(output.stdout.contains("NOPASSWD"));
}
