//! The hypervisor capability surface the provisioning engine is written against.
//!
//! [`crate::ProxmoxHypervisor`] implements it over the Proxmox REST API; tests
//! substitute the generated `MockHypervisor` or an in-memory fake.

use crate::core::domain::{
    error::{ProxmoxResult, ValidationError},
    model::node_spec::StaticIp,
    value_object::{NodeName, VmId},
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A VM that exists on the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmHandle {
    pub vmid: VmId,
    pub name: String,
    /// Cluster node hosting the VM.
    pub node: String,
}

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.vmid)
    }
}

/// How power operations are issued.
///
/// `Hard` maps to `stop`/`reset`, `Graceful` to `shutdown`/`reboot`, which
/// need a guest agent inside the VM to be answered.
///
/// The lifecycle driver restarts a node only after its agent answered, so it
/// always ends up with `Graceful`. `Hard` serves callers that have to
/// power-cycle a guest without an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerMode {
    Hard,
    Graceful,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Stopped,
    Paused,
}

impl PowerState {
    /// Maps the Proxmox `status` field. Unknown values count as stopped.
    #[must_use]
    pub fn from_status(status: &str) -> Self {
        match status {
            "running" => PowerState::Running,
            "paused" | "suspended" => PowerState::Paused,
            _ => PowerState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Ready,
    NotReady,
}

/// A guest network interface as reported by the guest agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub ip_addresses: Vec<IpAddr>,
}

/// Result of a finished guest command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GuestExecOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The template a node is cloned from, written `9000` or `<storage>/9000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    pub vmid: VmId,
    /// Target storage for the full clone; the template's own storage when absent.
    pub storage: Option<String>,
}

impl FromStr for TemplateRef {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (storage, id) = match s.rsplit_once('/') {
            Some((storage, id)) if !storage.is_empty() => (Some(storage.to_string()), id),
            Some(_) => return Err(ValidationError::field("vm:template", "empty storage name")),
            None => (None, s),
        };
        let id: u32 = id.parse().map_err(|_| {
            ValidationError::field("vm:template", format!("'{s}' is not a template id"))
        })?;
        Ok(Self {
            vmid: VmId::new(id)?,
            storage,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub template: TemplateRef,
    /// `None` asks the hypervisor for the next free id.
    pub target: Option<VmId>,
    pub name: NodeName,
}

/// Cloud-init settings applied together with the hardware configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudInit {
    pub user: String,
    pub ssh_keys: Vec<String>,
    /// `None` means DHCP.
    pub static_ip: Option<StaticIp>,
    pub nameserver: Option<String>,
}

impl CloudInit {
    /// Value of the `ipconfig0` option.
    #[must_use]
    pub fn ipconfig(&self) -> String {
        match &self.static_ip {
            Some(ip) => ip.as_ipconfig(),
            None => "ip=dhcp".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHardwareConfig {
    pub cores: u32,
    pub memory_mb: u32,
    /// Absolute size such as `20G`; the disk is never shrunk.
    pub disk_size: Option<String>,
    pub disk_device: String,
    /// Storage the disk should live on; moved there when it differs.
    pub disk_storage: Option<String>,
    pub bridge: String,
    pub vlan_tag: Option<u16>,
    pub description: Option<String>,
    pub start_on_boot: bool,
    pub cloud_init: CloudInit,
}

impl VmHardwareConfig {
    /// Value of the `net0` option.
    #[must_use]
    pub fn net0(&self) -> String {
        match self.vlan_tag {
            Some(tag) => format!("virtio,bridge={},tag={tag}", self.bridge),
            None => format!("virtio,bridge={}", self.bridge),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Looks a VM up by name.
    async fn find_vm(&self, name: &NodeName) -> ProxmoxResult<Option<VmHandle>>;

    /// Looks a VM up by id.
    async fn find_vm_by_id(&self, vmid: VmId) -> ProxmoxResult<Option<VmHandle>>;

    /// Full-clones the template and waits for the clone task to finish.
    async fn clone_vm(&self, request: &CloneRequest) -> ProxmoxResult<VmHandle>;

    async fn configure_vm(&self, handle: &VmHandle, config: &VmHardwareConfig)
    -> ProxmoxResult<()>;

    async fn start_vm(&self, handle: &VmHandle) -> ProxmoxResult<()>;

    /// Resumes a paused or suspended VM. `start` is refused for those.
    async fn resume_vm(&self, handle: &VmHandle) -> ProxmoxResult<()>;

    /// Powers the VM off.
    ///
    /// The lifecycle driver never calls this: failed and cancelled nodes are
    /// left as they are for the operator.
    async fn stop_vm(&self, handle: &VmHandle, mode: PowerMode) -> ProxmoxResult<()>;

    async fn restart_vm(&self, handle: &VmHandle, mode: PowerMode) -> ProxmoxResult<()>;

    async fn power_state(&self, handle: &VmHandle) -> ProxmoxResult<PowerState>;

    async fn guest_agent_status(&self, handle: &VmHandle) -> ProxmoxResult<AgentStatus>;

    async fn network_interfaces(&self, handle: &VmHandle) -> ProxmoxResult<Vec<NetworkInterface>>;

    /// Runs a command in the guest, feeding `input` on stdin, and waits for it to exit.
    async fn guest_exec(
        &self,
        handle: &VmHandle,
        command: &[String],
        input: Option<String>,
    ) -> ProxmoxResult<GuestExecOutput>;

    async fn set_user_password(
        &self,
        handle: &VmHandle,
        username: &str,
        password: &str,
    ) -> ProxmoxResult<()>;
}
