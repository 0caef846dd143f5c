//! Walks one VM from template clone to `Ready`.
//!
//! A driver owns the [`NodeRuntimeState`] of exactly one node. Provisioning is
//! split in two halves so the orchestrator can hold workers back until every
//! master has its VM up: [`LifecycleDriver::provision`] ends once the guest
//! agent answers (and the admin account exists), [`LifecycleDriver::finalize`]
//! resolves the guest address and produces the node's [`NodeFacts`].
//!
//! A VM that already exists under the node's name is never cloned again. Its
//! phase is re-derived from what the hypervisor reports, including whether the
//! guest agent answers, which decides the power semantics for the whole run.

use crate::core::{
    domain::{
        error::{FleetError, FleetResult, NodeFailure, ProxmoxError, ProxmoxResult, ValidationError},
        hypervisor::{
            AgentStatus, CloneRequest, CloudInit, GuestExecOutput, Hypervisor, NetworkInterface,
            PowerState, TemplateRef, VmHandle, VmHardwareConfig,
        },
        model::{
            node_facts::NodeFacts,
            node_spec::NodeSpec,
            node_state::{NodePhase, NodeRuntimeState},
        },
        value_object::{GuestUsername, validate_password},
    },
    infrastructure::retry::{RetryConfig, retry_with_backoff},
};
use crate::provisioning::application::service::guest_baseline::{BaselineStep, GuestBaseline};
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Minimum zxcvbn score for admin passwords.
const ADMIN_PASSWORD_MIN_SCORE: zxcvbn::Score = zxcvbn::Score::Two;

/// An account to create inside every guest, as configured.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminUser {
    pub username: String,
    pub password: Option<String>,
    pub ssh_key: Option<String>,
}

impl fmt::Debug for AdminUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminUser")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("ssh_key", &self.ssh_key.as_deref().map(key_preview))
            .finish()
    }
}

impl AdminUser {
    /// Checks the account before the hypervisor is touched.
    ///
    /// # Errors
    /// A [`ValidationError`] when the login name is not a valid POSIX name,
    /// the password is too weak, or neither a password nor a key is given.
    pub fn validate(&self) -> Result<GuestUsername, ValidationError> {
        let username = GuestUsername::new(self.username.trim())?;
        let password = self.password.as_deref().filter(|p| !p.is_empty());
        let ssh_key = self.ssh_key.as_deref().filter(|k| !k.trim().is_empty());
        if password.is_none() && ssh_key.is_none() {
            return Err(ValidationError::field(
                "vm:admin_password",
                format!(
                    "admin user '{}' needs a password, an SSH key or both",
                    username.as_str()
                ),
            ));
        }
        if let Some(password) = password {
            validate_password(
                password,
                Some(ADMIN_PASSWORD_MIN_SCORE),
                &[username.as_str()],
            )?;
        }
        Ok(username)
    }

    fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    fn ssh_key(&self) -> Option<&str> {
        self.ssh_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

/// First characters of a public key, for logs.
pub(crate) fn key_preview(key: &str) -> String {
    let key = key.trim();
    match key.char_indices().nth(24) {
        Some((end, _)) => format!("{}...", &key[..end]),
        None => key.to_string(),
    }
}

/// Everything a driver needs besides the node's own [`NodeSpec`].
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub template: TemplateRef,
    pub description: Option<String>,
    pub disk_size: Option<String>,
    pub disk_device: String,
    pub disk_storage: Option<String>,
    pub bridge: String,
    pub vlan_tag: Option<u16>,
    /// Guest interface whose address is reported. Other interfaces are only
    /// considered when this one has no usable address.
    pub guest_interface: String,
    pub nameserver: Option<String>,
    /// Template account, used until an admin user replaces it.
    pub ssh_user: String,
    pub ssh_keys: Vec<String>,
    /// When false the VM is left stopped after configuration and only started
    /// once the driver needs the guest agent.
    pub start_on_create: bool,
    pub admin_user: Option<AdminUser>,
    /// Applied once the agent answers; `None` leaves the guest as cloned.
    pub baseline: Option<GuestBaseline>,
    pub agent_timeout: Duration,
    pub agent_poll_interval: Duration,
    /// Restart freshly cloned VMs once the agent answers, so cloud-init
    /// changes applied after the first boot take effect.
    pub power_cycle: bool,
    pub retry: RetryConfig,
}

impl DriverSettings {
    /// Settings with the stock defaults for everything but the template.
    pub fn new(template: TemplateRef) -> Self {
        Self {
            template,
            description: None,
            disk_size: None,
            disk_device: "scsi0".to_string(),
            disk_storage: None,
            bridge: "vmbr0".to_string(),
            vlan_tag: None,
            guest_interface: "eth0".to_string(),
            nameserver: None,
            ssh_user: "ubuntu".to_string(),
            ssh_keys: Vec::new(),
            start_on_create: true,
            admin_user: None,
            baseline: None,
            agent_timeout: Duration::from_secs(600),
            agent_poll_interval: Duration::from_secs(5),
            power_cycle: true,
            retry: RetryConfig::default(),
        }
    }

    /// Hardware and cloud-init configuration for `spec`.
    #[must_use]
    pub fn hardware_for(&self, spec: &NodeSpec) -> VmHardwareConfig {
        VmHardwareConfig {
            cores: spec.cores,
            memory_mb: spec.memory_mb,
            disk_size: self.disk_size.clone(),
            disk_device: self.disk_device.clone(),
            disk_storage: self.disk_storage.clone(),
            bridge: self.bridge.clone(),
            vlan_tag: self.vlan_tag,
            description: self.description.clone(),
            start_on_boot: true,
            cloud_init: CloudInit {
                user: self.ssh_user.clone(),
                ssh_keys: self.ssh_keys.clone(),
                static_ip: spec.static_ip,
                nameserver: self.nameserver.clone(),
            },
        }
    }
}

/// Retries `operation` while it fails transiently, then classifies the error.
async fn hypervisor_call<T, F, Fut>(
    retry: &RetryConfig,
    operation: &'static str,
    f: F,
) -> FleetResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProxmoxResult<T>>,
{
    retry_with_backoff(retry, operation, ProxmoxError::is_transient, f)
        .await
        .map_err(|e| FleetError::from_hypervisor(operation, e))
}

pub struct LifecycleDriver {
    hypervisor: Arc<dyn Hypervisor>,
    settings: Arc<DriverSettings>,
    spec: NodeSpec,
    state: NodeRuntimeState,
    /// True when this run cloned the VM rather than finding it.
    created: bool,
}

impl LifecycleDriver {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, settings: Arc<DriverSettings>, spec: NodeSpec) -> Self {
        let state = NodeRuntimeState::new(settings.ssh_user.clone());
        Self {
            hypervisor,
            settings,
            spec,
            state,
            created: false,
        }
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn state(&self) -> &NodeRuntimeState {
        &self.state
    }

    /// Brings the VM up to a guest agent that answers, creating the admin
    /// account on the way when one is configured.
    ///
    /// # Errors
    /// The node's [`NodeFailure`]; the driver is left in `Failed`.
    pub async fn provision(&mut self) -> Result<(), NodeFailure> {
        match self.run_provision().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Resolves the guest address and moves the node to `Ready`.
    ///
    /// # Errors
    /// The node's [`NodeFailure`], including when provisioning already failed.
    pub async fn finalize(&mut self) -> Result<NodeFacts, NodeFailure> {
        if self.state.phase() == NodePhase::Failed {
            return Err(self.failure());
        }
        match self.run_finalize().await {
            Ok(facts) => Ok(facts),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Marks the node failed with `error` and returns its failure record.
    pub(crate) fn fail(&mut self, error: FleetError) -> NodeFailure {
        warn!(vm = %self.spec.name, phase = %self.state.phase(), error = %error, "node failed");
        self.state.fail(error);
        self.failure()
    }

    fn failure(&self) -> NodeFailure {
        let (kind, message) = match self.state.last_error() {
            Some(error) => (error.kind(), error.to_string()),
            None => ("Unknown", "node failed without an error".to_string()),
        };
        NodeFailure {
            name: self.spec.name.to_string(),
            role: self.spec.role,
            phase: self.state.failed_in().unwrap_or(self.state.phase()),
            kind,
            message,
        }
    }

    async fn run_provision(&mut self) -> FleetResult<()> {
        let admin = match &self.settings.admin_user {
            Some(admin) => Some((admin.validate()?, admin.clone())),
            None => None,
        };

        let hypervisor = Arc::clone(&self.hypervisor);
        let settings = Arc::clone(&self.settings);
        let existing = hypervisor_call(&settings.retry, "find VM", || {
            hypervisor.find_vm(&self.spec.name)
        })
        .await?;

        let handle = match existing {
            Some(handle) => self.resume(handle).await?,
            None => self.create().await?,
        };

        if self.state.phase() < NodePhase::AgentReady {
            self.ensure_running(&handle).await?;
            self.state.transition(NodePhase::AwaitingAgent);
            self.wait_for_agent(&handle, "waiting for the first agent response")
                .await?;
            self.state.transition(NodePhase::AgentReady);
        }

        if let Some((username, admin)) = admin {
            self.provision_admin(&handle, &username, &admin).await?;
            self.state.switch_ssh_user(username.as_str());
            self.state.transition(NodePhase::AdminUserProvisioned);
        }

        if let Some(baseline) = &self.settings.baseline {
            let password_login = self
                .settings
                .admin_user
                .as_ref()
                .is_some_and(|admin| admin.password().is_some() && admin.ssh_key().is_none());
            for step in baseline.steps(self.spec.role, password_login) {
                self.run_step(&handle, step).await?;
            }
            info!(vm = %handle, "guest baseline applied");
        }

        if self.created && self.settings.power_cycle {
            self.power_cycle(&handle).await?;
        }
        Ok(())
    }

    /// Re-derives the phase of a VM found on the hypervisor.
    async fn resume(&mut self, handle: VmHandle) -> FleetResult<VmHandle> {
        let hypervisor = Arc::clone(&self.hypervisor);
        let settings = Arc::clone(&self.settings);
        if let Some(planned) = self.spec.vm_id
            && planned != handle.vmid
        {
            warn!(vm = %handle, planned = planned.get(), "existing VM has a different id than planned");
        }
        self.state.set_handle(handle.clone());

        let power = hypervisor_call(&settings.retry, "read power state", || {
            hypervisor.power_state(&handle)
        })
        .await?;
        match power {
            PowerState::Running => {}
            // An earlier run may have stopped anywhere between clone and start.
            PowerState::Stopped => {
                info!(vm = %handle, "found existing VM, stopped; applying configuration");
                self.state.transition(NodePhase::Configuring);
                let hardware = settings.hardware_for(&self.spec);
                hypervisor_call(&settings.retry, "configure", || {
                    hypervisor.configure_vm(&handle, &hardware)
                })
                .await?;
                return Ok(handle);
            }
            PowerState::Paused => {
                info!(vm = %handle, "found existing VM, paused; resuming");
                hypervisor_call(&settings.retry, "resume", || hypervisor.resume_vm(&handle))
                    .await?;
            }
        }

        let agent = hypervisor_call(&settings.retry, "ping guest agent", || {
            hypervisor.guest_agent_status(&handle)
        })
        .await?;
        if agent == AgentStatus::Ready {
            self.state.mark_agent_detected();
            self.state.transition(NodePhase::AgentReady);
        } else {
            self.state.transition(NodePhase::PoweredOn);
        }
        info!(vm = %handle, phase = %self.state.phase(), "found existing VM");
        Ok(handle)
    }

    async fn create(&mut self) -> FleetResult<VmHandle> {
        let hypervisor = Arc::clone(&self.hypervisor);
        let settings = Arc::clone(&self.settings);

        if let Some(vmid) = self.spec.vm_id {
            let holder = hypervisor_call(&settings.retry, "find VM by id", || {
                hypervisor.find_vm_by_id(vmid)
            })
            .await?;
            if let Some(holder) = holder {
                return Err(FleetError::HypervisorFatal {
                    operation: "clone",
                    source: ProxmoxError::Api {
                        status: 409,
                        message: format!(
                            "VM id {vmid} is already used by '{}', refusing to reuse it for '{}'",
                            holder.name, self.spec.name
                        ),
                    },
                });
            }
        }

        self.state.transition(NodePhase::Cloning);
        let request = CloneRequest {
            template: settings.template.clone(),
            target: self.spec.vm_id,
            name: self.spec.name.clone(),
        };
        let hv = hypervisor.as_ref();
        let request = &request;
        let mut attempted = false;
        let handle = hypervisor_call(&settings.retry, "clone", || {
            let retrying = std::mem::replace(&mut attempted, true);
            async move {
                // A failed attempt may still have created the VM.
                if retrying && let Some(existing) = hv.find_vm(&request.name).await? {
                    return Ok(existing);
                }
                hv.clone_vm(request).await
            }
        })
        .await?;
        info!(vm = %handle, template = settings.template.vmid.get(), "cloned template");
        self.state.set_handle(handle.clone());
        self.created = true;

        self.state.transition(NodePhase::Configuring);
        let hardware = settings.hardware_for(&self.spec);
        hypervisor_call(&settings.retry, "configure", || {
            hypervisor.configure_vm(&handle, &hardware)
        })
        .await?;
        debug!(vm = %handle, ipconfig = %hardware.cloud_init.ipconfig(), "configured");

        if settings.start_on_create {
            self.ensure_running(&handle).await?;
        }
        Ok(handle)
    }

    async fn ensure_running(&mut self, handle: &VmHandle) -> FleetResult<()> {
        if self.state.phase() >= NodePhase::PoweredOn {
            return Ok(());
        }
        let hypervisor = Arc::clone(&self.hypervisor);
        let settings = Arc::clone(&self.settings);
        hypervisor_call(&settings.retry, "start", || hypervisor.start_vm(handle)).await?;
        info!(vm = %handle, "started");
        self.state.transition(NodePhase::PoweredOn);
        Ok(())
    }

    /// Polls the guest agent until it answers or `agent_timeout` elapses.
    async fn wait_for_agent(&mut self, handle: &VmHandle, stage: &'static str) -> FleetResult<()> {
        let settings = Arc::clone(&self.settings);
        let started = Instant::now();
        loop {
            match self.hypervisor.guest_agent_status(handle).await {
                Ok(AgentStatus::Ready) => break,
                Ok(AgentStatus::NotReady) => {}
                Err(e) if e.is_transient() => debug!(vm = %handle, error = %e, "agent ping failed"),
                Err(e) => return Err(FleetError::from_hypervisor("ping guest agent", e)),
            }
            if started.elapsed() >= settings.agent_timeout {
                return Err(FleetError::AgentTimeout {
                    vm: handle.name.clone(),
                    stage,
                    waited: settings.agent_timeout,
                });
            }
            sleep(settings.agent_poll_interval).await;
        }
        if !self.state.guest_agent_detected() {
            info!(vm = %handle, waited_ms = started.elapsed().as_millis(), "guest agent detected");
        }
        self.state.mark_agent_detected();
        Ok(())
    }

    async fn provision_admin(
        &mut self,
        handle: &VmHandle,
        username: &GuestUsername,
        admin: &AdminUser,
    ) -> FleetResult<()> {
        let user = username.as_str();
        let exists = self.exec(handle, &["id", "-u", user], None).await?;
        if exists.success() {
            debug!(vm = %handle, user, "admin user already exists");
        } else {
            self.exec_checked(handle, &["useradd", "-m", "-s", "/bin/bash", user], None)
                .await?;
            info!(vm = %handle, user, "created admin user");
        }

        if let Some(password) = admin.password() {
            let hypervisor = Arc::clone(&self.hypervisor);
            let settings = Arc::clone(&self.settings);
            hypervisor_call(&settings.retry, "set admin password", || {
                hypervisor.set_user_password(handle, user, password)
            })
            .await?;
        }

        if let Some(key) = admin.ssh_key() {
            let ssh_dir = format!("/home/{user}/.ssh");
            let authorized_keys = format!("{ssh_dir}/authorized_keys");
            let owner = format!("{user}:{user}");
            self.exec_checked(
                handle,
                &["install", "-d", "-m", "700", "-o", user, "-g", user, &ssh_dir],
                None,
            )
            .await?;
            self.exec_checked(handle, &["tee", &authorized_keys], Some(format!("{key}\n")))
                .await?;
            self.exec_checked(handle, &["chown", &owner, &authorized_keys], None)
                .await?;
            self.exec_checked(handle, &["chmod", "600", &authorized_keys], None)
                .await?;
            debug!(vm = %handle, user, key = %key_preview(key), "installed admin key");
        }

        let sudoers = format!("/etc/sudoers.d/90-{user}");
        self.exec_checked(
            handle,
            &["tee", &sudoers],
            Some(format!("{user} ALL=(ALL) NOPASSWD:ALL\n")),
        )
        .await?;
        self.exec_checked(handle, &["chmod", "0440", &sudoers], None)
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        handle: &VmHandle,
        command: &[&str],
        input: Option<String>,
    ) -> FleetResult<GuestExecOutput> {
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        hypervisor_call(&self.settings.retry, "guest exec", || {
            self.hypervisor.guest_exec(handle, &command, input.clone())
        })
        .await
    }

    async fn run_step(&self, handle: &VmHandle, step: BaselineStep) -> FleetResult<()> {
        debug!(vm = %handle, step = step.label, "baseline step");
        let output = hypervisor_call(&self.settings.retry, "guest exec", || {
            self.hypervisor
                .guest_exec(handle, &step.command, step.input.clone())
        })
        .await?;
        check_exit(step.label, &output)
    }

    /// Like [`Self::exec`], failing on a non-zero exit code.
    async fn exec_checked(
        &self,
        handle: &VmHandle,
        command: &[&str],
        input: Option<String>,
    ) -> FleetResult<()> {
        let output = self.exec(handle, command, input).await?;
        check_exit(command.first().copied().unwrap_or_default(), &output)
    }

    /// Restarts the VM with the node's current power semantics and waits for
    /// the agent to come back.
    async fn power_cycle(&mut self, handle: &VmHandle) -> FleetResult<()> {
        let hypervisor = Arc::clone(&self.hypervisor);
        let settings = Arc::clone(&self.settings);
        let mode = self.state.power_mode();
        info!(vm = %handle, ?mode, "power cycling");
        hypervisor_call(&settings.retry, "restart", || hypervisor.restart_vm(handle, mode)).await?;
        self.wait_for_agent(handle, "waiting for the agent after the power cycle")
            .await
    }

    async fn run_finalize(&mut self) -> FleetResult<NodeFacts> {
        let handle = self.state.handle().cloned().ok_or_else(|| {
            ValidationError::ConstraintViolation(format!(
                "node '{}' has no VM to finalize",
                self.spec.name
            ))
        })?;
        let ip = self.resolve_address(&handle).await?;
        self.state.set_resolved_ip(ip);

        let facts = NodeFacts {
            name: self.spec.name.clone(),
            role: self.spec.role,
            index: self.spec.index,
            vm_id: handle.vmid,
            ip,
            planned_ip: self.spec.static_ip.map(|s| s.address),
            ansible_user: self.state.ssh_user().to_string(),
        };
        if let Some(planned) = facts.ip_mismatch() {
            warn!(vm = %handle, %planned, observed = %ip, "guest reports a different address than planned");
        }
        self.state.transition(NodePhase::Ready);
        info!(vm = %handle, %ip, "ready");
        Ok(facts)
    }

    /// Polls the guest interfaces until one carries a usable address.
    async fn resolve_address(&self, handle: &VmHandle) -> FleetResult<IpAddr> {
        let started = Instant::now();
        loop {
            match self.hypervisor.network_interfaces(handle).await {
                Ok(interfaces) => {
                    if let Some(ip) = pick_address(&interfaces, &self.settings.guest_interface) {
                        return Ok(ip);
                    }
                }
                // The agent drops out briefly while the guest brings its network up.
                Err(ProxmoxError::Api { status: 500, .. }) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(FleetError::from_hypervisor("read guest interfaces", e)),
            }
            if started.elapsed() >= self.settings.agent_timeout {
                return Err(FleetError::AgentTimeout {
                    vm: handle.name.clone(),
                    stage: "waiting for a guest address",
                    waited: self.settings.agent_timeout,
                });
            }
            sleep(self.settings.agent_poll_interval).await;
        }
    }
}

fn check_exit(what: &str, output: &GuestExecOutput) -> FleetResult<()> {
    if output.success() {
        return Ok(());
    }
    Err(FleetError::HypervisorFatal {
        operation: "guest exec",
        source: ProxmoxError::TaskFailed {
            upid: format!("guest-exec:{what}"),
            exit_status: format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
        },
    })
}

/// Picks the first usable address, preferring `preferred` over other
/// interfaces and IPv4 over IPv6.
pub(crate) fn pick_address(interfaces: &[NetworkInterface], preferred: &str) -> Option<IpAddr> {
    let ordered = || {
        interfaces
            .iter()
            .filter(move |i| i.name == preferred)
            .chain(interfaces.iter().filter(move |i| i.name != preferred))
            .flat_map(|i| i.ip_addresses.iter().copied())
    };
    ordered()
        .find(|ip| ip.is_ipv4() && usable(ip))
        .or_else(|| ordered().find(usable))
}

fn usable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()),
        IpAddr::V6(v6) => {
            !(v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xffc0) == 0xfe80)
        }
    }
}
