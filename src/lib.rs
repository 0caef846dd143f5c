//! Convergent Proxmox VM provisioning and k3s-ansible inventory generation.
//!
//! The crate is organised in layers:
//!
//! - a Proxmox VE REST client ([`ProxmoxClient`]) with ticket login, automatic
//!   re-login and optional rate limiting;
//! - [`ProxmoxHypervisor`], which implements the [`Hypervisor`] capability
//!   trait on top of that client;
//! - the provisioning engine: [`allocate`] turns a [`ClusterPlan`] into
//!   [`NodeSpec`]s, a [`LifecycleDriver`] walks one VM from clone to `Ready`
//!   and the [`FleetOrchestrator`] runs one driver per node;
//! - [`render`], which turns the resulting [`NodeFacts`] into the host list
//!   and variables file of the k3s-ansible playbook, and [`write_inventory`]
//!   which puts them on disk;
//! - [`ConfigStore`], reading the `namespace:key` stack file into a
//!   [`StackConfig`], and [`PlaybookRunner`], which fetches the playbook
//!   repository and runs `ansible-playbook` against the written inventory.
//!
//! # Examples
//!
//! ```no_run
//! use leeca_k3s::{ProxmoxClient, ProxmoxResult};
//!
//! #[tokio::main]
//! async fn main() -> ProxmoxResult<()> {
//!     let client = ProxmoxClient::builder()
//!         .endpoint("https://proxmox.example.com:8006")
//!         .credentials("terraform@pve", "password")
//!         .accept_invalid_certs(true)
//!         .build()?;
//!
//!     client.login().await?;
//!     for vm in client.vms("pve").await? {
//!         println!("{} {:?} {}", vm.vmid, vm.name, vm.status);
//!     }
//!     Ok(())
//! }
//! ```

mod auth;
mod core;
mod inventory;
mod provisioning;

#[cfg(test)]
mod tests;

pub use crate::core::domain::error::{
    FleetError, FleetResult, NodeFailure, ProxmoxError, ProxmoxResult, ValidationError,
};
pub use crate::core::domain::hypervisor::{
    AgentStatus, CloneRequest, CloudInit, GuestExecOutput, Hypervisor, NetworkInterface,
    PowerMode, PowerState, TemplateRef, VmHandle, VmHardwareConfig,
};
pub use crate::core::domain::model::{
    client_config::{ClientConfig, RateLimitConfig},
    cluster_plan::{ClusterPlan, RoleSizing, StaticIpConfig, VmIdRange},
    inventory::{CniFamily, ClusterInventory, ExtraVariables, HostEntry},
    node_facts::NodeFacts,
    node_spec::{NodeRole, NodeSpec, StaticIp},
    node_state::{NodePhase, NodeRuntimeState},
    vm::*,
};
pub use crate::core::domain::value_object::{
    GuestUsername, K3sToken, NodeName, ProxmoxCSRFToken, ProxmoxEndpoint, ProxmoxPassword,
    ProxmoxTicket, ProxmoxUsername, VmId,
};
pub use crate::core::infrastructure::{
    config_store::{ConfigStore, ProxmoxSettings, StackConfig, persist_value},
    playbook::{Invocation, PlaybookRunner, PlaybookSettings, Shell, SystemShell},
    proxmox_hypervisor::ProxmoxHypervisor,
    retry::{RetryConfig, retry_with_backoff},
};
pub use crate::inventory::application::service::{
    inventory_generator::{InventoryOptions, RandomTokens, TokenSource, render},
    writer::{InventoryPaths, write_inventory},
};
pub use crate::provisioning::application::service::{
    fleet_orchestrator::{FleetOrchestrator, FleetReport, NodeOutcome},
    guest_baseline::{BaselineStep, GuestBaseline},
    identity_allocator::allocate,
    lifecycle_driver::{AdminUser, DriverSettings, LifecycleDriver},
};

use crate::core::{
    domain::model::{proxmox_auth::ProxmoxAuth, proxmox_connection::ProxmoxConnection},
    infrastructure::api_client::ApiClient,
};
use std::time::Duration;

/// A client for the parts of the Proxmox VE API that VM provisioning needs.
///
/// Every request is authenticated with a ticket obtained from the configured
/// credentials; expired or rejected tickets are renewed transparently.
#[derive(Debug)]
pub struct ProxmoxClient {
    pub(crate) api_client: ApiClient,
}

/// Collects connection settings for a [`ProxmoxClient`].
#[derive(Debug, Default)]
pub struct ProxmoxClientBuilder {
    endpoint: Option<String>,
    username: Option<String>,
    password: Option<String>,
    accept_invalid_certs: bool,
    config: ClientConfig,
}

impl ProxmoxClientBuilder {
    /// API base URL, e.g. `https://pve.example.com:8006` (a trailing `/api2/json` is accepted).
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// User id in `user@realm` form and its password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Limits requests to `requests_per_second`, allowing bursts of `burst_size`.
    pub fn rate_limit(mut self, requests_per_second: u32, burst_size: u32) -> Self {
        self.config.rate_limit = Some(RateLimitConfig {
            requests_per_second,
            burst_size,
        });
        self
    }

    pub fn ticket_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.ticket_lifetime = lifetime;
        self
    }

    /// How often and how long to wait for asynchronous tasks.
    pub fn task_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.task_poll_interval = interval;
        self.config.task_timeout = timeout;
        self
    }

    /// Validates the settings and builds the client. No request is sent.
    pub fn build(self) -> ProxmoxResult<ProxmoxClient> {
        let endpoint = ProxmoxEndpoint::new(
            self.endpoint
                .as_deref()
                .ok_or_else(|| ValidationError::field("endpoint", "Endpoint is required"))?,
        )?;
        let username = ProxmoxUsername::new(
            self.username
                .ok_or_else(|| ValidationError::field("username", "Username is required"))?,
        )?;
        let password = ProxmoxPassword::new(
            self.password
                .ok_or_else(|| ValidationError::field("password", "Password is required"))?,
        )?;

        let connection =
            ProxmoxConnection::new(endpoint, username, password, self.accept_invalid_certs);
        Ok(ProxmoxClient {
            api_client: ApiClient::new(connection, self.config)?,
        })
    }
}

impl ProxmoxClient {
    pub fn builder() -> ProxmoxClientBuilder {
        ProxmoxClientBuilder::default()
    }

    /// Logs in and stores the ticket for later requests.
    ///
    /// Calling this is optional: the first request logs in on demand.
    pub async fn login(&self) -> ProxmoxResult<()> {
        self.api_client.refresh_auth().await
    }

    /// Returns `true` while a non-expired ticket is held.
    pub async fn is_authenticated(&self) -> bool {
        self.api_client.is_authenticated().await
    }

    /// The current session, if logged in.
    pub async fn auth(&self) -> Option<ProxmoxAuth> {
        self.api_client.auth().await
    }

    pub fn endpoint(&self) -> &ProxmoxEndpoint {
        self.api_client.connection().endpoint()
    }

    pub fn config(&self) -> &ClientConfig {
        self.api_client.config()
    }
}
