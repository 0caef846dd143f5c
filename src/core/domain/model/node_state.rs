//! Mutable per-node provisioning state, owned by exactly one lifecycle driver.

use crate::core::domain::{
    error::FleetError,
    hypervisor::{PowerMode, VmHandle},
};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

/// Provisioning phases, in the order a fresh node walks through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum NodePhase {
    Planned,
    Cloning,
    Configuring,
    PoweredOn,
    AwaitingAgent,
    AgentReady,
    AdminUserProvisioned,
    Ready,
    Failed,
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub struct NodeRuntimeState {
    phase: NodePhase,
    failed_in: Option<NodePhase>,
    guest_agent_detected: bool,
    handle: Option<VmHandle>,
    resolved_ip: Option<IpAddr>,
    ssh_user: String,
    last_error: Option<FleetError>,
}

impl NodeRuntimeState {
    /// Fresh state for a node that will log in as `ssh_user` (the template account).
    pub fn new(ssh_user: impl Into<String>) -> Self {
        Self {
            phase: NodePhase::Planned,
            failed_in: None,
            guest_agent_detected: false,
            handle: None,
            resolved_ip: None,
            ssh_user: ssh_user.into(),
            last_error: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> NodePhase {
        self.phase
    }

    /// The phase the node was in when it failed, if it failed.
    #[must_use]
    pub fn failed_in(&self) -> Option<NodePhase> {
        self.failed_in
    }

    pub(crate) fn transition(&mut self, to: NodePhase) {
        if self.phase == NodePhase::Failed {
            return;
        }
        debug!(from = %self.phase, to = %to, "phase transition");
        self.phase = to;
    }

    pub(crate) fn fail(&mut self, error: FleetError) {
        if self.phase != NodePhase::Failed {
            self.failed_in = Some(self.phase);
            self.phase = NodePhase::Failed;
        }
        self.last_error = Some(error);
    }

    #[must_use]
    pub fn guest_agent_detected(&self) -> bool {
        self.guest_agent_detected
    }

    /// Records that the guest agent answered. There is no way back.
    pub(crate) fn mark_agent_detected(&mut self) {
        self.guest_agent_detected = true;
    }

    /// Power semantics for every power operation on this node.
    ///
    /// Without an agent the guest cannot be asked to shut down, so only
    /// `stop`/`reset` work; once it has answered, `shutdown`/`reboot` are used.
    #[must_use]
    pub fn power_mode(&self) -> PowerMode {
        if self.guest_agent_detected {
            PowerMode::Graceful
        } else {
            PowerMode::Hard
        }
    }

    #[must_use]
    pub fn handle(&self) -> Option<&VmHandle> {
        self.handle.as_ref()
    }

    pub(crate) fn set_handle(&mut self, handle: VmHandle) {
        self.handle = Some(handle);
    }

    #[must_use]
    pub fn resolved_ip(&self) -> Option<IpAddr> {
        self.resolved_ip
    }

    pub(crate) fn set_resolved_ip(&mut self, ip: IpAddr) {
        self.resolved_ip = Some(ip);
    }

    /// Account used for every later operation on the node, playbook included.
    #[must_use]
    pub fn ssh_user(&self) -> &str {
        &self.ssh_user
    }

    pub(crate) fn switch_ssh_user(&mut self, user: impl Into<String>) {
        self.ssh_user = user.into();
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&FleetError> {
        self.last_error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_mode_flips_once_agent_detected() {
        let mut state = NodeRuntimeState::new("ubuntu");
        assert_eq!(state.power_mode(), PowerMode::Hard);
        state.mark_agent_detected();
        assert_eq!(state.power_mode(), PowerMode::Graceful);
        state.transition(NodePhase::Ready);
        assert_eq!(state.power_mode(), PowerMode::Graceful);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut state = NodeRuntimeState::new("ubuntu");
        state.transition(NodePhase::Cloning);
        state.fail(FleetError::Cancelled);
        state.transition(NodePhase::Ready);
        assert_eq!(state.phase(), NodePhase::Failed);
        assert_eq!(state.failed_in(), Some(NodePhase::Cloning));
        assert_eq!(state.last_error().map(FleetError::kind), Some("Cancelled"));
    }

    #[test]
    fn test_phases_are_ordered() {
        assert!(NodePhase::Planned < NodePhase::Cloning);
        assert!(NodePhase::AgentReady < NodePhase::AdminUserProvisioned);
        assert!(NodePhase::AdminUserProvisioned < NodePhase::Ready);
    }
}
