//! Per-node identity produced by the identity allocator.

use crate::core::domain::value_object::{NodeName, VmId};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

/// The role a node plays in the k3s cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
}

impl NodeRole {
    /// Name of the inventory host group this role belongs to.
    #[must_use]
    pub fn group_name(&self) -> &'static str {
        match self {
            NodeRole::Master => "masters",
            NodeRole::Worker => "workers",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => f.write_str("master"),
            NodeRole::Worker => f.write_str("worker"),
        }
    }
}

/// A statically assigned guest address, rendered into cloud-init `ipconfig0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StaticIp {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

impl StaticIp {
    /// Formats the address as cloud-init expects it: `ip=<addr>/<prefix>,gw=<gw>`.
    #[must_use]
    pub fn as_ipconfig(&self) -> String {
        format!(
            "ip={}/{},gw={}",
            self.address, self.prefix_len, self.gateway
        )
    }
}

/// Everything needed to provision one VM. Immutable once allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSpec {
    pub role: NodeRole,
    /// Zero-based position within the role group.
    pub index: usize,
    pub name: NodeName,
    /// `None` lets the hypervisor pick the next free id.
    pub vm_id: Option<VmId>,
    pub cores: u32,
    pub memory_mb: u32,
    pub static_ip: Option<StaticIp>,
}
