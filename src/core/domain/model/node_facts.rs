//! Connection facts a provisioned node contributes to the inventory.

use crate::core::domain::{
    model::node_spec::NodeRole,
    value_object::{NodeName, VmId},
};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFacts {
    pub name: NodeName,
    pub role: NodeRole,
    pub index: usize,
    pub vm_id: VmId,
    /// Address observed through the guest agent.
    pub ip: IpAddr,
    /// Static address the node was planned with, if any.
    pub planned_ip: Option<Ipv4Addr>,
    pub ansible_user: String,
}

impl NodeFacts {
    /// Returns the planned address when the guest reports a different one.
    #[must_use]
    pub fn ip_mismatch(&self) -> Option<Ipv4Addr> {
        self.planned_ip
            .filter(|planned| IpAddr::V4(*planned) != self.ip)
    }
}
