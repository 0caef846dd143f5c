//! Deterministic VM ids, hostnames and static addresses for every node.
//!
//! Masters are enumerated before workers. Ids are taken sequentially from
//! the reserved range and static addresses from `network + start_offset`, in
//! that same order, so masters always hold the lowest ids and addresses.

use crate::core::domain::{
    error::{FleetResult, ValidationError},
    model::{
        cluster_plan::{ClusterPlan, RoleSizing, StaticIpConfig},
        node_spec::{NodeRole, NodeSpec, StaticIp},
    },
    value_object::{NodeName, VmId},
};
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Expands `plan` into one [`NodeSpec`] per VM. Pure and deterministic.
///
/// # Errors
/// `FleetError::Config` when the plan has no master, the id range is too
/// small, the network cannot hold every node, or two nodes would share a name.
pub fn allocate(plan: &ClusterPlan) -> FleetResult<Vec<NodeSpec>> {
    if plan.master_count == 0 {
        return Err(ValidationError::ConstraintViolation(
            "a cluster needs at least one master".to_string(),
        )
        .into());
    }
    validate_sizing("k3s:master", &plan.masters)?;
    if plan.worker_count > 0 {
        validate_sizing("k3s:worker", &plan.workers)?;
    }

    let total = plan.total_nodes();
    let ids = vm_ids(plan, total)?;
    let addresses = match &plan.static_ip {
        Some(config) => Some(static_ips(config, total)?),
        None => None,
    };

    let roles = std::iter::repeat_n((NodeRole::Master, &plan.masters), plan.master_count)
        .enumerate()
        .chain(
            std::iter::repeat_n((NodeRole::Worker, &plan.workers), plan.worker_count).enumerate(),
        );

    let mut names = HashSet::with_capacity(total);
    let mut specs = Vec::with_capacity(total);
    for (sequence, (index, (role, sizing))) in roles.enumerate() {
        let name = NodeName::new(format!("{}-{index}", sizing.name_prefix))?;
        if !names.insert(name.clone()) {
            return Err(ValidationError::ConstraintViolation(format!(
                "node name '{name}' would be used twice; master and worker prefixes must differ"
            ))
            .into());
        }
        specs.push(NodeSpec {
            role,
            index,
            name,
            vm_id: ids.as_ref().map(|ids| ids[sequence]),
            cores: sizing.cores,
            memory_mb: sizing.memory_mb,
            static_ip: addresses.as_ref().map(|ips| ips[sequence]),
        });
    }
    Ok(specs)
}

fn validate_sizing(namespace: &str, sizing: &RoleSizing) -> Result<(), ValidationError> {
    if sizing.cores == 0 {
        return Err(ValidationError::field(
            format!("{namespace}_cores"),
            "must be at least 1",
        ));
    }
    if sizing.memory_mb < 512 {
        return Err(ValidationError::field(
            format!("{namespace}_memory"),
            "must be at least 512 MB",
        ));
    }
    Ok(())
}

fn vm_ids(plan: &ClusterPlan, total: usize) -> Result<Option<Vec<VmId>>, ValidationError> {
    let Some(range) = plan.vm_id_range else {
        return Ok(None);
    };
    if range.len() < total {
        return Err(ValidationError::ConstraintViolation(format!(
            "VM id range {}..={} holds {} ids but {total} nodes are planned",
            range.min,
            range.max,
            range.len()
        )));
    }
    (0..total as u32)
        .map(|offset| VmId::new(range.min.get() + offset))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn static_ips(config: &StaticIpConfig, total: usize) -> Result<Vec<StaticIp>, ValidationError> {
    let network: Ipv4Net = config.network.trim().parse().map_err(|_| {
        ValidationError::field(
            "k3s:ip_network",
            format!("'{}' is not an IPv4 CIDR", config.network),
        )
    })?;
    let gateway: Ipv4Addr = config.gateway.trim().parse().map_err(|_| {
        ValidationError::field(
            "k3s:ip_gateway",
            format!("'{}' is not an IPv4 address", config.gateway),
        )
    })?;
    if !network.contains(&gateway) {
        return Err(ValidationError::field(
            "k3s:ip_gateway",
            format!("{gateway} is outside {network}"),
        ));
    }

    let base = u32::from(network.network());
    let broadcast = u32::from(network.broadcast());
    let mut addresses = Vec::with_capacity(total);
    for sequence in 0..total as u32 {
        let host = base
            .checked_add(config.start_offset)
            .and_then(|first| first.checked_add(sequence))
            .filter(|host| *host > base && *host < broadcast)
            .ok_or_else(|| {
                ValidationError::ConstraintViolation(format!(
                    "{network} has no room for {total} nodes starting at offset {}",
                    config.start_offset
                ))
            })?;
        let address = Ipv4Addr::from(host);
        if address == gateway {
            return Err(ValidationError::ConstraintViolation(format!(
                "static address range starting at offset {} includes the gateway {gateway}",
                config.start_offset
            )));
        }
        addresses.push(StaticIp {
            address,
            prefix_len: network.prefix_len(),
            gateway,
        });
    }
    Ok(addresses)
}
