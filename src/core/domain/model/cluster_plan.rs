//! The immutable description of the fleet to build, computed once per run.

use crate::core::domain::value_object::VmId;

/// Inclusive range of guest ids reserved for this cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmIdRange {
    pub min: VmId,
    pub max: VmId,
}

impl VmIdRange {
    /// Number of ids in the range; zero when `min > max`.
    #[must_use]
    pub fn len(&self) -> usize {
        if self.min > self.max {
            0
        } else {
            (self.max.get() - self.min.get()) as usize + 1
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Static addressing for the whole fleet.
///
/// Node `i` (masters first, then workers) receives `network + start_offset + i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIpConfig {
    /// CIDR notation, e.g. `192.168.1.0/24`. Parsed by the allocator.
    pub network: String,
    pub gateway: String,
    pub start_offset: u32,
}

/// Naming and sizing shared by every node of one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSizing {
    pub name_prefix: String,
    pub cores: u32,
    pub memory_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPlan {
    pub master_count: usize,
    pub worker_count: usize,
    pub masters: RoleSizing,
    pub workers: RoleSizing,
    pub vm_id_range: Option<VmIdRange>,
    pub static_ip: Option<StaticIpConfig>,
}

impl ClusterPlan {
    #[must_use]
    pub fn total_nodes(&self) -> usize {
        self.master_count + self.worker_count
    }

    /// More than one server means an embedded-etcd HA control plane.
    #[must_use]
    pub fn is_ha(&self) -> bool {
        self.master_count > 1
    }
}
