//! The generated k3s-ansible inventory: host groups plus `group_vars/all.yml`.

use crate::core::domain::{
    error::ValidationError,
    model::node_spec::NodeRole,
    value_object::{K3sToken, NodeName},
};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;

/// Pod network plugin families understood by the playbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CniFamily {
    Flannel,
    Calico,
    Cilium,
}

impl CniFamily {
    pub const ALL: [CniFamily; 3] = [CniFamily::Flannel, CniFamily::Calico, CniFamily::Cilium];

    /// The key whose presence selects this family.
    #[must_use]
    pub fn required_key(&self) -> &'static str {
        match self {
            CniFamily::Flannel => "flannel_iface",
            CniFamily::Calico => "calico_iface",
            CniFamily::Cilium => "cilium_iface",
        }
    }

    /// Every variable that belongs to this family's block.
    #[must_use]
    pub fn keys(&self) -> &'static [&'static str] {
        match self {
            CniFamily::Flannel => &["flannel_iface"],
            CniFamily::Calico => &["calico_iface", "calico_tag", "calico_ebpf"],
            CniFamily::Cilium => &[
                "cilium_iface",
                "cilium_mode",
                "cilium_tag",
                "cilium_hubble",
                "cilium_bgp",
            ],
        }
    }

    /// The family a variable belongs to, if it is a CNI variable at all.
    #[must_use]
    pub fn owning(key: &str) -> Option<CniFamily> {
        CniFamily::ALL
            .into_iter()
            .find(|family| family.keys().contains(&key))
    }
}

/// Free-form variables forwarded to `group_vars/all.yml` under their own names.
///
/// Backed by a `BTreeMap` so iteration order, and therefore rendered output,
/// never depends on insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraVariables(BTreeMap<String, Value>);

impl ExtraVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Returns a scalar value as a string; null and empty strings count as absent.
    pub fn get_string(&self, key: &str) -> Result<Option<String>, ValidationError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(ValidationError::field(key, "expected a scalar value")),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ExtraVariables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One line of the hosts file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub hostname: NodeName,
    pub ip: IpAddr,
    /// Set only when this host logs in as a different user than the fleet default.
    pub ansible_user: Option<String>,
}

/// Section headers of the hosts file, as named by the k3s-ansible playbook.
pub const MASTER_SECTION: &str = "master";
pub const WORKER_SECTION: &str = "node";
pub const CLUSTER_SECTION: &str = "k3s_cluster:children";

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInventory {
    pub masters: Vec<HostEntry>,
    pub workers: Vec<HostEntry>,
    /// Ordered variables: required cluster fields, the CNI block, then pass-through keys.
    pub variables: Mapping,
    pub cni: CniFamily,
    /// Present when no token was supplied and one had to be generated.
    /// The caller must persist it, or the next run will produce another.
    pub generated_token: Option<K3sToken>,
}

impl ClusterInventory {
    /// Hosts grouped by role name, `masters` and `workers`.
    #[must_use]
    pub fn host_groups(&self) -> BTreeMap<&'static str, &[HostEntry]> {
        BTreeMap::from([
            (NodeRole::Master.group_name(), self.masters.as_slice()),
            (NodeRole::Worker.group_name(), self.workers.as_slice()),
        ])
    }

    #[must_use]
    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Renders `hosts.ini`.
    #[must_use]
    pub fn hosts_file(&self) -> String {
        let mut out = String::new();
        write_section(&mut out, MASTER_SECTION, &self.masters);
        out.push('\n');
        write_section(&mut out, WORKER_SECTION, &self.workers);
        out.push('\n');
        let _ = writeln!(out, "[{CLUSTER_SECTION}]");
        let _ = writeln!(out, "{MASTER_SECTION}");
        let _ = writeln!(out, "{WORKER_SECTION}");
        out
    }

    /// Renders `group_vars/all.yml`.
    pub fn variables_file(&self) -> Result<String, serde_yaml::Error> {
        let body = serde_yaml::to_string(&self.variables)?;
        Ok(format!("---\n{body}"))
    }
}

fn write_section(out: &mut String, section: &str, hosts: &[HostEntry]) {
    let _ = writeln!(out, "[{section}]");
    for host in hosts {
        let _ = write!(out, "{} ansible_host={}", host.hostname, host.ip);
        if let Some(user) = &host.ansible_user {
            let _ = write!(out, " ansible_user={user}");
        }
        out.push('\n');
    }
}
