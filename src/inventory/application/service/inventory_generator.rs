//! Turns node facts and pass-through variables into a [`ClusterInventory`].
//!
//! Rendering is a pure function of its inputs: the only source of
//! randomness, join token generation, is injected through [`TokenSource`].
//! Variables are emitted in a fixed order (required cluster fields, the CNI
//! block, MetalLB, server/agent arguments, then every remaining pass-through
//! key sorted by name) so identical inputs give byte-identical files.

use crate::core::domain::{
    error::{FleetError, FleetResult, ValidationError},
    model::{
        inventory::{ClusterInventory, CniFamily, ExtraVariables, HostEntry},
        node_facts::NodeFacts,
        node_spec::NodeRole,
    },
    value_object::K3sToken,
};
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

pub const DEFAULT_SYSTEMD_DIR: &str = "/etc/systemd/system";
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_CLUSTER_CIDR: &str = "10.52.0.0/16";
pub const DEFAULT_FLANNEL_IFACE: &str = "eth0";
pub const DEFAULT_METAL_LB_MODE: &str = "layer2";
pub const DEFAULT_METAL_LB_TYPE: &str = "native";
pub const DEFAULT_METAL_LB_IP_RANGE: &str = "192.168.1.150-192.168.1.160";

/// Source of fresh k3s join tokens.
pub trait TokenSource: Send + Sync {
    fn generate(&self) -> K3sToken;
}

impl<F> TokenSource for F
where
    F: Fn() -> K3sToken + Send + Sync,
{
    fn generate(&self) -> K3sToken {
        self()
    }
}

/// Tokens from the operating system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTokens;

impl TokenSource for RandomTokens {
    fn generate(&self) -> K3sToken {
        K3sToken::generate()
    }
}

/// Inputs to [`render`] that come from the cluster configuration rather
/// than from the pass-through variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryOptions {
    pub k3s_version: String,
    /// Appended to the default `extra_server_args`.
    pub install_args: Option<String>,
    pub ansible_ssh_private_key_file: String,
    /// Masters the cluster was planned with; the quorum target.
    pub master_count: usize,
    /// Render even when fewer masters than planned survived.
    pub accept_degraded: bool,
}

impl InventoryOptions {
    #[must_use]
    pub fn is_ha(&self) -> bool {
        self.master_count > 1
    }
}

/// Builds the inventory for the surviving fleet.
///
/// # Errors
/// - `FleetError::NoSurvivingMasters` when `facts` holds no master.
/// - `FleetError::QuorumShortfall` when an HA cluster lost masters and
///   degraded output was not accepted.
/// - `FleetError::Config` when the CNI selection is ambiguous, an HA cluster
///   has no `apiserver_endpoint`, or an interpreted variable is malformed.
pub fn render(
    facts: &[NodeFacts],
    extra: &ExtraVariables,
    options: &InventoryOptions,
    tokens: &dyn TokenSource,
) -> FleetResult<ClusterInventory> {
    let mut masters: Vec<&NodeFacts> = facts.iter().filter(|f| f.role == NodeRole::Master).collect();
    let mut workers: Vec<&NodeFacts> = facts.iter().filter(|f| f.role == NodeRole::Worker).collect();
    masters.sort_by_key(|f| f.index);
    workers.sort_by_key(|f| f.index);

    let Some(first_master) = masters.first() else {
        return Err(FleetError::NoSurvivingMasters {
            failures: Vec::new(),
        });
    };
    if options.is_ha() && masters.len() < options.master_count {
        if !options.accept_degraded {
            return Err(FleetError::QuorumShortfall {
                expected: options.master_count,
                surviving: masters.len(),
            });
        }
        warn!(
            expected = options.master_count,
            surviving = masters.len(),
            "rendering a degraded inventory"
        );
    }

    let mut vars = Variables::new(extra);

    let ansible_user = vars
        .take("ansible_user")?
        .unwrap_or_else(|| first_master.ansible_user.clone());
    let host = |facts: &&NodeFacts| HostEntry {
        hostname: facts.name.clone(),
        ip: facts.ip,
        ansible_user: (facts.ansible_user != ansible_user).then(|| facts.ansible_user.clone()),
    };
    let master_hosts: Vec<HostEntry> = masters.iter().map(host).collect();
    let worker_hosts: Vec<HostEntry> = workers.iter().map(host).collect();

    let k3s_version = vars
        .take("k3s_version")?
        .unwrap_or_else(|| options.k3s_version.clone());
    vars.emit("k3s_version", k3s_version);
    vars.emit("ansible_user", ansible_user);
    vars.emit_or("systemd_dir", DEFAULT_SYSTEMD_DIR)?;
    vars.emit_or("system_timezone", DEFAULT_TIMEZONE)?;

    let endpoint = match vars.take("apiserver_endpoint")? {
        Some(endpoint) => endpoint,
        None if options.is_ha() => {
            return Err(ValidationError::field(
                "ansible:apiserver_endpoint",
                format!(
                    "a cluster with {} masters needs a virtual IP for the API server",
                    options.master_count
                ),
            )
            .into());
        }
        None => first_master.ip.to_string(),
    };
    vars.emit("apiserver_endpoint", endpoint.clone());

    let generated_token = match vars.take("k3s_token")? {
        Some(token) => {
            vars.emit("k3s_token", K3sToken::new(token)?.as_str());
            None
        }
        None => {
            let token = tokens.generate();
            debug!("generated k3s join token");
            vars.emit("k3s_token", token.as_str());
            Some(token)
        }
    };

    vars.emit_or("cluster_cidr", DEFAULT_CLUSTER_CIDR)?;
    let cni = vars.emit_cni()?;

    vars.emit_or("metal_lb_mode", DEFAULT_METAL_LB_MODE)?;
    vars.emit_or("metal_lb_type", DEFAULT_METAL_LB_TYPE)?;
    vars.emit_or("metal_lb_ip_range", DEFAULT_METAL_LB_IP_RANGE)?;

    let server_args = match vars.take("extra_server_args")? {
        Some(args) => args,
        None => {
            let mut args = format!("--disable servicelb --disable traefik --tls-san {endpoint}");
            if let Some(install) = options.install_args.as_deref().map(str::trim)
                && !install.is_empty()
            {
                args.push(' ');
                args.push_str(install);
            }
            args
        }
    };
    vars.emit("extra_server_args", server_args);
    if let Some(agent_args) = vars.take("extra_agent_args")? {
        vars.emit("extra_agent_args", agent_args);
    }
    let key_file = vars
        .take("ansible_ssh_private_key_file")?
        .unwrap_or_else(|| options.ansible_ssh_private_key_file.clone());
    vars.emit("ansible_ssh_private_key_file", key_file);

    let variables = vars.finish();
    Ok(ClusterInventory {
        masters: master_hosts,
        workers: worker_hosts,
        variables,
        cni,
        generated_token,
    })
}

/// Output mapping plus the set of pass-through keys already consumed.
struct Variables<'a> {
    extra: &'a ExtraVariables,
    consumed: HashSet<&'static str>,
    out: Mapping,
}

impl<'a> Variables<'a> {
    fn new(extra: &'a ExtraVariables) -> Self {
        Self {
            extra,
            consumed: HashSet::new(),
            out: Mapping::new(),
        }
    }

    /// Reads an interpreted scalar and keeps it out of the pass-through tail.
    fn take(&mut self, key: &'static str) -> Result<Option<String>, ValidationError> {
        self.consumed.insert(key);
        self.extra.get_string(key)
    }

    fn emit(&mut self, key: &str, value: impl Into<Value>) {
        self.out.insert(Value::from(key), value.into());
    }

    /// Copies `key` verbatim when given, `default` otherwise.
    fn emit_or(&mut self, key: &'static str, default: &str) -> Result<(), ValidationError> {
        self.consumed.insert(key);
        let extra = self.extra;
        match extra.get(key) {
            Some(value) if present(value) => {
                extra.get_string(key)?;
                self.out.insert(Value::from(key), value.clone());
            }
            _ => self.emit(key, default),
        }
        Ok(())
    }

    /// Emits the single active CNI block.
    fn emit_cni(&mut self) -> Result<CniFamily, ValidationError> {
        let extra = self.extra;
        let mut active: Vec<CniFamily> = Vec::new();
        for family in CniFamily::ALL {
            self.consumed.extend(family.keys());
            let given: Vec<&str> = family
                .keys()
                .iter()
                .copied()
                .filter(|key| extra.get(key).is_some_and(present))
                .collect();
            if given.is_empty() {
                continue;
            }
            if !given.contains(&family.required_key()) {
                return Err(ValidationError::field(
                    format!("ansible:{}", family.required_key()),
                    format!(
                        "{} is set but the {family:?} block has no {}",
                        given.join(", "),
                        family.required_key()
                    ),
                ));
            }
            active.push(family);
        }

        match active.as_slice() {
            [] => {
                self.emit(
                    CniFamily::Flannel.required_key(),
                    DEFAULT_FLANNEL_IFACE,
                );
                Ok(CniFamily::Flannel)
            }
            [family] => {
                for key in family.keys() {
                    if let Some(value) = extra.get(key).filter(|v| present(v)) {
                        self.out.insert(Value::from(*key), value.clone());
                    }
                }
                Ok(*family)
            }
            families => Err(ValidationError::ConstraintViolation(format!(
                "exactly one CNI may be configured, found {}",
                families
                    .iter()
                    .map(|f| format!("{f:?}"))
                    .collect::<Vec<_>>()
                    .join(" and ")
            ))),
        }
    }

    /// Appends every remaining pass-through key, sorted by name.
    fn finish(mut self) -> Mapping {
        let extra = self.extra;
        for (key, value) in extra.iter() {
            if self.consumed.contains(key.as_str()) || !present(value) {
                continue;
            }
            self.out.insert(Value::from(key.as_str()), value.clone());
        }
        self.out
    }
}

/// Null and blank strings count as "not set".
fn present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::value_object::{NodeName, VmId};

    fn node(role: NodeRole, index: usize, ip: &str) -> NodeFacts {
        let prefix = match role {
            NodeRole::Master => "k3s-master",
            NodeRole::Worker => "k3s-worker",
        };
        NodeFacts {
            name: NodeName::new(format!("{prefix}-{index}")).unwrap(),
            role,
            index,
            vm_id: VmId::new(200 + index as u32 + if role == NodeRole::Worker { 10 } else { 0 })
                .unwrap(),
            ip: ip.parse().unwrap(),
            planned_ip: None,
            ansible_user: "ubuntu".to_string(),
        }
    }

    fn fleet() -> Vec<NodeFacts> {
        vec![
            node(NodeRole::Master, 0, "192.168.1.100"),
            node(NodeRole::Master, 1, "192.168.1.101"),
            node(NodeRole::Master, 2, "192.168.1.102"),
            node(NodeRole::Worker, 0, "192.168.1.103"),
            node(NodeRole::Worker, 1, "192.168.1.104"),
        ]
    }

    fn options(master_count: usize) -> InventoryOptions {
        InventoryOptions {
            k3s_version: "v1.29.2+k3s1".to_string(),
            install_args: None,
            ansible_ssh_private_key_file: "~/.ssh/id_ed25519".to_string(),
            master_count,
            accept_degraded: false,
        }
    }

    fn fixed_token() -> K3sToken {
        K3sToken::new("Zq3XbN8pLr2VwT6yKc9HmJd4FsGa7Ue1").unwrap()
    }

    fn ha_vars() -> ExtraVariables {
        [("apiserver_endpoint", "192.168.1.222")].into_iter().collect()
    }

    fn keys(inventory: &ClusterInventory) -> Vec<&str> {
        inventory
            .variables
            .keys()
            .filter_map(Value::as_str)
            .collect()
    }

    #[test]
    fn test_host_groups_follow_allocation_order() {
        let mut facts = fleet();
        facts.reverse();
        let inventory = render(&facts, &ha_vars(), &options(3), &fixed_token).unwrap();

        let names: Vec<&str> = inventory.masters.iter().map(|h| h.hostname.as_str()).collect();
        assert_eq!(names, ["k3s-master-0", "k3s-master-1", "k3s-master-2"]);
        assert_eq!(inventory.workers.len(), 2);
        assert_eq!(inventory.workers[0].ip.to_string(), "192.168.1.103");
    }

    #[test]
    fn test_required_fields_and_order() {
        let inventory = render(&fleet(), &ha_vars(), &options(3), &fixed_token).unwrap();
        assert_eq!(
            keys(&inventory),
            [
                "k3s_version",
                "ansible_user",
                "systemd_dir",
                "system_timezone",
                "apiserver_endpoint",
                "k3s_token",
                "cluster_cidr",
                "flannel_iface",
                "metal_lb_mode",
                "metal_lb_type",
                "metal_lb_ip_range",
                "extra_server_args",
                "ansible_ssh_private_key_file",
            ]
        );
        assert_eq!(
            inventory.variable("extra_server_args"),
            Some(&Value::from(
                "--disable servicelb --disable traefik --tls-san 192.168.1.222"
            ))
        );
        assert_eq!(inventory.cni, CniFamily::Flannel);
        assert!(inventory.variable("extra_agent_args").is_none());
    }

    #[test]
    fn test_ha_without_endpoint_is_config_error() {
        let result = render(&fleet(), &ExtraVariables::new(), &options(3), &fixed_token);
        assert!(matches!(result, Err(FleetError::Config(_))));
    }

    #[test]
    fn test_single_master_defaults_endpoint_to_its_address() {
        let facts = vec![node(NodeRole::Master, 0, "10.0.0.5")];
        let inventory = render(&facts, &ExtraVariables::new(), &options(1), &fixed_token).unwrap();
        assert_eq!(
            inventory.variable("apiserver_endpoint"),
            Some(&Value::from("10.0.0.5"))
        );
    }

    #[test]
    fn test_token_generated_only_when_absent() {
        let inventory = render(&fleet(), &ha_vars(), &options(3), &fixed_token).unwrap();
        assert_eq!(inventory.generated_token, Some(fixed_token()));
        assert_eq!(
            inventory.variable("k3s_token"),
            Some(&Value::from(fixed_token().as_str()))
        );

        let mut vars = ha_vars();
        vars.insert("k3s_token", "operator-supplied-token");
        let inventory = render(&fleet(), &vars, &options(3), &fixed_token).unwrap();
        assert_eq!(inventory.generated_token, None);
        assert_eq!(
            inventory.variable("k3s_token"),
            Some(&Value::from("operator-supplied-token"))
        );
    }

    #[test]
    fn test_random_tokens_are_alphanumeric() {
        let token = RandomTokens.generate();
        assert_eq!(token.as_str().len(), 32);
        assert!(token.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_cni_blocks_are_exclusive() {
        let mut calico = ha_vars();
        calico.insert("calico_iface", "eth0");
        calico.insert("calico_tag", "v3.27.2");
        let inventory = render(&fleet(), &calico, &options(3), &fixed_token).unwrap();
        assert_eq!(inventory.cni, CniFamily::Calico);
        assert!(inventory.variable("flannel_iface").is_none());
        assert_eq!(inventory.variable("calico_tag"), Some(&Value::from("v3.27.2")));

        let mut both = calico.clone();
        both.insert("cilium_iface", "eth0");
        assert!(matches!(
            render(&fleet(), &both, &options(3), &fixed_token),
            Err(FleetError::Config(ValidationError::ConstraintViolation(_)))
        ));

        let mut orphan = ha_vars();
        orphan.insert("cilium_hubble", true);
        assert!(matches!(
            render(&fleet(), &orphan, &options(3), &fixed_token),
            Err(FleetError::Config(ValidationError::Field { .. }))
        ));

        let mut flannel_and_calico = calico;
        flannel_and_calico.insert("flannel_iface", "ens18");
        assert!(render(&fleet(), &flannel_and_calico, &options(3), &fixed_token).is_err());
    }

    #[test]
    fn test_pass_through_keys_are_sorted_and_blank_ones_dropped() {
        let mut vars = ha_vars();
        vars.insert("zz_custom", "last");
        vars.insert("metal_lb_speaker_tag_version", "v0.14.3");
        vars.insert("proxmox_lxc_configure", false);
        vars.insert("unset", Value::Null);
        vars.insert("blank", "  ");
        vars.insert("system_timezone", "Europe/Madrid");

        let inventory = render(&fleet(), &vars, &options(3), &fixed_token).unwrap();
        let keys = keys(&inventory);
        assert_eq!(
            &keys[keys.len() - 3..],
            ["metal_lb_speaker_tag_version", "proxmox_lxc_configure", "zz_custom"]
        );
        assert!(!keys.contains(&"unset"));
        assert!(!keys.contains(&"blank"));
        assert_eq!(
            inventory.variable("system_timezone"),
            Some(&Value::from("Europe/Madrid"))
        );
    }

    #[test]
    fn test_quorum_shortfall() {
        let facts: Vec<NodeFacts> = fleet()
            .into_iter()
            .filter(|f| !(f.role == NodeRole::Master && f.index == 1))
            .collect();
        assert!(matches!(
            render(&facts, &ha_vars(), &options(3), &fixed_token),
            Err(FleetError::QuorumShortfall {
                expected: 3,
                surviving: 2
            })
        ));

        let mut degraded = options(3);
        degraded.accept_degraded = true;
        let inventory = render(&facts, &ha_vars(), &degraded, &fixed_token).unwrap();
        assert_eq!(inventory.masters.len(), 2);

        let workers_only: Vec<NodeFacts> = fleet()
            .into_iter()
            .filter(|f| f.role == NodeRole::Worker)
            .collect();
        assert!(matches!(
            render(&workers_only, &ha_vars(), &degraded, &fixed_token),
            Err(FleetError::NoSurvivingMasters { .. })
        ));
    }

    #[test]
    fn test_per_host_user_override() {
        let mut facts = fleet();
        facts[4].ansible_user = "k3sadmin".to_string();
        let inventory = render(&facts, &ha_vars(), &options(3), &fixed_token).unwrap();
        assert_eq!(inventory.masters[0].ansible_user, None);
        assert_eq!(inventory.workers[1].ansible_user.as_deref(), Some("k3sadmin"));
        assert_eq!(inventory.variable("ansible_user"), Some(&Value::from("ubuntu")));
    }

    #[test]
    fn test_render_is_byte_identical() {
        let mut vars = ha_vars();
        vars.insert("k3s_token", "operator-supplied-token");
        vars.insert("metal_lb_ip_range", "10.0.0.80-10.0.0.90");
        let first = render(&fleet(), &vars, &options(3), &RandomTokens).unwrap();
        let second = render(&fleet(), &vars, &options(3), &RandomTokens).unwrap();
        assert_eq!(first.hosts_file(), second.hosts_file());
        assert_eq!(
            first.variables_file().unwrap(),
            second.variables_file().unwrap()
        );
        assert!(first.variables_file().unwrap().starts_with("---\nk3s_version: v1.29.2+k3s1\n"));
    }

    #[test]
    fn test_install_args_are_appended() {
        let mut options = options(1);
        options.install_args = Some("--write-kubeconfig-mode 644".to_string());
        let facts = vec![node(NodeRole::Master, 0, "10.0.0.5")];
        let inventory = render(&facts, &ExtraVariables::new(), &options, &fixed_token).unwrap();
        assert_eq!(
            inventory.variable("extra_server_args"),
            Some(&Value::from(
                "--disable servicelb --disable traefik --tls-san 10.0.0.5 --write-kubeconfig-mode 644"
            ))
        );
    }
}
