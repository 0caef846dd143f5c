//! Namespaced stack configuration.
//!
//! A stack file looks like
//!
//! ```yaml
//! config:
//!   proxmox:endpoint: https://pve.lan:8006/api2/json
//!   proxmox:username: terraform@pve
//!   vm:template: "9000"
//!   k3s:master_count: 3
//!   ansible:apiserver_endpoint: 192.168.1.222
//! ```
//!
//! [`ConfigStore`] holds the raw `namespace:key` values; [`ConfigStore::stack_config`]
//! turns them into the typed settings every other layer consumes.

use crate::core::domain::{
    error::{FleetError, FleetResult, ProxmoxResult, ValidationError},
    hypervisor::TemplateRef,
    model::{
        client_config::RateLimitConfig,
        cluster_plan::{ClusterPlan, RoleSizing, StaticIpConfig, VmIdRange},
        inventory::ExtraVariables,
    },
    value_object::VmId,
};
use crate::core::infrastructure::playbook::PlaybookSettings;
use crate::inventory::application::service::inventory_generator::InventoryOptions;
use crate::provisioning::application::service::guest_baseline::GuestBaseline;
use crate::provisioning::application::service::lifecycle_driver::{
    AdminUser, DriverSettings, key_preview,
};
use crate::ProxmoxClient;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_ENDPOINT: &str = "https://proxmox.example.com:8006/api2/json";
pub const DEFAULT_K3S_VERSION: &str = "v1.29.2+k3s1";
pub const DEFAULT_REPO_URL: &str = "https://github.com/techno-tim/k3s-ansible.git";
pub const DEFAULT_CONCURRENCY: usize = 4;

/// `ansible:` keys that steer the playbook checkout instead of being forwarded.
const PLAYBOOK_KEYS: [&str; 5] = [
    "repo_url",
    "repo_branch",
    "local_path",
    "use_ansible",
    "cache_repo",
];

/// Environment variables that take precedence over the stack file.
const ENV_OVERRIDES: [(&str, &str); 3] = [
    ("PROXMOX_ENDPOINT", "proxmox:endpoint"),
    ("PROXMOX_USERNAME", "proxmox:username"),
    ("PROXMOX_PASSWORD", "proxmox:password"),
];

const KEY_PREFIXES: [&str; 4] = ["ssh-rsa", "ssh-ed25519", "ssh-dss", "ecdsa-"];

#[derive(Deserialize)]
struct StackFile {
    #[serde(default)]
    config: Mapping,
}

/// Raw `namespace:key` configuration values.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    values: BTreeMap<String, Value>,
    home: Option<PathBuf>,
}

impl ConfigStore {
    /// Parses a stack file body.
    pub fn from_yaml(yaml: &str) -> FleetResult<Self> {
        let file: StackFile = serde_yaml::from_str(yaml)
            .map_err(|e| ValidationError::Format(format!("invalid stack file: {e}")))?;

        let mut values = BTreeMap::new();
        for (key, value) in file.config {
            let Value::String(key) = key else {
                return Err(ValidationError::Format(format!(
                    "configuration keys must be strings, found {key:?}"
                ))
                .into());
            };
            values.insert(key, value);
        }
        Ok(Self {
            values,
            home: std::env::var_os("HOME").map(PathBuf::from),
        })
    }

    /// Reads and parses the stack file at `path`.
    pub async fn load(path: impl AsRef<Path>) -> FleetResult<Self> {
        let path = path.as_ref();
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| FleetError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let store = Self::from_yaml(&body)?;
        debug!(path = %path.display(), keys = store.values.len(), "Loaded stack configuration");
        Ok(store)
    }

    /// Directory that `~` expands to.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Applies `PROXMOX_ENDPOINT`, `PROXMOX_USERNAME` and `PROXMOX_PASSWORD`
    /// from `vars`; empty values are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (name, value) in vars {
            let Some((_, key)) = ENV_OVERRIDES
                .iter()
                .find(|(env, _)| *env == name.as_ref())
            else {
                continue;
            };
            let value = value.into();
            if value.is_empty() {
                continue;
            }
            debug!(key, "Configuration value overridden from the environment");
            self.values.insert((*key).to_string(), Value::String(value));
        }
    }

    /// [`ConfigStore::apply_overrides`] with the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    /// A scalar value as text. Null and blank strings count as absent.
    pub fn string(&self, key: &str) -> Result<Option<String>, ValidationError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(ValidationError::field(key, "expected a scalar value")),
        }
    }

    pub fn string_or(&self, key: &str, default: &str) -> Result<String, ValidationError> {
        Ok(self.string(key)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn require(&self, key: &str) -> Result<String, ValidationError> {
        self.string(key)?
            .ok_or_else(|| ValidationError::field(key, "is required"))
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ValidationError> {
        let Some(text) = self.string(key)? else {
            return Ok(default);
        };
        match text.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(ValidationError::field(
                key,
                format!("'{text}' is not a boolean"),
            )),
        }
    }

    pub fn number<T: FromStr>(&self, key: &str) -> Result<Option<T>, ValidationError> {
        self.string(key)?
            .map(|text| {
                text.parse().map_err(|_| {
                    ValidationError::field(key, format!("'{text}' is not a valid number"))
                })
            })
            .transpose()
    }

    pub fn number_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ValidationError> {
        Ok(self.number(key)?.unwrap_or(default))
    }

    /// Every key of `namespace`, without the `namespace:` prefix.
    pub fn namespace<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = (&'a str, &'a Value)> {
        self.values.iter().filter_map(move |(key, value)| {
            key.strip_prefix(namespace)
                .and_then(|rest| rest.strip_prefix(':'))
                .map(|rest| (rest, value))
        })
    }

    /// Builds the typed configuration of one run.
    ///
    /// SSH public keys given as a path are read from disk here.
    ///
    /// # Errors
    /// `FleetError::Config` naming the offending key, or `FleetError::Io`
    /// when a referenced key file cannot be read.
    pub async fn stack_config(&self) -> FleetResult<StackConfig> {
        let proxmox = self.proxmox_settings()?;
        let plan = self.cluster_plan()?;
        let driver = self.driver_settings().await?;
        let inventory = InventoryOptions {
            k3s_version: self.string_or("k3s:version", DEFAULT_K3S_VERSION)?,
            install_args: self.string("k3s:install_args")?,
            ansible_ssh_private_key_file: self
                .expand_home(&self.require("vm:ssh_private_key_path")?)
                .display()
                .to_string(),
            master_count: plan.master_count,
            accept_degraded: false,
        };
        let concurrency: usize = self.number_or("k3s:concurrency", DEFAULT_CONCURRENCY)?;
        if concurrency == 0 {
            return Err(ValidationError::field("k3s:concurrency", "must be at least 1").into());
        }

        Ok(StackConfig {
            proxmox,
            plan,
            driver,
            extra_vars: self.extra_variables(),
            inventory,
            playbook: self.playbook_settings()?,
            concurrency,
        })
    }

    fn proxmox_settings(&self) -> Result<ProxmoxSettings, ValidationError> {
        let rate_limit = match self.number::<u32>("proxmox:requests_per_second")? {
            Some(0) => {
                return Err(ValidationError::field(
                    "proxmox:requests_per_second",
                    "must be at least 1",
                ));
            }
            Some(requests_per_second) => Some(RateLimitConfig {
                requests_per_second,
                burst_size: self.number_or("proxmox:burst", requests_per_second)?,
            }),
            None => None,
        };
        Ok(ProxmoxSettings {
            endpoint: self.string_or("proxmox:endpoint", DEFAULT_ENDPOINT)?,
            username: self.require("proxmox:username")?,
            password: self.require("proxmox:password")?,
            insecure: self.bool_or("proxmox:insecure", true)?,
            node: self.string_or("proxmox:node", "pve")?,
            rate_limit,
        })
    }

    fn cluster_plan(&self) -> Result<ClusterPlan, ValidationError> {
        let cores: u32 = self.number_or("vm:cores", 2)?;
        let memory_mb: u32 = self.number_or("vm:memory", 4096)?;
        let sizing = |role: &str, default_prefix: &str| -> Result<RoleSizing, ValidationError> {
            Ok(RoleSizing {
                name_prefix: self.string_or(&format!("k3s:{role}_name_prefix"), default_prefix)?,
                cores: self.number_or(&format!("k3s:{role}_cores"), cores)?,
                memory_mb: self.number_or(&format!("k3s:{role}_memory"), memory_mb)?,
            })
        };

        let vm_id_range = match (
            self.number::<u32>("vm:vm_id_min")?,
            self.number::<u32>("vm:vm_id_max")?,
        ) {
            (None, None) => None,
            (Some(min), Some(max)) => {
                if min > max {
                    return Err(ValidationError::field(
                        "vm:vm_id_min",
                        format!("{min} is greater than vm:vm_id_max {max}"),
                    ));
                }
                Some(VmIdRange {
                    min: VmId::new(min)?,
                    max: VmId::new(max)?,
                })
            }
            _ => {
                return Err(ValidationError::field(
                    "vm:vm_id_min",
                    "vm:vm_id_min and vm:vm_id_max must be set together",
                ));
            }
        };

        let static_ip = if self.bool_or("k3s:use_static_ips", false)? {
            Some(StaticIpConfig {
                network: self.string_or("k3s:ip_network", "192.168.1.0/24")?,
                gateway: self.string_or("k3s:ip_gateway", "192.168.1.1")?,
                start_offset: self.number_or("k3s:ip_start", 100)?,
            })
        } else {
            None
        };

        Ok(ClusterPlan {
            master_count: self.number_or("k3s:master_count", 1)?,
            worker_count: self.number_or("k3s:worker_count", 0)?,
            masters: sizing("master", "k3s-master")?,
            workers: sizing("worker", "k3s-worker")?,
            vm_id_range,
            static_ip,
        })
    }

    async fn driver_settings(&self) -> FleetResult<DriverSettings> {
        let template = TemplateRef::from_str(&self.require("vm:template")?)?;
        let ssh_key = self.read_key("vm:ssh_public_key").await?.ok_or_else(|| {
            ValidationError::field("vm:ssh_public_key", "is required")
        })?;
        info!(key = %key_preview(&ssh_key), "Using SSH public key");

        let admin_user = if self.bool_or("vm:create_admin_user", false)? {
            Some(AdminUser {
                username: self.require("vm:admin_username")?,
                password: self.string("vm:admin_password")?,
                ssh_key: self.read_key("vm:admin_ssh_key").await?,
            })
        } else {
            None
        };

        let mut settings = DriverSettings::new(template);
        settings.description = Some(self.string_or(
            "vm:description",
            "K3s node managed by leeca-k3s",
        )?);
        settings.disk_size = Some(self.string_or("vm:disk_size", "20G")?);
        settings.disk_device = self.string_or("vm:disk_device", &settings.disk_device)?;
        settings.disk_storage = self.string("vm:disk_storage")?;
        settings.bridge = self.string_or("vm:network_bridge", &settings.bridge)?;
        settings.vlan_tag = self.number("vm:vlan_tag")?;
        settings.guest_interface = self.string_or("vm:guest_interface", &settings.guest_interface)?;
        settings.nameserver = Some(self.string_or("vm:dns_server", "8.8.8.8")?);
        settings.ssh_user = self.string_or("vm:ssh_user", &settings.ssh_user)?;
        settings.ssh_keys = vec![ssh_key];
        settings.start_on_create = self.bool_or("vm:start_on_create", true)?;
        settings.admin_user = admin_user;
        settings.agent_timeout =
            Duration::from_secs(self.number_or("vm:agent_timeout_secs", 600)?);
        settings.agent_poll_interval =
            Duration::from_secs(self.number_or("vm:agent_poll_interval_secs", 5)?);
        settings.power_cycle = self.bool_or("vm:power_cycle", true)?;
        settings.baseline = if self.bool_or("vm:guest_baseline", true)? {
            let defaults = GuestBaseline::default();
            Some(GuestBaseline {
                timezone: self.string_or("vm:timezone", &defaults.timezone)?,
                swap_mb: self.number_or("vm:swap_mb", defaults.swap_mb)?,
                harden_sshd: self.bool_or("vm:harden_sshd", defaults.harden_sshd)?,
                firewall: self.bool_or("vm:firewall", defaults.firewall)?,
            })
        } else {
            None
        };
        Ok(settings)
    }

    fn extra_variables(&self) -> ExtraVariables {
        self.namespace("ansible")
            .filter(|(key, _)| !PLAYBOOK_KEYS.contains(key))
            .map(|(key, value)| (key, value.clone()))
            .collect()
    }

    fn playbook_settings(&self) -> Result<PlaybookSettings, ValidationError> {
        let local_path = self.string_or("ansible:local_path", "k3s-ansible")?;
        let local_path = self.expand_home(&local_path);
        let local_path = if local_path.is_relative() {
            match &self.home {
                Some(home) => home.join(local_path),
                None => local_path,
            }
        } else {
            local_path
        };
        Ok(PlaybookSettings {
            enabled: self.bool_or("ansible:use_ansible", true)?,
            cache_repo: self.bool_or("ansible:cache_repo", true)?,
            ..PlaybookSettings::new(
                self.string_or("ansible:repo_url", DEFAULT_REPO_URL)?,
                self.string_or("ansible:repo_branch", "master")?,
                local_path,
            )
        })
    }

    /// Key text as given, or the content of the file it points at.
    async fn read_key(&self, key: &str) -> FleetResult<Option<String>> {
        let Some(value) = self.string(key)? else {
            return Ok(None);
        };
        if KEY_PREFIXES.iter().any(|prefix| value.starts_with(prefix)) {
            return Ok(Some(value));
        }
        if !(value.starts_with('/') || value.starts_with('~')) {
            return Err(ValidationError::field(
                key,
                "expected an SSH public key or an absolute path to one",
            )
            .into());
        }

        let path = self.expand_home(&value);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| FleetError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(key, path = %path.display(), "Read SSH key from file");
        Ok(Some(content.trim().to_string()))
    }

    fn expand_home(&self, path: &str) -> PathBuf {
        match (path.strip_prefix('~'), &self.home) {
            (Some(rest), Some(home)) => home.join(rest.trim_start_matches('/')),
            _ => PathBuf::from(path),
        }
    }
}

/// Connection settings of the Proxmox API.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxmoxSettings {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub insecure: bool,
    pub node: String,
    pub rate_limit: Option<RateLimitConfig>,
}

impl fmt::Debug for ProxmoxSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxmoxSettings")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"***")
            .field("insecure", &self.insecure)
            .field("node", &self.node)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

impl ProxmoxSettings {
    /// Builds an API client for these settings. No request is sent.
    pub fn client(&self) -> ProxmoxResult<ProxmoxClient> {
        let mut builder = ProxmoxClient::builder()
            .endpoint(&self.endpoint)
            .credentials(&self.username, &self.password)
            .accept_invalid_certs(self.insecure);
        if let Some(limit) = self.rate_limit {
            builder = builder.rate_limit(limit.requests_per_second, limit.burst_size);
        }
        builder.build()
    }
}

/// The typed configuration of one run.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub proxmox: ProxmoxSettings,
    pub plan: ClusterPlan,
    pub driver: DriverSettings,
    /// `ansible:*` pass-through variables, prefix removed.
    pub extra_vars: ExtraVariables,
    pub inventory: InventoryOptions,
    pub playbook: PlaybookSettings,
    pub concurrency: usize,
}

/// Stores `value` under `key` in the stack file at `path`, keeping every
/// other entry. Comments in the file are not preserved.
pub async fn persist_value(path: impl AsRef<Path>, key: &str, value: &str) -> FleetResult<()> {
    let path = path.as_ref();
    let io_error = |source| FleetError::Io {
        path: path.to_path_buf(),
        source,
    };
    let body = tokio::fs::read_to_string(path).await.map_err(io_error)?;
    let mut document: Value = serde_yaml::from_str(&body)
        .map_err(|e| ValidationError::Format(format!("invalid stack file: {e}")))?;
    if document.is_null() {
        document = Value::Mapping(Mapping::new());
    }

    let Value::Mapping(root) = &mut document else {
        return Err(ValidationError::Format("stack file is not a mapping".to_string()).into());
    };
    if !root.contains_key("config") {
        root.insert(Value::from("config"), Value::Mapping(Mapping::new()));
    }
    let Some(Value::Mapping(config)) = root.get_mut("config") else {
        return Err(ValidationError::Format("'config' is not a mapping".to_string()).into());
    };
    config.insert(Value::from(key), Value::from(value));

    let body = serde_yaml::to_string(&document)
        .map_err(|e| ValidationError::Format(format!("stack file cannot be serialized: {e}")))?;
    tokio::fs::write(path, body).await.map_err(io_error)?;
    info!(path = %path.display(), key, "Stored configuration value");
    Ok(())
}
