//! Guest operating-system baseline applied through the guest agent.
//!
//! Package installation is left to the playbook. What runs here is the part
//! the playbook does not own: time zone, a swap file, an sshd drop-in and,
//! when asked for, a ufw rule set opening the k3s ports.
//!
//! Every step is safe to repeat, so resumed nodes run the baseline again.

use crate::core::domain::model::node_spec::NodeRole;

/// sshd keeps the first value it reads and includes `sshd_config.d` in
/// lexical order, so the drop-in sorts before cloud-init's `50-cloud-init.conf`.
pub const SSHD_DROP_IN: &str = "/etc/ssh/sshd_config.d/10-leeca-k3s.conf";

/// Ports every k3s node needs: API server, flannel VXLAN, kubelet.
const NODE_PORTS: [&str; 3] = ["6443/tcp", "8472/udp", "10250/tcp"];

/// Embedded etcd client and peer ports, servers only.
const ETCD_PORTS: &str = "2379:2380/tcp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestBaseline {
    /// Passed to `timedatectl set-timezone`.
    pub timezone: String,
    /// Size of `/swapfile`; `0` leaves swap alone.
    pub swap_mb: u32,
    pub harden_sshd: bool,
    /// Requires `ufw` in the template.
    pub firewall: bool,
}

impl Default for GuestBaseline {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            swap_mb: 2048,
            harden_sshd: true,
            firewall: false,
        }
    }
}

/// One guest command, run as root by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineStep {
    pub label: &'static str,
    pub command: Vec<String>,
    pub input: Option<String>,
}

impl BaselineStep {
    fn new(label: &'static str, command: &[&str]) -> Self {
        Self {
            label,
            command: command.iter().map(|s| s.to_string()).collect(),
            input: None,
        }
    }

    fn script(label: &'static str, script: String) -> Self {
        Self {
            label,
            command: vec!["sh".to_string(), "-c".to_string(), script],
            input: None,
        }
    }

    fn with_input(mut self, input: String) -> Self {
        self.input = Some(input);
        self
    }
}

impl GuestBaseline {
    /// The commands for one node, in execution order.
    ///
    /// `password_login` keeps sshd password authentication on, for admin
    /// accounts that were given a password but no key.
    #[must_use]
    pub fn steps(&self, role: NodeRole, password_login: bool) -> Vec<BaselineStep> {
        let mut steps = vec![BaselineStep::new(
            "timezone",
            &["timedatectl", "set-timezone", self.timezone.as_str()],
        )];

        if self.swap_mb > 0 {
            steps.push(BaselineStep::script("swap", swap_script(self.swap_mb)));
        }

        if self.harden_sshd {
            steps.push(
                BaselineStep::new("sshd drop-in", &["tee", SSHD_DROP_IN])
                    .with_input(sshd_drop_in(password_login)),
            );
            steps.push(BaselineStep::script(
                "sshd reload",
                "sshd -t && (systemctl reload ssh || systemctl reload sshd)".to_string(),
            ));
        }

        if self.firewall {
            steps.push(BaselineStep::script("firewall", firewall_script(role)));
        }
        steps
    }
}

fn swap_script(swap_mb: u32) -> String {
    format!(
        "set -e
if [ -n \"$(swapon --show --noheadings)\" ]; then exit 0; fi
fallocate -l {swap_mb}M /swapfile
chmod 600 /swapfile
mkswap /swapfile
swapon /swapfile
grep -q '^/swapfile ' /etc/fstab || echo '/swapfile none swap sw 0 0' >> /etc/fstab
echo 'vm.swappiness=10' > /etc/sysctl.d/90-swappiness.conf
sysctl -q -p /etc/sysctl.d/90-swappiness.conf
"
    )
}

fn sshd_drop_in(password_login: bool) -> String {
    let password = if password_login { "yes" } else { "no" };
    format!(
        "PermitRootLogin no
PasswordAuthentication {password}
X11Forwarding no
MaxAuthTries 5
ClientAliveInterval 300
ClientAliveCountMax 2
"
    )
}

fn firewall_script(role: NodeRole) -> String {
    let mut script = String::from(
        "set -e
command -v ufw >/dev/null || { echo 'ufw is not installed in the template' >&2; exit 1; }
ufw default deny incoming
ufw default allow outgoing
ufw allow ssh
",
    );
    let mut ports: Vec<&str> = NODE_PORTS.to_vec();
    if role == NodeRole::Master {
        ports.push(ETCD_PORTS);
    }
    for port in ports {
        script.push_str("ufw allow ");
        script.push_str(port);
        script.push('\n');
    }
    script.push_str("ufw --force enable\n");
    script
}
