//! Request and response payloads for the QEMU endpoints used during provisioning.
//!
//! Every Proxmox response wraps its payload in a `data` member; see [`ApiResponse`].

use crate::core::domain::value_object::serde_helpers::{number_or_string, proxmox_bool};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The `{"data": ...}` envelope around every API response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// A virtual machine as returned by the `/nodes/{node}/qemu` endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VmListItem {
    /// The VM identifier (unique per cluster).
    pub vmid: u32,
    /// Human-readable name. Absent for VMs created without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Current status (e.g., "running", "stopped").
    pub status: String,
    /// Set for templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<u8>,
    /// Maximum memory in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxmem: Option<u64>,
    /// Maximum disk space in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxdisk: Option<u64>,
    /// Uptime in seconds (if running).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

/// Runtime status of a VM from `/nodes/{node}/qemu/{vmid}/status/current`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VmStatusCurrent {
    /// Current VM status (e.g., "running", "stopped").
    pub status: String,
    #[serde(default)]
    pub name: Option<String>,
    /// QEMU process status, more precise than `status` while pausing.
    #[serde(default)]
    pub qmpstatus: Option<String>,
    /// Whether the guest agent is enabled in the VM config.
    #[serde(default, with = "proxmox_bool")]
    pub agent: bool,
    #[serde(default)]
    pub uptime: Option<u64>,
}

/// VM configuration from `/nodes/{node}/qemu/{vmid}/config`.
///
/// Only the keys provisioning reads are typed; disks, NICs and everything
/// else stay in `options` under their Proxmox names (`scsi0`, `net0`, ...).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VmConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cores: Option<u32>,
    /// Memory in MB.
    #[serde(default, with = "number_or_string")]
    pub memory: Option<u64>,
    /// Configuration digest, for optimistic locking of updates.
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl VmConfig {
    /// The raw drive string for `device`, e.g. `local-lvm:vm-201-disk-0,size=20G`.
    #[must_use]
    pub fn drive(&self, device: &str) -> Option<&str> {
        self.options.get(device).and_then(serde_json::Value::as_str)
    }

    /// Storage the drive on `device` lives on.
    #[must_use]
    pub fn drive_storage(&self, device: &str) -> Option<&str> {
        self.drive(device)?
            .split(',')
            .next()?
            .split_once(':')
            .map(|(storage, _)| storage)
    }

    /// Size of the drive on `device`, in bytes.
    #[must_use]
    pub fn drive_size_bytes(&self, device: &str) -> Option<u64> {
        self.drive(device)?
            .split(',')
            .find_map(|part| part.strip_prefix("size="))
            .and_then(parse_size)
    }
}

/// Parses a Proxmox size such as `20G`, `512M` or `1T` into bytes.
/// A bare number is taken as gigabytes, as the resize endpoint does.
#[must_use]
pub fn parse_size(size: &str) -> Option<u64> {
    let size = size.trim().trim_start_matches('+');
    let (digits, unit) = match size.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(at) => size.split_at(at),
        None => (size, "G"),
    };
    let value: f64 = digits.parse().ok()?;
    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => return None,
    };
    Some((value * multiplier as f64) as u64)
}

/// Parameters for `POST /nodes/{node}/qemu/{template}/clone`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloneVmParams {
    /// Id of the new VM.
    pub newid: u32,
    pub name: String,
    /// `1` for a full (independent) clone.
    pub full: u8,
    /// Target storage for the full clone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Parameters for `POST /nodes/{node}/qemu/{vmid}/config`. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateVmConfigParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    /// Memory in MB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
    /// Network device, e.g. `virtio,bridge=vmbr0,tag=30`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net0: Option<String>,
    /// Cloud-init user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciuser: Option<String>,
    /// Cloud-init public keys, URL-encoded, one per line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sshkeys: Option<String>,
    /// Cloud-init address, `ip=dhcp` or `ip=<addr>/<prefix>,gw=<gw>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipconfig0: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameserver: Option<String>,
    /// Guest agent, `1` to enable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Start at boot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onboot: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Parameters for `PUT /nodes/{node}/qemu/{vmid}/resize`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResizeDiskParams {
    pub disk: String,
    /// Absolute (`20G`) or relative (`+5G`) size.
    pub size: String,
}

/// Parameters for `POST /nodes/{node}/qemu/{vmid}/move_disk`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoveDiskParams {
    pub disk: String,
    pub storage: String,
    /// `1` removes the source volume after the move.
    pub delete: u8,
}

/// Status of an asynchronous task from `/nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskStatus {
    /// `running` or `stopped`.
    pub status: String,
    /// Present once stopped: `OK` or an error message.
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// `Some(Ok)` or `Some(Err(message))` once the task stopped.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<(), String>> {
        if self.is_running() {
            return None;
        }
        match self.exitstatus.as_deref() {
            Some("OK") => Some(Ok(())),
            // Proxmox reports warnings as a successful run.
            Some(status) if status.starts_with("WARNINGS") => Some(Ok(())),
            Some(status) => Some(Err(status.to_string())),
            None => Some(Err("task stopped without exit status".to_string())),
        }
    }
}

/// `agent/network-get-interfaces` wraps its list in a `result` member.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentInterfaces {
    pub result: Vec<AgentInterface>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentInterface {
    pub name: String,
    #[serde(default, rename = "hardware-address")]
    pub hardware_address: Option<String>,
    #[serde(default, rename = "ip-addresses")]
    pub ip_addresses: Vec<AgentIpAddress>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentIpAddress {
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    /// `ipv4` or `ipv6`.
    #[serde(rename = "ip-address-type")]
    pub ip_address_type: String,
    #[serde(default)]
    pub prefix: Option<u8>,
}

/// Parameters for `POST /nodes/{node}/qemu/{vmid}/agent/exec`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentExecParams {
    /// Program and arguments; no shell is involved.
    pub command: Vec<String>,
    /// Data passed on the command's stdin.
    #[serde(rename = "input-data", skip_serializing_if = "Option::is_none")]
    pub input_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentExecResponse {
    pub pid: u64,
}

/// Result of `GET /nodes/{node}/qemu/{vmid}/agent/exec-status?pid=`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentExecStatus {
    #[serde(with = "proxmox_bool")]
    pub exited: bool,
    #[serde(default)]
    pub exitcode: Option<i32>,
    #[serde(default, rename = "out-data")]
    pub out_data: Option<String>,
    #[serde(default, rename = "err-data")]
    pub err_data: Option<String>,
}

/// Parameters for `POST /nodes/{node}/qemu/{vmid}/agent/set-user-password`.
#[derive(Serialize)]
pub struct SetUserPasswordParams<'a> {
    pub username: &'a str,
    pub password: &'a str,
}
