//! [`Hypervisor`] implementation backed by the Proxmox VE REST API.

use crate::{
    ProxmoxClient,
    core::domain::{
        error::{ProxmoxError, ProxmoxResult, ValidationError},
        hypervisor::{
            AgentStatus, CloneRequest, GuestExecOutput, Hypervisor, NetworkInterface, PowerMode,
            PowerState, VmHandle, VmHardwareConfig,
        },
        model::vm::{
            AgentExecParams, CloneVmParams, MoveDiskParams, ResizeDiskParams,
            UpdateVmConfigParams, VmListItem, parse_size,
        },
        value_object::{NodeName, VmId},
    },
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Drives VMs on one Proxmox node.
pub struct ProxmoxHypervisor {
    client: Arc<ProxmoxClient>,
    node: String,
    /// Held from `cluster/nextid` until the clone request is accepted, so two
    /// drivers never receive the same free id.
    id_reservation: Mutex<()>,
}

impl ProxmoxHypervisor {
    pub fn new(client: Arc<ProxmoxClient>, node: impl Into<String>) -> Self {
        Self {
            client,
            node: node.into(),
            id_reservation: Mutex::new(()),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn handle(&self, vm: &VmListItem) -> ProxmoxResult<VmHandle> {
        Ok(VmHandle {
            vmid: VmId::new(vm.vmid)?,
            name: vm.name.clone().unwrap_or_default(),
            node: self.node.clone(),
        })
    }

    async fn wait(&self, upid: &str) -> ProxmoxResult<()> {
        self.client.wait_for_task(&self.node, upid).await
    }

    async fn ensure_disk(&self, handle: &VmHandle, config: &VmHardwareConfig) -> ProxmoxResult<()> {
        let vmid = handle.vmid.get();
        let device = config.disk_device.as_str();
        let current = self.client.vm_config(&self.node, vmid).await?;
        if current.drive(device).is_none() {
            return Err(ValidationError::field(
                "vm:disk_device",
                format!("{handle} has no disk on '{device}'"),
            )
            .into());
        }

        if let Some(size) = &config.disk_size {
            let target = parse_size(size).ok_or_else(|| {
                ValidationError::field("vm:disk_size", format!("'{size}' is not a disk size"))
            })?;
            // Proxmox refuses to shrink; only grow.
            if current.drive_size_bytes(device).is_some_and(|have| have < target) {
                info!(vm = %handle, disk = device, size = %size, "resizing disk");
                self.client
                    .resize_disk(
                        &self.node,
                        vmid,
                        &ResizeDiskParams {
                            disk: device.to_string(),
                            size: size.clone(),
                        },
                    )
                    .await?;
            }
        }

        if let Some(storage) = &config.disk_storage
            && current.drive_storage(device) != Some(storage.as_str())
        {
            info!(vm = %handle, disk = device, storage = %storage, "moving disk");
            let upid = self
                .client
                .move_disk(
                    &self.node,
                    vmid,
                    &MoveDiskParams {
                        disk: device.to_string(),
                        storage: storage.clone(),
                        delete: 1,
                    },
                )
                .await?;
            self.wait(&upid).await?;
        }
        Ok(())
    }
}

/// Cloud-init expects the key list URL-encoded with `%20` for spaces.
pub(crate) fn encode_ssh_keys(keys: &[String]) -> String {
    url::form_urlencoded::byte_serialize(keys.join("\n").as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

#[async_trait]
impl Hypervisor for ProxmoxHypervisor {
    async fn find_vm(&self, name: &NodeName) -> ProxmoxResult<Option<VmHandle>> {
        let vms = self.client.vms(&self.node).await?;
        vms.iter()
            .find(|vm| vm.template != Some(1) && vm.name.as_deref() == Some(name.as_str()))
            .map(|vm| self.handle(vm))
            .transpose()
    }

    async fn find_vm_by_id(&self, vmid: VmId) -> ProxmoxResult<Option<VmHandle>> {
        let vms = self.client.vms(&self.node).await?;
        vms.iter()
            .find(|vm| vm.vmid == vmid.get())
            .map(|vm| self.handle(vm))
            .transpose()
    }

    async fn clone_vm(&self, request: &CloneRequest) -> ProxmoxResult<VmHandle> {
        let reservation = self.id_reservation.lock().await;
        let newid = match request.target {
            Some(id) => id,
            None => VmId::new(self.client.next_vmid().await?)?,
        };
        info!(
            vm = %request.name,
            vmid = newid.get(),
            template = request.template.vmid.get(),
            "cloning template"
        );
        let upid = self
            .client
            .clone_vm(
                &self.node,
                request.template.vmid.get(),
                &CloneVmParams {
                    newid: newid.get(),
                    name: request.name.to_string(),
                    full: 1,
                    storage: request.template.storage.clone(),
                    description: None,
                },
            )
            .await?;
        // Proxmox holds the new id from here on.
        drop(reservation);

        self.wait(&upid).await?;
        Ok(VmHandle {
            vmid: newid,
            name: request.name.to_string(),
            node: self.node.clone(),
        })
    }

    async fn configure_vm(
        &self,
        handle: &VmHandle,
        config: &VmHardwareConfig,
    ) -> ProxmoxResult<()> {
        let cloud_init = &config.cloud_init;
        let params = UpdateVmConfigParams {
            cores: Some(config.cores),
            memory: Some(config.memory_mb),
            net0: Some(config.net0()),
            ciuser: Some(cloud_init.user.clone()),
            sshkeys: (!cloud_init.ssh_keys.is_empty())
                .then(|| encode_ssh_keys(&cloud_init.ssh_keys)),
            ipconfig0: Some(cloud_init.ipconfig()),
            nameserver: cloud_init.nameserver.clone(),
            agent: Some("1".to_string()),
            onboot: Some(u8::from(config.start_on_boot)),
            description: config.description.clone(),
        };
        debug!(vm = %handle, cores = config.cores, memory_mb = config.memory_mb, "updating VM config");
        self.client
            .update_vm_config(&self.node, handle.vmid.get(), &params)
            .await?;
        self.ensure_disk(handle, config).await
    }

    async fn start_vm(&self, handle: &VmHandle) -> ProxmoxResult<()> {
        if self.power_state(handle).await? == PowerState::Running {
            return Ok(());
        }
        let upid = self.client.start_vm(&self.node, handle.vmid.get()).await?;
        self.wait(&upid).await
    }

    async fn resume_vm(&self, handle: &VmHandle) -> ProxmoxResult<()> {
        let upid = self.client.resume_vm(&self.node, handle.vmid.get()).await?;
        self.wait(&upid).await
    }

    async fn stop_vm(&self, handle: &VmHandle, mode: PowerMode) -> ProxmoxResult<()> {
        let vmid = handle.vmid.get();
        let upid = match mode {
            PowerMode::Hard => self.client.stop_vm(&self.node, vmid).await?,
            PowerMode::Graceful => self.client.shutdown_vm(&self.node, vmid).await?,
        };
        self.wait(&upid).await
    }

    async fn restart_vm(&self, handle: &VmHandle, mode: PowerMode) -> ProxmoxResult<()> {
        let vmid = handle.vmid.get();
        let upid = match mode {
            PowerMode::Hard => self.client.reset_vm(&self.node, vmid).await?,
            PowerMode::Graceful => self.client.reboot_vm(&self.node, vmid).await?,
        };
        self.wait(&upid).await
    }

    async fn power_state(&self, handle: &VmHandle) -> ProxmoxResult<PowerState> {
        let status = self.client.vm_status(&self.node, handle.vmid.get()).await?;
        Ok(PowerState::from_status(
            status.qmpstatus.as_deref().unwrap_or(&status.status),
        ))
    }

    async fn guest_agent_status(&self, handle: &VmHandle) -> ProxmoxResult<AgentStatus> {
        match self.client.agent_ping(&self.node, handle.vmid.get()).await {
            Ok(()) => Ok(AgentStatus::Ready),
            // "QEMU guest agent is not running", "VM 201 is not running", ...
            Err(ProxmoxError::Api { status: 500, message }) => {
                debug!(vm = %handle, %message, "guest agent not ready");
                Ok(AgentStatus::NotReady)
            }
            Err(e) => Err(e),
        }
    }

    async fn network_interfaces(&self, handle: &VmHandle) -> ProxmoxResult<Vec<NetworkInterface>> {
        let interfaces = self
            .client
            .agent_network_interfaces(&self.node, handle.vmid.get())
            .await?;
        Ok(interfaces
            .into_iter()
            .map(|iface| NetworkInterface {
                ip_addresses: iface
                    .ip_addresses
                    .iter()
                    .filter_map(|addr| addr.ip_address.parse().ok())
                    .collect(),
                name: iface.name,
            })
            .collect())
    }

    async fn guest_exec(
        &self,
        handle: &VmHandle,
        command: &[String],
        input: Option<String>,
    ) -> ProxmoxResult<GuestExecOutput> {
        let status = self
            .client
            .agent_exec_wait(
                &self.node,
                handle.vmid.get(),
                &AgentExecParams {
                    command: command.to_vec(),
                    input_data: input,
                },
            )
            .await?;
        Ok(GuestExecOutput {
            exit_code: status.exitcode.unwrap_or(-1),
            stdout: status.out_data.unwrap_or_default(),
            stderr: status.err_data.unwrap_or_default(),
        })
    }

    async fn set_user_password(
        &self,
        handle: &VmHandle,
        username: &str,
        password: &str,
    ) -> ProxmoxResult<()> {
        self.client
            .agent_set_user_password(&self.node, handle.vmid.get(), username, password)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_keys_encoding() {
        let keys = vec![
            "ssh-ed25519 AAAAC3Nza ops@laptop".to_string(),
            "ssh-rsa AAAAB3Nza+x/y= ci".to_string(),
        ];
        assert_eq!(
            encode_ssh_keys(&keys),
            "ssh-ed25519%20AAAAC3Nza%20ops%40laptop%0Assh-rsa%20AAAAB3Nza%2Bx%2Fy%3D%20ci"
        );
    }
}
