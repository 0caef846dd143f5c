//! QEMU, task and guest-agent calls on [`ProxmoxClient`].
//!
//! Power operations, clones and disk moves are asynchronous on the Proxmox
//! side: they return a task id (UPID) which [`ProxmoxClient::wait_for_task`]
//! polls until the task stops.

use crate::{
    ProxmoxClient,
    core::domain::{
        error::{ProxmoxError, ProxmoxResult},
        model::vm::{
            AgentExecParams, AgentExecResponse, AgentExecStatus, AgentInterface, AgentInterfaces,
            ApiResponse, CloneVmParams, MoveDiskParams, ResizeDiskParams, SetUserPasswordParams,
            TaskStatus, UpdateVmConfigParams, VmConfig, VmListItem, VmStatusCurrent,
        },
    },
};
use serde_json::Value;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

impl ProxmoxClient {
    /// Lists the VMs (templates included) on `node`.
    pub async fn vms(&self, node: &str) -> ProxmoxResult<Vec<VmListItem>> {
        let response: ApiResponse<Vec<VmListItem>> =
            self.api_client.get(&format!("nodes/{node}/qemu")).await?;
        Ok(response.data)
    }

    pub async fn vm_status(&self, node: &str, vmid: u32) -> ProxmoxResult<VmStatusCurrent> {
        let response: ApiResponse<VmStatusCurrent> = self
            .api_client
            .get(&format!("nodes/{node}/qemu/{vmid}/status/current"))
            .await?;
        Ok(response.data)
    }

    pub async fn vm_config(&self, node: &str, vmid: u32) -> ProxmoxResult<VmConfig> {
        let response: ApiResponse<VmConfig> = self
            .api_client
            .get(&format!("nodes/{node}/qemu/{vmid}/config"))
            .await?;
        Ok(response.data)
    }

    /// Applies `params` and waits for the update task when Proxmox starts one.
    pub async fn update_vm_config(
        &self,
        node: &str,
        vmid: u32,
        params: &UpdateVmConfigParams,
    ) -> ProxmoxResult<()> {
        let response: ApiResponse<Option<String>> = self
            .api_client
            .post(&format!("nodes/{node}/qemu/{vmid}/config"), params)
            .await?;
        match response.data {
            Some(upid) => self.wait_for_task(node, &upid).await,
            None => Ok(()),
        }
    }

    /// Starts a clone of `template`; returns the task id.
    pub async fn clone_vm(
        &self,
        node: &str,
        template: u32,
        params: &CloneVmParams,
    ) -> ProxmoxResult<String> {
        let response: ApiResponse<String> = self
            .api_client
            .post(&format!("nodes/{node}/qemu/{template}/clone"), params)
            .await?;
        Ok(response.data)
    }

    /// Grows a disk. Newer Proxmox versions run this as a task.
    pub async fn resize_disk(
        &self,
        node: &str,
        vmid: u32,
        params: &ResizeDiskParams,
    ) -> ProxmoxResult<()> {
        let response: ApiResponse<Option<String>> = self
            .api_client
            .put(&format!("nodes/{node}/qemu/{vmid}/resize"), params)
            .await?;
        match response.data {
            Some(upid) => self.wait_for_task(node, &upid).await,
            None => Ok(()),
        }
    }

    /// Starts moving a disk to another storage; returns the task id.
    pub async fn move_disk(
        &self,
        node: &str,
        vmid: u32,
        params: &MoveDiskParams,
    ) -> ProxmoxResult<String> {
        let response: ApiResponse<String> = self
            .api_client
            .post(&format!("nodes/{node}/qemu/{vmid}/move_disk"), params)
            .await?;
        Ok(response.data)
    }

    pub async fn start_vm(&self, node: &str, vmid: u32) -> ProxmoxResult<String> {
        self.power_action(node, vmid, "start").await
    }

    /// Continues a paused or hibernated guest.
    pub async fn resume_vm(&self, node: &str, vmid: u32) -> ProxmoxResult<String> {
        self.power_action(node, vmid, "resume").await
    }

    /// Hard stop, the equivalent of pulling the plug.
    pub async fn stop_vm(&self, node: &str, vmid: u32) -> ProxmoxResult<String> {
        self.power_action(node, vmid, "stop").await
    }

    /// ACPI/guest-agent shutdown.
    pub async fn shutdown_vm(&self, node: &str, vmid: u32) -> ProxmoxResult<String> {
        self.power_action(node, vmid, "shutdown").await
    }

    /// Hard reset.
    pub async fn reset_vm(&self, node: &str, vmid: u32) -> ProxmoxResult<String> {
        self.power_action(node, vmid, "reset").await
    }

    /// Guest reboot.
    pub async fn reboot_vm(&self, node: &str, vmid: u32) -> ProxmoxResult<String> {
        self.power_action(node, vmid, "reboot").await
    }

    async fn power_action(&self, node: &str, vmid: u32, action: &str) -> ProxmoxResult<String> {
        let response: ApiResponse<String> = self
            .api_client
            .post(
                &format!("nodes/{node}/qemu/{vmid}/status/{action}"),
                &serde_json::json!({}),
            )
            .await?;
        Ok(response.data)
    }

    /// Asks the cluster for the lowest unused guest id.
    pub async fn next_vmid(&self) -> ProxmoxResult<u32> {
        let response: ApiResponse<Value> = self.api_client.get("cluster/nextid").await?;
        let id = match &response.data {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        };
        id.ok_or_else(|| ProxmoxError::Api {
            status: 200,
            message: format!("unexpected nextid payload: {}", response.data),
        })
    }

    pub async fn task_status(&self, node: &str, upid: &str) -> ProxmoxResult<TaskStatus> {
        let response: ApiResponse<TaskStatus> = self
            .api_client
            .get(&format!("nodes/{node}/tasks/{upid}/status"))
            .await?;
        Ok(response.data)
    }

    /// Polls a task until it stops.
    ///
    /// The task runs whether or not its status can be read, so transient
    /// polling errors only delay the next poll.
    ///
    /// # Errors
    /// `ProxmoxError::TaskFailed` when the task ends with anything but `OK`, or
    /// its end is not observed within the configured task timeout. Neither
    /// timeout case is transient: the task may still complete.
    pub async fn wait_for_task(&self, node: &str, upid: &str) -> ProxmoxResult<()> {
        let config = self.config();
        let deadline = Instant::now() + config.task_timeout;
        loop {
            let status = match self.task_status(node, upid).await {
                Ok(status) => status,
                Err(e) if e.is_transient() => {
                    if Instant::now() >= deadline {
                        warn!(upid, error = %e, "giving up on task status");
                        // No cause in the status, or it would classify as transient.
                        return Err(ProxmoxError::TaskFailed {
                            upid: upid.to_string(),
                            exit_status: format!("status unknown after {:?}", config.task_timeout),
                        });
                    }
                    debug!(upid, error = %e, "task status unavailable, polling again");
                    sleep(config.task_poll_interval).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match status.outcome() {
                Some(Ok(())) => {
                    debug!(upid, "task finished");
                    return Ok(());
                }
                Some(Err(exit_status)) => {
                    return Err(ProxmoxError::TaskFailed {
                        upid: upid.to_string(),
                        exit_status,
                    });
                }
                None if Instant::now() >= deadline => {
                    return Err(ProxmoxError::TaskFailed {
                        upid: upid.to_string(),
                        exit_status: format!("still running after {:?}", config.task_timeout),
                    });
                }
                None => sleep(config.task_poll_interval).await,
            }
        }
    }

    /// Succeeds when the guest agent answers.
    pub async fn agent_ping(&self, node: &str, vmid: u32) -> ProxmoxResult<()> {
        let _: ApiResponse<Value> = self
            .api_client
            .post(
                &format!("nodes/{node}/qemu/{vmid}/agent/ping"),
                &serde_json::json!({}),
            )
            .await?;
        Ok(())
    }

    pub async fn agent_network_interfaces(
        &self,
        node: &str,
        vmid: u32,
    ) -> ProxmoxResult<Vec<AgentInterface>> {
        let response: ApiResponse<AgentInterfaces> = self
            .api_client
            .get(&format!("nodes/{node}/qemu/{vmid}/agent/network-get-interfaces"))
            .await?;
        Ok(response.data.result)
    }

    /// Starts a command in the guest; returns its pid.
    pub async fn agent_exec(
        &self,
        node: &str,
        vmid: u32,
        params: &AgentExecParams,
    ) -> ProxmoxResult<u64> {
        let response: ApiResponse<AgentExecResponse> = self
            .api_client
            .post(&format!("nodes/{node}/qemu/{vmid}/agent/exec"), params)
            .await?;
        Ok(response.data.pid)
    }

    pub async fn agent_exec_status(
        &self,
        node: &str,
        vmid: u32,
        pid: u64,
    ) -> ProxmoxResult<AgentExecStatus> {
        let response: ApiResponse<AgentExecStatus> = self
            .api_client
            .get(&format!("nodes/{node}/qemu/{vmid}/agent/exec-status?pid={pid}"))
            .await?;
        Ok(response.data)
    }

    /// Runs a command in the guest and waits for it to exit.
    pub async fn agent_exec_wait(
        &self,
        node: &str,
        vmid: u32,
        params: &AgentExecParams,
    ) -> ProxmoxResult<AgentExecStatus> {
        let pid = self.agent_exec(node, vmid, params).await?;
        let config = self.config();
        let deadline = Instant::now() + config.exec_timeout;
        loop {
            let status = self.agent_exec_status(node, vmid, pid).await?;
            if status.exited {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(ProxmoxError::Api {
                    status: 504,
                    message: format!(
                        "guest command {:?} still running after {:?}",
                        params.command.first(),
                        config.exec_timeout
                    ),
                });
            }
            sleep(config.exec_poll_interval).await;
        }
    }

    pub async fn agent_set_user_password(
        &self,
        node: &str,
        vmid: u32,
        username: &str,
        password: &str,
    ) -> ProxmoxResult<()> {
        let _: ApiResponse<Value> = self
            .api_client
            .post(
                &format!("nodes/{node}/qemu/{vmid}/agent/set-user-password"),
                &SetUserPasswordParams { username, password },
            )
            .await?;
        Ok(())
    }
}
