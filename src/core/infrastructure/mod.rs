pub mod api_client;
pub mod config_store;
pub mod playbook;
pub mod proxmox_hypervisor;
pub mod retry;
pub mod vm_operations;
