pub mod client_config;
pub mod cluster_plan;
pub mod inventory;
pub mod node_facts;
pub mod node_spec;
pub mod node_state;
pub mod proxmox_auth;
pub mod proxmox_connection;
pub mod vm;
