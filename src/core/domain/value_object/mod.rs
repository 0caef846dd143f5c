mod guest_username;
mod k3s_token;
mod node_name;
mod proxmox_csrf_token;
mod proxmox_endpoint;
mod proxmox_password;
mod proxmox_ticket;
mod proxmox_username;
pub(crate) mod serde_helpers;
mod vm_id;

pub use guest_username::GuestUsername;
pub use k3s_token::{GENERATED_TOKEN_LENGTH, K3sToken};
pub use node_name::NodeName;
pub use proxmox_csrf_token::ProxmoxCSRFToken;
pub use proxmox_endpoint::ProxmoxEndpoint;
pub use proxmox_password::ProxmoxPassword;
pub use proxmox_ticket::ProxmoxTicket;
pub use proxmox_username::ProxmoxUsername;
pub use vm_id::{MAX_VM_ID, MIN_VM_ID, VmId};

// Guest admin passwords are checked by the lifecycle driver.
pub(crate) use proxmox_password::validate_password;
