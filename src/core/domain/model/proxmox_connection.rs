use crate::core::domain::value_object::{ProxmoxEndpoint, ProxmoxPassword, ProxmoxUsername};

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ProxmoxConnection {
    endpoint: ProxmoxEndpoint,
    username: ProxmoxUsername,
    password: ProxmoxPassword,
    accept_invalid_certs: bool,
}

impl ProxmoxConnection {
    pub fn new(
        endpoint: ProxmoxEndpoint,
        username: ProxmoxUsername,
        password: ProxmoxPassword,
        accept_invalid_certs: bool,
    ) -> Self {
        Self {
            endpoint,
            username,
            password,
            accept_invalid_certs,
        }
    }

    pub fn endpoint(&self) -> &ProxmoxEndpoint {
        &self.endpoint
    }

    pub fn username(&self) -> &ProxmoxUsername {
        &self.username
    }

    pub fn password(&self) -> &ProxmoxPassword {
        &self.password
    }

    /// Self-signed certificates are the norm on fresh Proxmox installs.
    pub fn accept_invalid_certs(&self) -> bool {
        self.accept_invalid_certs
    }
}
