use serde::Deserialize;

/// Envelope returned by `POST /access/ticket`.
#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub data: LoginTicket,
}

#[derive(Debug, Deserialize)]
pub struct LoginTicket {
    pub ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_token: String,
    /// The user id the ticket was issued for, as Proxmox normalised it.
    #[serde(default)]
    pub username: Option<String>,
}
