use crate::core::domain::error::ValidationError;
use std::time::{Duration, Instant};

/// A Proxmox authentication ticket (`PVEAuthCookie`).
#[derive(Debug, Clone)]
pub struct ProxmoxTicket {
    value: String,
    issued_at: Instant,
}

impl ProxmoxTicket {
    /// Creates a validated ticket, stamped with the current time.
    pub fn new(value: String) -> Result<Self, ValidationError> {
        validate_ticket(&value)?;
        Ok(Self::new_unchecked(value))
    }

    /// Stamps an already trusted value.
    pub(crate) fn new_unchecked(value: String) -> Self {
        Self {
            value,
            issued_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Proxmox tickets are valid for two hours; callers pass a margin below that.
    #[must_use]
    pub fn is_expired(&self, lifetime: Duration) -> bool {
        self.issued_at.elapsed() > lifetime
    }

    /// Formats the ticket as a cookie header value.
    #[must_use]
    pub fn as_cookie_header(&self) -> String {
        format!("PVEAuthCookie={}", self.value)
    }
}

pub(crate) fn validate_ticket(ticket: &str) -> Result<(), ValidationError> {
    if ticket.is_empty() {
        return Err(ValidationError::field("ticket", "Ticket cannot be empty"));
    }
    let parts: Vec<&str> = ticket.split(':').collect();
    if parts.len() < 5 || parts[0] != "PVE" {
        return Err(ValidationError::Format(
            "Invalid ticket format: must start with 'PVE:' and have at least 5 parts".to_string(),
        ));
    }
    Ok(())
}
