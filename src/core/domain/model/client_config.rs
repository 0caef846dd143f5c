//! Tunables of the Proxmox REST client.

use std::time::Duration;

/// Proxmox tickets are valid for two hours; refresh a little earlier.
pub const DEFAULT_TICKET_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60 - 5 * 60);

/// Token-bucket limit applied to every API request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Age after which a ticket is considered expired and a new login happens.
    pub ticket_lifetime: Duration,
    /// `None` disables rate limiting.
    pub rate_limit: Option<RateLimitConfig>,
    /// Delay between two task status polls.
    pub task_poll_interval: Duration,
    /// Upper bound for waiting on a single asynchronous task.
    pub task_timeout: Duration,
    /// Delay between two guest exec status polls.
    pub exec_poll_interval: Duration,
    /// Upper bound for a single guest command.
    pub exec_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ticket_lifetime: DEFAULT_TICKET_LIFETIME,
            rate_limit: None,
            task_poll_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(15 * 60),
            exec_poll_interval: Duration::from_millis(500),
            exec_timeout: Duration::from_secs(60),
        }
    }
}
