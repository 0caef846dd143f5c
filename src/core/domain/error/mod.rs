use crate::core::domain::model::{node_spec::NodeRole, node_state::NodePhase};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to the Proxmox VE API.
///
/// This enum covers transport failures, authentication problems, non-success
/// API responses and failed asynchronous tasks. Whether an error is worth
/// retrying is decided by [`ProxmoxError::is_transient`].
#[derive(Error, Debug)]
pub enum ProxmoxError {
    /// Represents errors that occur while reaching the server
    ///
    /// # Fields
    /// * `0` - A description of what went wrong during the request
    #[error("Connection error: {0}")]
    Connection(String),

    /// Represents authentication failures
    ///
    /// # Fields
    /// * `0` - A description of the authentication failure
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A non-success HTTP status returned by the API
    ///
    /// # Fields
    /// * `status` - The HTTP status code
    /// * `message` - The response body or reason phrase
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// An asynchronous Proxmox task finished with a non-`OK` exit status
    ///
    /// # Fields
    /// * `upid` - The task identifier
    /// * `exit_status` - The exit status reported by the task log
    #[error("Task {upid} failed: {exit_status}")]
    TaskFailed { upid: String, exit_status: String },

    /// Represents validation failures with detailed context
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

const TRANSIENT_MARKERS: [&str; 4] = [
    "can't lock file",
    "timeout",
    "temporarily unavailable",
    "try again",
];

impl ProxmoxError {
    /// Returns `true` when the same call may succeed if repeated later.
    ///
    /// Lock contention on the VM config file is the common case: Proxmox
    /// answers `500 can't lock file ... got timeout` while another task holds it.
    pub fn is_transient(&self) -> bool {
        match self {
            ProxmoxError::Connection(_) => true,
            ProxmoxError::Authentication(_) | ProxmoxError::Validation(_) => false,
            ProxmoxError::Api { status, message } => match status {
                429 | 502 | 503 | 504 | 595 => true,
                400 | 401 | 403 | 404 => false,
                _ => has_transient_marker(message),
            },
            ProxmoxError::TaskFailed { exit_status, .. } => has_transient_marker(exit_status),
        }
    }

    /// Returns `true` when the API reports that the addressed object is missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            ProxmoxError::Api { status, message } => {
                *status == 404 || message.to_lowercase().contains("does not exist")
            }
            _ => false,
        }
    }
}

fn has_transient_marker(message: &str) -> bool {
    let message = message.to_lowercase();
    TRANSIENT_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Specialized error type for validation failures.
///
/// This enum provides detailed context about why a validation
/// failed, including field-specific errors and format violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Represents a validation failure for a specific field
    ///
    /// # Fields
    /// * `field` - The name of the field that failed validation
    /// * `message` - A detailed message about why validation failed
    #[error("Field '{field}' validation failed: {message}")]
    Field { field: String, message: String },

    /// Represents format/syntax validation failures
    ///
    /// # Fields
    /// * `0` - Description of the format violation
    #[error("Format error: {0}")]
    Format(String),

    /// Represents violations of domain constraints
    ///
    /// # Fields
    /// * `0` - Description of the constraint violation
    #[error("Domain constraint violation: {0}")]
    ConstraintViolation(String),
}

impl ValidationError {
    pub(crate) fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError::Field {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced by provisioning and inventory generation.
///
/// Every node-level failure carries one of these; the orchestrator folds them
/// into [`NodeFailure`] records for reporting.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Invalid or missing input, detected before the hypervisor is touched
    #[error("Configuration error: {0}")]
    Config(#[from] ValidationError),

    /// A hypervisor call kept failing with retryable errors until the retry
    /// budget ran out
    #[error("Transient hypervisor error during {operation}: {source}")]
    HypervisorTransient {
        operation: &'static str,
        #[source]
        source: ProxmoxError,
    },

    /// A hypervisor call failed in a way retrying cannot fix
    #[error("Hypervisor error during {operation}: {source}")]
    HypervisorFatal {
        operation: &'static str,
        #[source]
        source: ProxmoxError,
    },

    /// The guest agent (or the network it reports) did not come up in time
    #[error("Guest agent on '{vm}' not ready after {waited:?} while {stage}")]
    AgentTimeout {
        vm: String,
        stage: &'static str,
        waited: Duration,
    },

    /// Some, but not all, planned nodes reached `Ready`
    #[error("{} of {planned} nodes failed to provision", .failures.len())]
    PartialFleetFailure {
        planned: usize,
        failures: Vec<NodeFailure>,
    },

    /// Not a single master reached `Ready`; nothing downstream can proceed
    #[error("No master node survived provisioning ({} node failures)", .failures.len())]
    NoSurvivingMasters { failures: Vec<NodeFailure> },

    /// Fewer masters than configured are available for an HA inventory
    #[error("Only {surviving} of {expected} masters are available")]
    QuorumShortfall { expected: usize, surviving: usize },

    /// The run was cancelled before the node finished
    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external playbook or its repository could not be run
    #[error("Playbook error: {0}")]
    Playbook(String),
}

impl FleetError {
    /// Classifies a hypervisor error raised while performing `operation`.
    pub fn from_hypervisor(operation: &'static str, error: ProxmoxError) -> Self {
        match error {
            ProxmoxError::Validation(source) => FleetError::Config(source),
            error if error.is_transient() => FleetError::HypervisorTransient {
                operation,
                source: error,
            },
            error => FleetError::HypervisorFatal {
                operation,
                source: error,
            },
        }
    }

    /// Stable name of the error kind, used in per-node reports.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::Config(_) => "ConfigError",
            FleetError::HypervisorTransient { .. } => "HypervisorTransientError",
            FleetError::HypervisorFatal { .. } => "HypervisorFatalError",
            FleetError::AgentTimeout { .. } => "AgentTimeoutError",
            FleetError::PartialFleetFailure { .. } => "PartialFleetFailure",
            FleetError::NoSurvivingMasters { .. } => "NoSurvivingMasters",
            FleetError::QuorumShortfall { .. } => "QuorumShortfall",
            FleetError::Cancelled => "Cancelled",
            FleetError::Io { .. } => "IoError",
            FleetError::Playbook(_) => "PlaybookError",
        }
    }
}

/// A node that ended the run in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub name: String,
    pub role: NodeRole,
    /// The last phase the node was in before it failed.
    pub phase: NodePhase,
    pub kind: &'static str,
    pub message: String,
}

/// Type alias for Results that may fail with a ProxmoxError
pub type ProxmoxResult<T> = Result<T, ProxmoxError>;

/// Type alias for Results that may fail with a FleetError
pub type FleetResult<T> = Result<T, FleetError>;
