use crate::core::domain::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_LABEL_LENGTH: usize = 63;

/// A guest name that is also a valid single DNS label.
///
/// The same string names the Proxmox VM, the guest hostname and the
/// inventory host entry, so it has to satisfy RFC 1123 label rules.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    /// Creates a validated name.
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_node_name(&name)?;
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validates a node name as an RFC 1123 label.
pub(crate) fn validate_node_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > MAX_LABEL_LENGTH {
        return Err(ValidationError::Format(format!(
            "Node name '{name}' must be between 1 and {MAX_LABEL_LENGTH} characters"
        )));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ValidationError::Format(format!(
            "Node name '{name}' can only contain alphanumeric characters and hyphens"
        )));
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(ValidationError::Format(format!(
            "Node name '{name}' cannot start or end with a hyphen"
        )));
    }

    Ok(())
}
