use crate::core::domain::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest id Proxmox accepts for a guest.
pub const MIN_VM_ID: u32 = 100;
/// Highest id Proxmox accepts for a guest.
pub const MAX_VM_ID: u32 = 999_999_999;

/// A validated Proxmox guest identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(u32);

impl VmId {
    /// Creates a new id, rejecting values outside the range Proxmox accepts.
    pub fn new(id: u32) -> Result<Self, ValidationError> {
        validate_vm_id(id)?;
        Ok(Self(id))
    }

    /// Creates a new id without validation.
    #[cfg(test)]
    pub(crate) fn new_unchecked(id: u32) -> Self {
        Self(id)
    }

    /// Returns the numeric id.
    #[must_use]
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validates a guest id.
pub(crate) fn validate_vm_id(id: u32) -> Result<(), ValidationError> {
    if !(MIN_VM_ID..=MAX_VM_ID).contains(&id) {
        return Err(ValidationError::field(
            "vmid",
            format!("VM id {id} is outside {MIN_VM_ID}..={MAX_VM_ID}"),
        ));
    }
    Ok(())
}
