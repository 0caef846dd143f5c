use crate::core::domain::error::ValidationError;

const RESERVED: [&str; 6] = ["root", "daemon", "bin", "sys", "nobody", "sshd"];

/// A login name for an account created inside the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestUsername(String);

impl GuestUsername {
    /// Creates a validated login name.
    pub fn new(username: impl Into<String>) -> Result<Self, ValidationError> {
        let username = username.into();
        validate_guest_username(&username)?;
        Ok(Self(username))
    }

    /// Returns the username as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validates a POSIX-portable login name and refuses system accounts.
pub(crate) fn validate_guest_username(username: &str) -> Result<(), ValidationError> {
    if username.is_empty() {
        return Err(ValidationError::field(
            "admin_username",
            "Username cannot be empty",
        ));
    }
    if username.len() > 32 {
        return Err(ValidationError::Format(format!(
            "Username cannot exceed 32 characters (got {})",
            username.len()
        )));
    }
    let mut chars = username.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !first_ok || !rest_ok {
        return Err(ValidationError::Format(format!(
            "Username '{username}' must match [a-z_][a-z0-9_-]*"
        )));
    }
    if RESERVED.contains(&username) {
        return Err(ValidationError::ConstraintViolation(format!(
            "Username '{username}' is reserved for system use"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_guest_username_valid() {
        assert!(validate_guest_username("admin").is_ok());
        assert!(validate_guest_username("k3s_ops").is_ok());
        assert!(validate_guest_username("_svc-1").is_ok());
    }

    #[test]
    fn test_validate_guest_username_invalid() {
        assert!(validate_guest_username("").is_err());
        assert!(validate_guest_username("Admin").is_err());
        assert!(validate_guest_username("1admin").is_err());
        assert!(validate_guest_username("ad min").is_err());
        assert!(validate_guest_username(&"a".repeat(33)).is_err());
    }

    #[test]
    fn test_validate_guest_username_reserved() {
        for name in RESERVED {
            assert!(matches!(
                validate_guest_username(name),
                Err(ValidationError::ConstraintViolation(_))
            ));
        }
    }
}
