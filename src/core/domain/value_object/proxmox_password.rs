use crate::core::domain::error::ValidationError;
use std::fmt;
use zxcvbn::zxcvbn;

/// A plaintext password, kept in memory only for as long as it is needed.
///
/// Used both for the Proxmox API account and for the admin account created
/// inside each guest. The value never appears in `Debug` output.
#[derive(Clone)]
pub struct ProxmoxPassword(String);

impl ProxmoxPassword {
    /// Wraps an API password; the server is the authority on its validity.
    pub fn new(password: impl Into<String>) -> Result<Self, ValidationError> {
        let password = password.into();
        if password.is_empty() {
            return Err(ValidationError::field("password", "Password cannot be empty"));
        }
        Ok(Self(password))
    }

    #[cfg(test)]
    pub(crate) fn new_unchecked(password: String) -> Self {
        Self(password)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ProxmoxPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProxmoxPassword(***)")
    }
}

/// Validates a password for an account we create.
///
/// `user_inputs` are penalised by the strength estimator (typically the
/// username and node names).
pub(crate) fn validate_password(
    password: &str,
    min_score: Option<zxcvbn::Score>,
    user_inputs: &[&str],
) -> Result<(), ValidationError> {
    if password.is_empty() {
        return Err(ValidationError::field(
            "admin_password",
            "Password cannot be empty",
        ));
    }
    if password.len() < 8 {
        return Err(ValidationError::Format(
            "Password must be at least 8 characters long".to_string(),
        ));
    }
    if password.len() > 128 {
        return Err(ValidationError::Format(
            "Password cannot exceed 128 characters".to_string(),
        ));
    }
    if let Some(min_score) = min_score {
        let entropy = zxcvbn(password, user_inputs);
        if entropy.score() < min_score {
            return Err(ValidationError::ConstraintViolation(
                "Password is too weak (increase complexity)".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_password_length() {
        assert!(validate_password("", None, &[]).is_err());
        assert!(validate_password("short", None, &[]).is_err());
        assert!(validate_password(&"x".repeat(129), None, &[]).is_err());
        assert!(validate_password("longenough", None, &[]).is_ok());
    }

    #[test]
    fn test_validate_password_strength() {
        let min = Some(zxcvbn::Score::Three);
        assert!(validate_password("password1", min, &[]).is_err());
        assert!(validate_password("Cl0ud-Tr4in-Velvet-Harbor", min, &[]).is_ok());
    }

    #[test]
    fn test_debug_is_redacted() {
        let password = ProxmoxPassword::new("hunter2-hunter2").unwrap();
        assert_eq!(format!("{password:?}"), "ProxmoxPassword(***)");
        assert!(ProxmoxPassword::new("").is_err());
    }
}
