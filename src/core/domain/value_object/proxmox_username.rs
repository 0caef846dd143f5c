use crate::core::domain::error::ValidationError;

/// A validated Proxmox user id in `user@realm` form.
#[derive(Debug, Clone)]
pub struct ProxmoxUsername(String);

impl ProxmoxUsername {
    /// Creates a validated user id.
    pub fn new(username: impl Into<String>) -> Result<Self, ValidationError> {
        let username = username.into();
        validate_username(&username)?;
        Ok(Self(username))
    }

    #[cfg(test)]
    pub(crate) fn new_unchecked(username: String) -> Self {
        Self(username)
    }

    /// Returns the full `user@realm` id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the realm part (`pam`, `pve`, ...).
    #[must_use]
    pub fn realm(&self) -> &str {
        self.0.rsplit_once('@').map(|(_, realm)| realm).unwrap_or("")
    }
}

pub(crate) fn validate_username(username: &str) -> Result<(), ValidationError> {
    if username.is_empty() {
        return Err(ValidationError::field("username", "Username cannot be empty"));
    }
    if username.len() > 64 {
        return Err(ValidationError::Format(format!(
            "Username cannot exceed 64 characters (got {})",
            username.len()
        )));
    }
    let Some((user, realm)) = username.rsplit_once('@') else {
        return Err(ValidationError::Format(
            "Username must include a realm, e.g. root@pam".to_string(),
        ));
    };
    let allowed = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if user.is_empty() || !user.chars().all(allowed) {
        return Err(ValidationError::Format(
            "Username contains invalid characters. Allowed: alphanumeric, -, _, .".to_string(),
        ));
    }
    if realm.is_empty() || !realm.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::Format(format!("Invalid realm '{realm}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_username_valid() {
        assert!(validate_username("root@pam").is_ok());
        assert!(validate_username("terraform.bot@pve").is_ok());
        assert!(validate_username("ops_user@ldap-corp").is_ok());
    }

    #[test]
    fn test_validate_username_invalid() {
        assert!(validate_username("").is_err());
        assert!(validate_username("root").is_err()); // no realm
        assert!(validate_username("@pam").is_err());
        assert!(validate_username("root@").is_err());
        assert!(validate_username("ro ot@pam").is_err());
        assert!(validate_username(&format!("{}@pam", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_realm_accessor() {
        let username = ProxmoxUsername::new("root@pam").unwrap();
        assert_eq!(username.realm(), "pam");
        assert_eq!(ProxmoxUsername::new_unchecked("x@pve".to_string()).as_str(), "x@pve");
    }
}
