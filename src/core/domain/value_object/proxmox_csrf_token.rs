use crate::core::domain::error::ValidationError;

/// A Proxmox CSRF protection token, required on every write request.
#[derive(Debug, Clone)]
pub struct ProxmoxCSRFToken(String);

impl ProxmoxCSRFToken {
    /// Checks the `TOKENID:VALUE` shape Proxmox issues.
    pub fn new(value: String) -> Result<Self, ValidationError> {
        validate_csrf_token(&value)?;
        Ok(Self(value))
    }

    #[cfg(test)]
    pub(crate) fn new_unchecked(value: String) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub(crate) fn validate_csrf_token(token: &str) -> Result<(), ValidationError> {
    if token.is_empty() {
        return Err(ValidationError::field("csrf_token", "CSRF token cannot be empty"));
    }
    let Some((token_id, value)) = token.split_once(':') else {
        return Err(ValidationError::Format(
            "CSRF token must be in format TOKENID:VALUE".to_string(),
        ));
    };
    if token_id.len() != 8 || !token_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::Format(
            "Token ID must be 8 hexadecimal characters".to_string(),
        ));
    }
    if value.is_empty() || value.contains(':') {
        return Err(ValidationError::Format(
            "CSRF token must be in format TOKENID:VALUE".to_string(),
        ));
    }
    Ok(())
}
