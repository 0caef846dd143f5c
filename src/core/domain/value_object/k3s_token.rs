use crate::core::domain::error::ValidationError;
use rand::{Rng, distributions::Alphanumeric, rngs::OsRng};
use std::fmt;

/// Length of generated cluster join tokens.
pub const GENERATED_TOKEN_LENGTH: usize = 32;

/// The shared secret k3s servers and agents use to join the cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct K3sToken(String);

impl K3sToken {
    /// Wraps a user supplied token after validating it.
    pub fn new(token: impl Into<String>) -> Result<Self, ValidationError> {
        let token = token.into();
        validate_k3s_token(&token)?;
        Ok(Self(token))
    }

    /// Generates a fresh alphanumeric token from the operating system CSPRNG.
    pub fn generate() -> Self {
        let token = OsRng
            .sample_iter(&Alphanumeric)
            .take(GENERATED_TOKEN_LENGTH)
            .map(char::from)
            .collect();
        Self(token)
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for K3sToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("K3sToken(***)")
    }
}

/// Validates a join token.
pub(crate) fn validate_k3s_token(token: &str) -> Result<(), ValidationError> {
    if token.trim().is_empty() {
        return Err(ValidationError::field("k3s_token", "Token cannot be empty"));
    }
    if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::Format(
            "k3s_token cannot contain whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}
