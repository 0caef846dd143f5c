use crate::core::domain::error::ValidationError;
use url::Url;

const API_ROOT: &str = "api2/json";
const MAX_URL_LENGTH: usize = 2083;

/// The base URL of a Proxmox VE API, normalised to `scheme://host:port/`.
///
/// Accepts the forms operators usually paste:
/// `https://pve:8006`, `https://pve:8006/` and `https://pve:8006/api2/json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxmoxEndpoint {
    base: Url,
}

impl ProxmoxEndpoint {
    /// Parses and validates an endpoint.
    pub fn new(endpoint: &str) -> Result<Self, ValidationError> {
        validate_endpoint(endpoint)?;
        let mut base = Url::parse(endpoint.trim())
            .map_err(|e| ValidationError::Format(format!("Invalid URL format: {e}")))?;
        base.set_path("/");
        base.set_query(None);
        base.set_fragment(None);
        Ok(Self { base })
    }

    /// Returns the normalised base URL, always ending in `/`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.base.as_str()
    }

    /// Returns the host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        self.base.host_str().unwrap_or_default()
    }

    /// Returns `true` for `https` endpoints.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.base.scheme() == "https"
    }

    /// Builds the full URL of an API path such as `nodes/pve/qemu`.
    #[must_use]
    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}{}/{}",
            self.base.as_str(),
            API_ROOT,
            path.trim_start_matches('/')
        )
    }
}

/// Validates a Proxmox API endpoint string.
pub(crate) fn validate_endpoint(endpoint: &str) -> Result<(), ValidationError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(ValidationError::field("endpoint", "Endpoint cannot be empty"));
    }
    if endpoint.len() > MAX_URL_LENGTH {
        return Err(ValidationError::Format(format!(
            "URL exceeds maximum length of {MAX_URL_LENGTH} characters"
        )));
    }
    let url = Url::parse(endpoint)
        .map_err(|e| ValidationError::Format(format!("Invalid URL format: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::ConstraintViolation(format!(
            "Invalid scheme '{}'. Must be one of: https, http",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ValidationError::field("endpoint", "Endpoint must include a host"));
    }
    let path = url.path().trim_end_matches('/');
    if !path.is_empty() && path != "/api2/json" {
        return Err(ValidationError::ConstraintViolation(format!(
            "Invalid API path '{path}'. Must be empty or /api2/json"
        )));
    }
    Ok(())
}
