use crate::{
    auth::application::{
        request::login_request::LoginRequest, response::login_response::LoginResponse,
    },
    core::domain::{
        error::{ProxmoxError, ProxmoxResult, ValidationError},
        model::{proxmox_auth::ProxmoxAuth, proxmox_connection::ProxmoxConnection},
        value_object::{ProxmoxCSRFToken, ProxmoxTicket},
    },
};

use reqwest::{
    Client, StatusCode,
    header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use tracing::debug;

/// Exchanges the stored credentials for a ticket and CSRF token.
pub struct LoginService {
    headers: HeaderMap,
}

impl LoginService {
    pub fn new() -> Self {
        let json = HeaderValue::from_static("application/json");
        let headers = HeaderMap::from_iter([(CONTENT_TYPE, json.clone()), (ACCEPT, json)]);
        Self { headers }
    }

    pub async fn execute(
        &self,
        http: &Client,
        connection: &ProxmoxConnection,
    ) -> ProxmoxResult<ProxmoxAuth> {
        let body = LoginRequest {
            username: connection.username().as_str(),
            password: connection.password().as_str(),
        };
        let response = http
            .post(connection.endpoint().api_url("access/ticket"))
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProxmoxError::Connection(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(rejection(status));
        }

        let LoginResponse { data } = response.json().await.map_err(|e| {
            ProxmoxError::Connection(format!("Failed to parse login response: {e}"))
        })?;
        debug!(user = ?data.username, "obtained Proxmox ticket");
        Ok(ProxmoxAuth::new(
            ProxmoxTicket::new(data.ticket)?,
            Some(ProxmoxCSRFToken::new(data.csrf_token)?),
        ))
    }
}

fn rejection(status: StatusCode) -> ProxmoxError {
    match status {
        StatusCode::UNAUTHORIZED => {
            ProxmoxError::Authentication("Invalid credentials provided".to_string())
        }
        StatusCode::BAD_REQUEST => {
            ValidationError::field("request", "Proxmox rejected the login request").into()
        }
        StatusCode::NOT_FOUND => {
            ProxmoxError::Connection("No login endpoint at this address".to_string())
        }
        StatusCode::SERVICE_UNAVAILABLE => {
            ProxmoxError::Connection("Proxmox API is unavailable".to_string())
        }
        status => ProxmoxError::Api {
            status: status.as_u16(),
            message: format!("Unexpected login response status: {status}"),
        },
    }
}

impl Default for LoginService {
    fn default() -> Self {
        Self::new()
    }
}
