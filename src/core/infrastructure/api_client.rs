//! Ticket-authenticated transport for the Proxmox REST API.

use crate::{
    auth::application::service::login_service::LoginService,
    core::domain::{
        error::{ProxmoxError, ProxmoxResult, ValidationError},
        model::{
            client_config::{ClientConfig, RateLimitConfig},
            proxmox_auth::ProxmoxAuth,
            proxmox_connection::ProxmoxConnection,
        },
    },
};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Sends JSON requests under the current session.
///
/// Every call carries the `PVEAuthCookie` and `CSRFPreventionToken` headers.
/// An expired or missing ticket triggers a login before the call; a `401`
/// triggers exactly one re-login and resend.
#[derive(Debug)]
pub struct ApiClient {
    http: Client,
    connection: Arc<ProxmoxConnection>,
    session: Arc<RwLock<Option<ProxmoxAuth>>>,
    config: Arc<ClientConfig>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl ApiClient {
    /// Builds an unauthenticated client.
    ///
    /// # Errors
    /// `Connection` when reqwest rejects the TLS setup, `Validation` when the
    /// rate limit has a zero component.
    pub fn new(connection: ProxmoxConnection, config: ClientConfig) -> ProxmoxResult<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(connection.accept_invalid_certs())
            .build()
            .map_err(|e| ProxmoxError::Connection(e.to_string()))?;
        let limiter = config.rate_limit.map(build_limiter).transpose()?;

        Ok(Self {
            http,
            connection: Arc::new(connection),
            session: Arc::new(RwLock::new(None)),
            config: Arc::new(config),
            limiter,
        })
    }

    pub fn connection(&self) -> &ProxmoxConnection {
        &self.connection
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn set_auth(&self, auth: ProxmoxAuth) {
        *self.session.write().await = Some(auth);
    }

    pub async fn auth(&self) -> Option<ProxmoxAuth> {
        self.session.read().await.clone()
    }

    /// `true` while a ticket is held and younger than the configured lifetime.
    pub async fn is_authenticated(&self) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .is_some_and(|auth| !auth.ticket().is_expired(self.config.ticket_lifetime))
    }

    /// Logs in again with the stored credentials and replaces the session.
    pub async fn refresh_auth(&self) -> ProxmoxResult<()> {
        let auth = LoginService::new()
            .execute(&self.http, &self.connection)
            .await?;
        self.set_auth(auth).await;
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ProxmoxResult<T> {
        self.call(Method::GET, path, None::<&()>).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ProxmoxResult<T> {
        self.call(Method::POST, path, Some(body)).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ProxmoxResult<T> {
        self.call(Method::PUT, path, Some(body)).await
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> ProxmoxResult<T> {
        if !self.is_authenticated().await {
            self.refresh_auth().await?;
        }

        let mut response = self.dispatch(method.clone(), path, body).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!(path, "ticket rejected, logging in again");
            self.refresh_auth().await?;
            response = self.dispatch(method, path, body).await?;
        }

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ProxmoxError::Connection(format!("Failed to parse response: {e}")));
        }

        let text = response.text().await.unwrap_or_default();
        let message = error_message(status, &text);
        warn!(path, status = status.as_u16(), %message, "Proxmox API error");
        Err(ProxmoxError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn dispatch<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> ProxmoxResult<Response> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let url = self.connection.endpoint().api_url(path);
        debug!(%method, %url, "Proxmox API request");
        let mut request = self.with_session(self.http.request(method, &url)).await;
        if let Some(body) = body {
            request = request.json(body);
        }

        request
            .send()
            .await
            .map_err(|e| ProxmoxError::Connection(format!("HTTP request failed: {e}")))
    }

    async fn with_session(&self, request: RequestBuilder) -> RequestBuilder {
        let session = self.session.read().await;
        let Some(auth) = session.as_ref() else {
            return request;
        };
        let request = request.header("Cookie", auth.ticket().as_cookie_header());
        match auth.csrf_token() {
            Some(csrf) => request.header("CSRFPreventionToken", csrf.as_str()),
            None => request,
        }
    }
}

fn build_limiter(limit: RateLimitConfig) -> ProxmoxResult<Arc<DefaultDirectRateLimiter>> {
    let per_second = NonZeroU32::new(limit.requests_per_second)
        .ok_or_else(|| ValidationError::field("requests_per_second", "must be greater than zero"))?;
    let burst = NonZeroU32::new(limit.burst_size)
        .ok_or_else(|| ValidationError::field("burst_size", "must be greater than zero"))?;
    Ok(Arc::new(DefaultDirectRateLimiter::direct(
        Quota::per_second(per_second).allow_burst(burst),
    )))
}

/// Proxmox puts the reason in a `message` member and per-parameter
/// complaints in `errors`; fall back to the raw body.
fn error_message(status: StatusCode, body: &str) -> String {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return non_empty_or_reason(status, body);
    };
    let mut message = json
        .get("message")
        .and_then(serde_json::Value::as_str)
        .map(|m| m.trim().to_string())
        .unwrap_or_default();
    if let Some(errors) = json.get("errors").and_then(serde_json::Value::as_object) {
        let details: Vec<String> = errors
            .iter()
            .map(|(param, reason)| format!("{param}: {}", reason.as_str().unwrap_or_default().trim()))
            .collect();
        if !message.is_empty() {
            message.push(' ');
        }
        message.push_str(&details.join(", "));
    }
    non_empty_or_reason(status, &message)
}

fn non_empty_or_reason(status: StatusCode, text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        status.canonical_reason().unwrap_or("unknown").to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::{
        model::client_config::RateLimitConfig,
        value_object::{
            ProxmoxCSRFToken, ProxmoxEndpoint, ProxmoxPassword, ProxmoxTicket, ProxmoxUsername,
        },
    };
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path},
    };

    fn connection_to(server_url: &str) -> ProxmoxConnection {
        ProxmoxConnection::new(
            ProxmoxEndpoint::new(server_url).unwrap(),
            ProxmoxUsername::new_unchecked("terraform@pve".to_string()),
            ProxmoxPassword::new_unchecked("s3cret-pass".to_string()),
            true,
        )
    }

    fn stored_session() -> ProxmoxAuth {
        let ticket = ProxmoxTicket::new_unchecked("PVE:terraform@pve:4EEC61E2::sig".to_string());
        let csrf = ProxmoxCSRFToken::new_unchecked("4EEC61E2:token".to_string());
        ProxmoxAuth::new(ticket, Some(csrf))
    }

    #[tokio::test]
    async fn test_get_success_sends_auth_headers() {
        let server = MockServer::start().await;
        let client =
            ApiClient::new(connection_to(&server.uri()), ClientConfig::default())
                .unwrap();
        client.set_auth(stored_session()).await;

        Mock::given(method("GET"))
            .and(path("/api2/json/test"))
            .and(header("Cookie", "PVEAuthCookie=PVE:terraform@pve:4EEC61E2::sig"))
            .and(header("CSRFPreventionToken", "4EEC61E2:token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": "ok"})),
            )
            .mount(&server)
            .await;

        let result: serde_json::Value = client.get("test").await.unwrap();
        assert_eq!(result["data"], "ok");
    }

    #[tokio::test]
    async fn test_unauthorized_triggers_refresh() {
        let server = MockServer::start().await;
        let client =
            ApiClient::new(connection_to(&server.uri()), ClientConfig::default())
                .unwrap();
        client.set_auth(stored_session()).await;

        Mock::given(method("GET"))
            .and(path("/api2/json/test"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "ticket": "PVE:terraform@pve:4EEC61E2::new_sig",
                    "CSRFPreventionToken": "4EEC61E2:abc123"
                }
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api2/json/test"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": "ok"})),
            )
            .mount(&server)
            .await;

        let result: serde_json::Value = client.get("test").await.unwrap();
        assert_eq!(result["data"], "ok");

        let auth = client.auth().await.unwrap();
        assert_eq!(auth.ticket().as_str(), "PVE:terraform@pve:4EEC61E2::new_sig");
        assert_eq!(auth.csrf_token().unwrap().as_str(), "4EEC61E2:abc123");
    }

    #[tokio::test]
    async fn test_unauthenticated_client_logs_in_first() {
        let server = MockServer::start().await;
        let client =
            ApiClient::new(connection_to(&server.uri()), ClientConfig::default())
                .unwrap();

        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "ticket": "PVE:terraform@pve:4EEC61E2::sig",
                    "CSRFPreventionToken": "4EEC61E2:abc123"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api2/json/version"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": {"version": "8.2.4"}})),
            )
            .mount(&server)
            .await;

        let result: serde_json::Value = client.get("version").await.unwrap();
        assert_eq!(result["data"]["version"], "8.2.4");
        assert!(client.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_refresh_failure_returns_error() {
        let server = MockServer::start().await;
        let client =
            ApiClient::new(connection_to(&server.uri()), ClientConfig::default())
                .unwrap();

        Mock::given(method("GET"))
            .and(path("/api2/json/test"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result: ProxmoxResult<serde_json::Value> = client.get("test").await;
        assert!(matches!(result, Err(ProxmoxError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_api_error_carries_status_and_message() {
        let server = MockServer::start().await;
        let client =
            ApiClient::new(connection_to(&server.uri()), ClientConfig::default())
                .unwrap();
        client.set_auth(stored_session()).await;

        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve/qemu/9000/clone"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "data": null,
                "message": "can't lock file '/var/lock/qemu-server/lock-9000.conf' - got timeout\n"
            })))
            .mount(&server)
            .await;

        let result: ProxmoxResult<serde_json::Value> = client
            .post("nodes/pve/qemu/9000/clone", &serde_json::json!({"newid": 201}))
            .await;
        match result {
            Err(error @ ProxmoxError::Api { status: 500, .. }) => {
                assert!(error.is_transient());
                assert!(error.to_string().contains("can't lock file"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"data":null,"errors":{"cores":"value must be at least 1"},"message":"Parameter verification failed.\n"}"#;
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, body),
            "Parameter verification failed. cores: value must be at least 1"
        );
        assert_eq!(error_message(StatusCode::NOT_FOUND, ""), "Not Found");
        assert_eq!(
            error_message(StatusCode::INTERNAL_SERVER_ERROR, "plain text"),
            "plain text"
        );
    }

    #[test]
    fn test_zero_rate_limit_is_rejected() {
        let config = ClientConfig {
            rate_limit: Some(RateLimitConfig {
                requests_per_second: 0,
                burst_size: 1,
            }),
            ..Default::default()
        };
        let result = ApiClient::new(connection_to("https://pve.local:8006"), config);
        assert!(matches!(result, Err(ProxmoxError::Validation(_))));
    }

    #[tokio::test]
    async fn test_rate_limiting_delays_requests() {
        use std::time::{Duration, Instant};

        let server = MockServer::start().await;
        let config = ClientConfig {
            rate_limit: Some(RateLimitConfig {
                requests_per_second: 2,
                burst_size: 2,
            }),
            ..Default::default()
        };
        let client = ApiClient::new(connection_to(&server.uri()), config).unwrap();
        client.set_auth(stored_session()).await;

        Mock::given(method("GET"))
            .and(path("/api2/json/test"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": "ok"})),
            )
            .expect(4)
            .mount(&server)
            .await;

        // Burst of two passes immediately.
        let start = Instant::now();
        let (res1, res2) = tokio::join!(
            client.get::<serde_json::Value>("test"),
            client.get::<serde_json::Value>("test")
        );
        res1.unwrap();
        res2.unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));

        // The next two have to wait for the bucket to refill.
        let start = Instant::now();
        let (res3, res4) = tokio::join!(
            client.get::<serde_json::Value>("test"),
            client.get::<serde_json::Value>("test")
        );
        res3.unwrap();
        res4.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
