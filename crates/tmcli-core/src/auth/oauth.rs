//! OAuth2 device authorization client.
//!
//! [`DeviceOAuthClient`] is the seam between the token machinery and the
//! network: the device flow and the [`TokenManager`](super::TokenManager) only
//! talk to the authorization server through it, so tests can script its
//! answers. [`HttpOAuthClient`] is the real implementation.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::auth::pkce::{CODE_CHALLENGE_METHOD, PkcePair};

/// Default authorization server.
pub const DEFAULT_OAUTH_BASE_URL: &str = "https://tmcli.buguk12.com";

/// OAuth client ID for tmcli
pub const DEFAULT_CLIENT_ID: &str = "tmcli";

pub const DEFAULT_SCOPE: &str = "openid profile email";

const DEVICE_CODE_PATH: &str = "/api/v1/oauth2/device/code";
const TOKEN_PATH: &str = "/api/v1/oauth2/token";
const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Device authorization response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: String,
    /// Seconds until the device code expires.
    pub expires_in: u64,
    /// Polling interval in seconds.
    #[serde(default)]
    pub interval: Option<u64>,
}

impl DeviceAuthorization {
    /// The URI to show the user, preferring the one with the code embedded.
    pub fn browser_uri(&self) -> &str {
        if self.verification_uri_complete.is_empty() {
            &self.verification_uri
        } else {
            &self.verification_uri_complete
        }
    }
}

/// Token endpoint success payload, for both device and refresh grants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Seconds until the access token expires.
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub resource_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl ErrorBody {
    fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    fn describe(&self) -> String {
        format!(
            "{}: {}",
            self.error,
            self.error_description
                .as_deref()
                .unwrap_or("No details provided")
        )
    }
}

/// Outcome of one token poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTokenPoll {
    /// The user approved; an access token was issued.
    Success(TokenResponse),
    /// Keep polling. `slow_down` asks for a longer interval.
    Pending { slow_down: bool },
    /// The server answered with a terminal OAuth error.
    Failed {
        error: String,
        description: Option<String>,
        status: u16,
    },
}

/// OAuth error types
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("OAuth flow error: {0}")]
    General(String),
    /// The stored grant is unusable and the user must sign in again.
    #[error("{0}")]
    CredentialsClearRequired(String),
    #[error("Token refresh failed: {0}")]
    Rejected(String),
    #[error("OAuth server error: HTTP {0}")]
    Server(u16),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OAuthError {
    /// Failures worth retrying later rather than re-authenticating.
    pub fn is_transient(&self) -> bool {
        matches!(self, OAuthError::Http(_) | OAuthError::Server(_))
    }
}

/// Calls the authorization server.
#[async_trait]
pub trait DeviceOAuthClient: Send + Sync {
    /// Starts a device authorization with the given PKCE challenge.
    async fn request_device_authorization(
        &self,
        pkce: &PkcePair,
    ) -> Result<DeviceAuthorization, OAuthError>;

    /// Asks whether the user has approved `device_code` yet.
    async fn poll_device_token(
        &self,
        device_code: &str,
        code_verifier: &str,
    ) -> Result<DeviceTokenPoll, OAuthError>;

    /// Exchanges a refresh token for a new access token.
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenResponse, OAuthError>;
}

/// Where and as whom to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClientConfig {
    pub base_url: String,
    pub client_id: String,
    pub scope: String,
}

impl Default for OAuthClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OAUTH_BASE_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
        }
    }
}

/// [`DeviceOAuthClient`] over HTTP with form-encoded requests.
#[derive(Debug, Clone)]
pub struct HttpOAuthClient {
    http: Client,
    config: OAuthClientConfig,
}

impl HttpOAuthClient {
    pub fn new(http: Client, config: OAuthClientConfig) -> Self {
        Self { http, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(&str, &str)],
        request_id: Option<String>,
    ) -> Result<(u16, Value), OAuthError> {
        let mut request = self
            .http
            .post(self.url(path))
            .header(ACCEPT, "application/json")
            .form(form);
        if let Some(id) = request_id {
            request = request.header("x-request-id", id);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        // Non-JSON bodies (proxies, gateways) are kept as a string value.
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok((status, body))
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

#[async_trait]
impl DeviceOAuthClient for HttpOAuthClient {
    async fn request_device_authorization(
        &self,
        pkce: &PkcePair,
    ) -> Result<DeviceAuthorization, OAuthError> {
        let (status, body) = self
            .post_form(
                DEVICE_CODE_PATH,
                &[
                    ("client_id", self.config.client_id.as_str()),
                    ("scope", self.config.scope.as_str()),
                    ("code_challenge", pkce.code_challenge.as_str()),
                    ("code_challenge_method", CODE_CHALLENGE_METHOD),
                ],
                Some(uuid::Uuid::new_v4().to_string()),
            )
            .await?;

        if !is_success(status) {
            let detail = ErrorBody::from_value(&body)
                .map(|e| e.describe())
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(OAuthError::General(format!(
                "Device authorization failed: {}",
                detail
            )));
        }

        if let Some(err) = ErrorBody::from_value(&body) {
            return Err(OAuthError::General(format!(
                "Device authorization failed: {}",
                err.describe()
            )));
        }

        let authorization: DeviceAuthorization = serde_json::from_value(body)?;
        debug!(
            "Device authorization issued, expires in {}s",
            authorization.expires_in
        );
        Ok(authorization)
    }

    async fn poll_device_token(
        &self,
        device_code: &str,
        code_verifier: &str,
    ) -> Result<DeviceTokenPoll, OAuthError> {
        let (status, body) = self
            .post_form(
                TOKEN_PATH,
                &[
                    ("grant_type", DEVICE_CODE_GRANT_TYPE),
                    ("client_id", self.config.client_id.as_str()),
                    ("device_code", device_code),
                    ("code_verifier", code_verifier),
                ],
                None,
            )
            .await?;

        if let Some(err) = ErrorBody::from_value(&body) {
            return Ok(match err.error.as_str() {
                "authorization_pending" => DeviceTokenPoll::Pending { slow_down: false },
                "slow_down" => DeviceTokenPoll::Pending { slow_down: true },
                _ => DeviceTokenPoll::Failed {
                    error: err.error,
                    description: err.error_description,
                    status,
                },
            });
        }

        if !is_success(status) {
            if status == 429 {
                return Ok(DeviceTokenPoll::Failed {
                    error: "rate_limit".to_string(),
                    description: None,
                    status,
                });
            }
            return Err(OAuthError::General(format!(
                "Device token poll failed: HTTP {}",
                status
            )));
        }

        let token: TokenResponse = serde_json::from_value(body)?;
        if token.access_token.as_deref().is_some_and(|t| !t.is_empty()) {
            Ok(DeviceTokenPoll::Success(token))
        } else {
            Ok(DeviceTokenPoll::Pending { slow_down: false })
        }
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenResponse, OAuthError> {
        if refresh_token.is_empty() {
            return Err(OAuthError::CredentialsClearRequired(
                "No refresh token available. Please re-authenticate.".to_string(),
            ));
        }

        let (status, body) = self
            .post_form(
                TOKEN_PATH,
                &[
                    ("grant_type", "refresh_token"),
                    ("client_id", self.config.client_id.as_str()),
                    ("refresh_token", refresh_token),
                ],
                None,
            )
            .await?;

        if status == 400 {
            return Err(OAuthError::CredentialsClearRequired(
                "Refresh token invalid or expired. Please re-authenticate.".to_string(),
            ));
        }
        if status >= 500 {
            return Err(OAuthError::Server(status));
        }
        if let Some(err) = ErrorBody::from_value(&body) {
            return Err(OAuthError::Rejected(err.describe()));
        }
        if !is_success(status) {
            return Err(OAuthError::Rejected(format!("HTTP {}", status)));
        }

        let token: TokenResponse = serde_json::from_value(body)?;
        if token.access_token.as_deref().is_none_or(str::is_empty) {
            return Err(OAuthError::Rejected(
                "response did not contain an access token".to_string(),
            ));
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpOAuthClient {
        HttpOAuthClient::new(
            Client::new(),
            OAuthClientConfig {
                base_url: server.uri(),
                ..Default::default()
            },
        )
    }

    async fn mount_token(server: &MockServer, status: u16, body: Value) {
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_device_authorization_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DEVICE_CODE_PATH))
            .and(header("accept", "application/json"))
            .and(header_exists("x-request-id"))
            .and(body_string_contains("client_id=tmcli"))
            .and(body_string_contains("code_challenge_method=S256"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "dev-1",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://example.com/device",
                "verification_uri_complete": "https://example.com/device?code=ABCD-EFGH",
                "expires_in": 600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let auth = client(&server)
            .request_device_authorization(&PkcePair::generate())
            .await
            .unwrap();
        assert_eq!(auth.device_code, "dev-1");
        assert_eq!(auth.interval, None);
        assert_eq!(auth.browser_uri(), "https://example.com/device?code=ABCD-EFGH");
    }

    #[tokio::test]
    async fn test_device_authorization_error_carries_details() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DEVICE_CODE_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_client",
                "error_description": "Unknown client"
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .request_device_authorization(&PkcePair::generate())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid_client: Unknown client"));
    }

    #[tokio::test]
    async fn test_poll_pending_and_slow_down() {
        let server = MockServer::start().await;
        mount_token(&server, 400, json!({"error": "slow_down"})).await;
        let poll = client(&server).poll_device_token("dev", "verifier").await.unwrap();
        assert_eq!(poll, DeviceTokenPoll::Pending { slow_down: true });

        let server = MockServer::start().await;
        mount_token(&server, 400, json!({"error": "authorization_pending"})).await;
        let poll = client(&server).poll_device_token("dev", "verifier").await.unwrap();
        assert_eq!(poll, DeviceTokenPoll::Pending { slow_down: false });
    }

    #[tokio::test]
    async fn test_poll_success_sends_verifier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("code_verifier=verifier"))
            .and(body_string_contains("device_code=dev"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at",
                "refresh_token": "rt",
                "token_type": "Bearer",
                "expires_in": 3600,
                "resource_url": "tmcli.example.com"
            })))
            .mount(&server)
            .await;

        match client(&server).poll_device_token("dev", "verifier").await.unwrap() {
            DeviceTokenPoll::Success(token) => {
                assert_eq!(token.access_token.as_deref(), Some("at"));
                assert_eq!(token.resource_url.as_deref(), Some("tmcli.example.com"));
            }
            other => panic!("unexpected poll result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_poll_denied_and_rate_limited() {
        let server = MockServer::start().await;
        mount_token(&server, 400, json!({"error": "access_denied"})).await;
        let poll = client(&server).poll_device_token("dev", "v").await.unwrap();
        assert!(matches!(poll, DeviceTokenPoll::Failed { ref error, .. } if error == "access_denied"));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(429).set_body_string("Too Many Requests"))
            .mount(&server)
            .await;
        let poll = client(&server).poll_device_token("dev", "v").await.unwrap();
        assert!(matches!(poll, DeviceTokenPoll::Failed { status: 429, .. }));
    }

    #[tokio::test]
    async fn test_refresh_classification() {
        let server = MockServer::start().await;
        mount_token(&server, 400, json!({"error": "invalid_grant"})).await;
        let err = client(&server).refresh_access_token("rt").await.unwrap_err();
        assert!(matches!(err, OAuthError::CredentialsClearRequired(_)));
        assert!(!err.is_transient());

        let server = MockServer::start().await;
        mount_token(&server, 503, json!({})).await;
        let err = client(&server).refresh_access_token("rt").await.unwrap_err();
        assert!(matches!(err, OAuthError::Server(503)));
        assert!(err.is_transient());

        let server = MockServer::start().await;
        mount_token(&server, 401, json!({"error": "invalid_client"})).await;
        let err = client(&server).refresh_access_token("rt").await.unwrap_err();
        assert!(matches!(err, OAuthError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_refresh_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new",
                "token_type": "Bearer",
                "expires_in": 7200
            })))
            .mount(&server)
            .await;

        let token = client(&server).refresh_access_token("rt").await.unwrap();
        assert_eq!(token.access_token.as_deref(), Some("new"));
        assert_eq!(token.refresh_token, None);
    }

    #[tokio::test]
    async fn test_refresh_without_token_skips_network() {
        let server = MockServer::start().await;
        let err = client(&server).refresh_access_token("").await.unwrap_err();
        assert!(matches!(err, OAuthError::CredentialsClearRequired(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
