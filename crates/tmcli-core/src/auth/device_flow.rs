//! OAuth2 device authorization grant, end to end.
//!
//! The authenticator requests a device code, shows the verification URI to
//! the user, then polls the token endpoint until the user approves, the code
//! expires or the session is cancelled. Progress is reported over an
//! unbounded channel so any front end can render it.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::credentials::Credentials;
use crate::auth::manager::TokenManager;
use crate::auth::oauth::{DeviceAuthorization, DeviceOAuthClient, DeviceTokenPoll};
use crate::auth::pkce::PkcePair;

/// Polling interval when the server does not send one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Added to the interval on every `slow_down`.
pub const SLOW_DOWN_STEP: Duration = Duration::from_secs(2);

pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on a device code's advertised lifetime.
pub const MAX_DEVICE_CODE_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifecycle of one login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    AuthorizationRequested,
    AwaitingUserAction,
    Polling,
    Succeeded,
    Failed(FailureReason),
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthProgress {
    Polling,
    Success,
    Error,
    Timeout,
    RateLimit,
}

impl AuthProgress {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthProgress::Polling => "polling",
            AuthProgress::Success => "success",
            AuthProgress::Error => "error",
            AuthProgress::Timeout => "timeout",
            AuthProgress::RateLimit => "rate_limit",
        }
    }
}

impl fmt::Display for AuthProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted while authenticating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// The user should visit this URI and enter the code.
    AuthorizationUri(DeviceAuthorization),
    Progress { status: AuthProgress, message: String },
}

/// Handle shared between the authenticator and whoever drives the login.
#[derive(Debug, Clone)]
pub struct AuthSession {
    events: Option<mpsc::UnboundedSender<AuthEvent>>,
    cancel: CancellationToken,
    state: Arc<Mutex<AttemptState>>,
}

impl Default for AuthSession {
    /// A session nobody listens to.
    fn default() -> Self {
        Self {
            events: None,
            cancel: CancellationToken::new(),
            state: Arc::new(Mutex::new(AttemptState::Idle)),
        }
    }
}

impl AuthSession {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuthEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            events: Some(tx),
            ..Self::default()
        };
        (session, rx)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Asks the running flow to stop before its next poll.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> AttemptState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_state(&self, next: AttemptState) {
        debug!("Device flow state: {:?}", next);
        match self.state.lock() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn emit(&self, event: AuthEvent) {
        if let Some(tx) = &self.events {
            // Receiver may have been dropped
            let _ = tx.send(event);
        }
    }

    fn progress(&self, status: AuthProgress, message: impl Into<String>) {
        self.emit(AuthEvent::Progress {
            status,
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    Timeout,
    Cancelled,
    Error,
    RateLimit,
}

/// Why a login attempt ended without credentials.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AuthFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl AuthFailure {
    fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Next interval after the server asked us to slow down.
pub fn slowed_down(interval: Duration) -> Duration {
    (interval + SLOW_DOWN_STEP).min(MAX_POLL_INTERVAL)
}

/// Runs the device authorization grant and stores the issued credentials.
pub struct DeviceFlowAuthenticator {
    client: Arc<dyn DeviceOAuthClient>,
    tokens: Arc<TokenManager>,
    suppress_browser: bool,
}

impl DeviceFlowAuthenticator {
    pub fn new(client: Arc<dyn DeviceOAuthClient>, tokens: Arc<TokenManager>) -> Self {
        Self {
            client,
            tokens,
            suppress_browser: false,
        }
    }

    pub fn with_suppress_browser(mut self, suppress: bool) -> Self {
        self.suppress_browser = suppress;
        self
    }

    pub async fn authenticate(&self, session: &AuthSession) -> Result<Credentials, AuthFailure> {
        if session.is_cancelled() {
            return Err(Self::cancelled(session));
        }

        let pkce = PkcePair::generate();
        session.set_state(AttemptState::AuthorizationRequested);
        let authorization = match self.client.request_device_authorization(&pkce).await {
            Ok(authorization) => authorization,
            Err(e) => {
                return Err(Self::fail(
                    session,
                    FailureReason::Error,
                    format!("Device authorization flow failed: {}", e),
                ));
            }
        };

        session.set_state(AttemptState::AwaitingUserAction);
        session.emit(AuthEvent::AuthorizationUri(authorization.clone()));
        self.show_verification_uri(&authorization);

        let mut interval = authorization
            .interval
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let lifetime = Duration::from_secs(authorization.expires_in).min(MAX_DEVICE_CODE_LIFETIME);
        let deadline = Instant::now() + lifetime;

        session.set_state(AttemptState::Polling);
        while Instant::now() < deadline {
            if session.is_cancelled() {
                return Err(Self::cancelled(session));
            }

            session.progress(AuthProgress::Polling, "Waiting for authorization...");
            match self
                .client
                .poll_device_token(&authorization.device_code, &pkce.code_verifier)
                .await
            {
                Ok(DeviceTokenPoll::Success(response)) => {
                    let credentials = Credentials::from_token_response(response, None);
                    if let Err(e) = self.tokens.store_credentials(credentials.clone()) {
                        return Err(Self::fail(session, FailureReason::Error, e.to_string()));
                    }
                    session.set_state(AttemptState::Succeeded);
                    session.progress(
                        AuthProgress::Success,
                        "Authentication successful! Access token obtained.",
                    );
                    return Ok(credentials);
                }
                Ok(DeviceTokenPoll::Pending { slow_down }) => {
                    if slow_down {
                        interval = slowed_down(interval);
                        debug!("Server asked to slow down, polling every {:?}", interval);
                    }
                }
                Ok(DeviceTokenPoll::Failed {
                    error,
                    description,
                    status,
                }) => {
                    if status == 429 || error == "rate_limit" {
                        let message = "Too many requests. The server is rate limiting our requests. Please wait a moment and try again.";
                        session.progress(AuthProgress::RateLimit, message);
                        session.set_state(AttemptState::Failed(FailureReason::RateLimit));
                        return Err(AuthFailure::new(FailureReason::RateLimit, message));
                    }
                    let message = if error == "access_denied" {
                        "User denied access. Please start authentication again.".to_string()
                    } else {
                        description
                            .filter(|d| !d.is_empty())
                            .unwrap_or_else(|| format!("Authentication failed: {}", error))
                    };
                    return Err(Self::fail(session, FailureReason::Error, message));
                }
                Err(e) if e.is_transient() => {
                    warn!("Token poll failed, will retry: {}", e);
                }
                Err(e) => {
                    return Err(Self::fail(
                        session,
                        FailureReason::Error,
                        format!("Device authorization flow failed: {}", e),
                    ));
                }
            }

            tokio::select! {
                _ = session.cancel.cancelled() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }

        let message = "Authentication timed out. Please try again.";
        session.progress(AuthProgress::Timeout, message);
        session.set_state(AttemptState::TimedOut);
        Err(AuthFailure::new(FailureReason::Timeout, message))
    }

    fn fail(session: &AuthSession, reason: FailureReason, message: String) -> AuthFailure {
        session.progress(AuthProgress::Error, message.as_str());
        session.set_state(AttemptState::Failed(reason));
        AuthFailure::new(reason, message)
    }

    fn cancelled(session: &AuthSession) -> AuthFailure {
        let message = "Authentication cancelled by user.";
        session.progress(AuthProgress::Error, message);
        session.set_state(AttemptState::Cancelled);
        AuthFailure::new(FailureReason::Cancelled, message)
    }

    fn show_verification_uri(&self, authorization: &DeviceAuthorization) {
        let uri = authorization.browser_uri();
        if !self.suppress_browser {
            match open::that(uri) {
                Ok(()) => return,
                Err(e) => debug!("Failed to open browser: {}", e),
            }
        }

        let rule = "=".repeat(72);
        eprintln!("\n{rule}");
        eprintln!("Authorize tmcli in your browser:");
        eprintln!("\n  {uri}\n");
        eprintln!("User code: {}", authorization.user_code);
        eprintln!("{rule}\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::oauth::{OAuthError, TokenResponse};
    use crate::auth::storage::CredentialStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedClient {
        expires_in: u64,
        interval: Option<u64>,
        polls: Mutex<VecDeque<DeviceTokenPoll>>,
        /// Returned by the first poll instead of the script when set.
        poll_error: Mutex<Option<OAuthError>>,
        poll_count: AtomicUsize,
        /// Cancelled from inside the first poll when set.
        cancel_on_poll: Option<CancellationToken>,
    }

    impl ScriptedClient {
        fn new(expires_in: u64, polls: Vec<DeviceTokenPoll>) -> Self {
            Self {
                expires_in,
                interval: None,
                polls: Mutex::new(polls.into()),
                poll_error: Mutex::new(None),
                poll_count: AtomicUsize::new(0),
                cancel_on_poll: None,
            }
        }

        fn polls(&self) -> usize {
            self.poll_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeviceOAuthClient for ScriptedClient {
        async fn request_device_authorization(
            &self,
            pkce: &PkcePair,
        ) -> Result<DeviceAuthorization, OAuthError> {
            assert_eq!(pkce.code_challenge.len(), 43);
            Ok(DeviceAuthorization {
                device_code: "device".into(),
                user_code: "ABCD-EFGH".into(),
                verification_uri: "https://auth.example.com/device".into(),
                verification_uri_complete: "https://auth.example.com/device?code=ABCD-EFGH".into(),
                expires_in: self.expires_in,
                interval: self.interval,
            })
        }

        async fn poll_device_token(&self, device_code: &str, _: &str) -> Result<DeviceTokenPoll, OAuthError> {
            assert_eq!(device_code, "device");
            self.poll_count.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.cancel_on_poll {
                token.cancel();
            }
            if let Some(error) = self.poll_error.lock().unwrap().take() {
                return Err(error);
            }
            Ok(self
                .polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(DeviceTokenPoll::Pending { slow_down: false }))
        }

        async fn refresh_access_token(&self, _: &str) -> Result<TokenResponse, OAuthError> {
            Err(OAuthError::General("not scripted".into()))
        }
    }

    fn success() -> DeviceTokenPoll {
        DeviceTokenPoll::Success(TokenResponse {
            access_token: Some("access".into()),
            refresh_token: Some("refresh".into()),
            expires_in: Some(3600),
            resource_url: Some("tmcli.example.com".into()),
            ..Default::default()
        })
    }

    fn authenticator(client: Arc<ScriptedClient>, dir: &tempfile::TempDir) -> (DeviceFlowAuthenticator, Arc<TokenManager>) {
        let tokens = Arc::new(TokenManager::new(
            client.clone(),
            CredentialStore::new(dir.path().join("creds.json")),
        ));
        let auth = DeviceFlowAuthenticator::new(client, tokens.clone()).with_suppress_browser(true);
        (auth, tokens)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AuthEvent>) -> Vec<AuthEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn statuses(events: &[AuthEvent]) -> Vec<AuthProgress> {
        events
            .iter()
            .filter_map(|e| match e {
                AuthEvent::Progress { status, .. } => Some(*status),
                AuthEvent::AuthorizationUri(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_slow_down_is_capped() {
        assert_eq!(slowed_down(Duration::from_secs(2)), Duration::from_secs(4));
        assert_eq!(slowed_down(Duration::from_secs(9)), Duration::from_secs(10));
        assert_eq!(slowed_down(MAX_POLL_INTERVAL), MAX_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_down_then_success() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(
            600,
            vec![
                DeviceTokenPoll::Pending { slow_down: true },
                DeviceTokenPoll::Pending { slow_down: true },
                success(),
            ],
        ));
        let (auth, tokens) = authenticator(client.clone(), &dir);
        let (session, mut rx) = AuthSession::new();

        let start = Instant::now();
        let creds = auth.authenticate(&session).await.unwrap();

        // 4s after the first slow_down, 6s after the second
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(client.polls(), 3);
        assert_eq!(creds.access_token(), Some("access"));
        assert_eq!(tokens.store().load().unwrap(), Some(creds));
        assert_eq!(session.state(), AttemptState::Succeeded);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], AuthEvent::AuthorizationUri(a) if a.user_code == "ABCD-EFGH"));
        assert_eq!(
            statuses(&events),
            vec![
                AuthProgress::Polling,
                AuthProgress::Polling,
                AuthProgress::Polling,
                AuthProgress::Success
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_uses_server_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = ScriptedClient::new(
            600,
            vec![DeviceTokenPoll::Pending { slow_down: false }, success()],
        );
        client.interval = Some(5);
        let client = Arc::new(client);
        let (auth, _tokens) = authenticator(client.clone(), &dir);

        let start = Instant::now();
        auth.authenticate(&AuthSession::default()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(client.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_polling() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(600, vec![success()]));
        let (auth, tokens) = authenticator(client.clone(), &dir);
        let (session, mut rx) = AuthSession::new();
        session.cancel();

        let err = auth.authenticate(&session).await.unwrap_err();
        assert_eq!(err.reason, FailureReason::Cancelled);
        assert_eq!(err.message, "Authentication cancelled by user.");
        assert_eq!(client.polls(), 0);
        assert!(tokens.get_current_credentials().is_none());
        assert_eq!(session.state(), AttemptState::Cancelled);
        assert_eq!(statuses(&drain(&mut rx)), vec![AuthProgress::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_stops_polling() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _rx) = AuthSession::new();
        let mut client = ScriptedClient::new(600, vec![]);
        client.cancel_on_poll = Some(session.cancel_token());
        let client = Arc::new(client);
        let (auth, _tokens) = authenticator(client.clone(), &dir);

        let start = Instant::now();
        let err = auth.authenticate(&session).await.unwrap_err();
        assert_eq!(err.reason, FailureReason::Cancelled);
        assert_eq!(client.polls(), 1);
        // The sleep was cut short
        assert!(start.elapsed() < DEFAULT_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(6, vec![]));
        let (auth, _tokens) = authenticator(client.clone(), &dir);
        let (session, mut rx) = AuthSession::new();

        let err = auth.authenticate(&session).await.unwrap_err();
        assert_eq!(err.reason, FailureReason::Timeout);
        assert_eq!(client.polls(), 3);
        assert_eq!(session.state(), AttemptState::TimedOut);
        assert_eq!(statuses(&drain(&mut rx)).last(), Some(&AuthProgress::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(
            600,
            vec![DeviceTokenPoll::Failed {
                error: "rate_limit".into(),
                description: None,
                status: 429,
            }],
        ));
        let (auth, _tokens) = authenticator(client, &dir);
        let (session, mut rx) = AuthSession::new();

        let err = auth.authenticate(&session).await.unwrap_err();
        assert_eq!(err.reason, FailureReason::RateLimit);
        assert_eq!(statuses(&drain(&mut rx)).last(), Some(&AuthProgress::RateLimit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_denied_message() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(
            600,
            vec![DeviceTokenPoll::Failed {
                error: "access_denied".into(),
                description: Some("The user said no".into()),
                status: 400,
            }],
        ));
        let (auth, _tokens) = authenticator(client, &dir);

        let err = auth.authenticate(&AuthSession::default()).await.unwrap_err();
        assert_eq!(err.reason, FailureReason::Error);
        assert_eq!(err.message, "User denied access. Please start authentication again.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_error_prefers_description() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(
            600,
            vec![
                DeviceTokenPoll::Failed {
                    error: "expired_token".into(),
                    description: Some("Device code expired".into()),
                    status: 400,
                },
            ],
        ));
        let (auth, _tokens) = authenticator(client, &dir);
        let err = auth.authenticate(&AuthSession::default()).await.unwrap_err();
        assert_eq!(err.message, "Device code expired");

        let client = Arc::new(ScriptedClient::new(
            600,
            vec![DeviceTokenPoll::Failed {
                error: "invalid_grant".into(),
                description: None,
                status: 400,
            }],
        ));
        let (auth, _tokens) = authenticator(client, &dir);
        let err = auth.authenticate(&AuthSession::default()).await.unwrap_err();
        assert_eq!(err.message, "Authentication failed: invalid_grant");
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_expires_in_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(u64::MAX, vec![success()]));
        let (auth, _tokens) = authenticator(client.clone(), &dir);

        let creds = auth.authenticate(&AuthSession::default()).await.unwrap();
        assert_eq!(creds.access_token(), Some("access"));
        assert_eq!(client.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_poll_error_keeps_polling() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(600, vec![success()]);
        *client.poll_error.lock().unwrap() = Some(OAuthError::Server(502));
        let client = Arc::new(client);
        let (auth, _tokens) = authenticator(client.clone(), &dir);

        let start = Instant::now();
        auth.authenticate(&AuthSession::default()).await.unwrap();
        assert_eq!(client.polls(), 2);
        assert_eq!(start.elapsed(), DEFAULT_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_poll_error_fails_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(600, vec![success()]);
        *client.poll_error.lock().unwrap() = Some(OAuthError::General("bad payload".into()));
        let client = Arc::new(client);
        let (auth, tokens) = authenticator(client.clone(), &dir);

        let err = auth.authenticate(&AuthSession::default()).await.unwrap_err();
        assert_eq!(err.reason, FailureReason::Error);
        assert!(err.message.starts_with("Device authorization flow failed:"));
        assert_eq!(client.polls(), 1);
        assert!(tokens.get_current_credentials().is_none());
    }
}
