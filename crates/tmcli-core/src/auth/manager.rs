//! Token lifecycle management.
//!
//! One [`TokenManager`] exists per identity and is shared by `Arc` between
//! the device flow, model discovery and every credentialed generator. It keeps
//! the credential cache in sync with the file on disk and makes sure that
//! concurrent callers needing a refresh share a single network call.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use tmwire::ChatError;
use tracing::{debug, warn};

use crate::auth::credentials::Credentials;
use crate::auth::oauth::{DeviceOAuthClient, OAuthError};
use crate::auth::storage::{CredentialStore, StorageError};

/// Why valid credentials could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenErrorKind {
    NoRefreshToken,
    RefreshFailed,
    NetworkError,
    FileAccess,
}

impl TokenErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenErrorKind::NoRefreshToken => "NO_REFRESH_TOKEN",
            TokenErrorKind::RefreshFailed => "REFRESH_FAILED",
            TokenErrorKind::NetworkError => "NETWORK_ERROR",
            TokenErrorKind::FileAccess => "FILE_ACCESS_ERROR",
        }
    }
}

impl fmt::Display for TokenErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of [`TokenManager::get_valid_credentials`]. Cloneable so that one
/// refresh outcome can be handed to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TokenManagerError {
    pub kind: TokenErrorKind,
    pub message: String,
}

impl TokenManagerError {
    pub fn new(kind: TokenErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_oauth(err: OAuthError) -> Self {
        if err.is_transient() {
            Self::new(
                TokenErrorKind::NetworkError,
                format!("Network error during token refresh: {}", err),
            )
        } else {
            Self::new(TokenErrorKind::RefreshFailed, err.to_string())
        }
    }

    fn from_storage(err: StorageError) -> Self {
        Self::new(TokenErrorKind::FileAccess, err.to_string())
    }
}

#[derive(Debug, Default)]
struct CacheState {
    credentials: Option<Credentials>,
    /// mtime of the file the cache was last loaded from or written to.
    file_mtime: Option<SystemTime>,
    /// Bumped after every completed refresh.
    refresh_generation: u64,
    last_refresh: Option<Result<Credentials, TokenManagerError>>,
}

/// Caches, validates and refreshes one identity's credentials.
pub struct TokenManager {
    oauth: Arc<dyn DeviceOAuthClient>,
    store: CredentialStore,
    state: Mutex<CacheState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    pub fn new(oauth: Arc<dyn DeviceOAuthClient>, store: CredentialStore) -> Self {
        Self {
            oauth,
            store,
            state: Mutex::new(CacheState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn oauth_client(&self) -> &Arc<dyn DeviceOAuthClient> {
        &self.oauth
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        // The state stays consistent across a panic; recover it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reloads the credential file if another process changed it. File I/O
    /// happens outside the state lock.
    fn sync_from_disk(&self) {
        let mtime = self.store.modified();
        if mtime == self.lock_state().file_mtime {
            return;
        }

        let loaded = self.store.load();
        let mut state = self.lock_state();
        match loaded {
            Ok(credentials) => {
                debug!("Credential file changed on disk, reloading");
                state.credentials = credentials;
                state.file_mtime = mtime;
            }
            Err(e) => warn!("Ignoring unreadable credential file: {}", e),
        }
    }

    fn cached_if_valid(&self) -> Option<Credentials> {
        self.lock_state()
            .credentials
            .as_ref()
            .filter(|c| c.is_valid())
            .cloned()
    }

    /// Returns usable credentials, refreshing them when missing, expired or
    /// when `force_refresh` is set.
    ///
    /// Callers that arrive while a refresh is in flight wait for it and get
    /// its outcome instead of starting another one.
    pub async fn get_valid_credentials(
        &self,
        force_refresh: bool,
    ) -> Result<Credentials, TokenManagerError> {
        self.sync_from_disk();
        if !force_refresh && let Some(credentials) = self.cached_if_valid() {
            return Ok(credentials);
        }

        let observed_generation = self.lock_state().refresh_generation;
        let _guard = self.refresh_lock.lock().await;

        {
            let state = self.lock_state();
            if state.refresh_generation != observed_generation
                && let Some(outcome) = &state.last_refresh
            {
                debug!("Sharing result of concurrent token refresh");
                return outcome.clone();
            }
        }

        // Another process may have refreshed while we waited.
        self.sync_from_disk();
        if !force_refresh && let Some(credentials) = self.cached_if_valid() {
            return Ok(credentials);
        }

        let outcome = self.refresh().await;
        let mut state = self.lock_state();
        state.refresh_generation += 1;
        state.last_refresh = Some(outcome.clone());
        outcome
    }

    async fn refresh(&self) -> Result<Credentials, TokenManagerError> {
        let current = self.lock_state().credentials.clone();
        let refresh_token = current
            .as_ref()
            .and_then(|c| c.refresh_token.clone())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                TokenManagerError::new(
                    TokenErrorKind::NoRefreshToken,
                    "No refresh token available. Please re-authenticate.",
                )
            })?;

        debug!("Refreshing access token");
        let response = match self.oauth.refresh_access_token(&refresh_token).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to refresh access token: {}", e);
                return Err(TokenManagerError::from_oauth(e));
            }
        };

        let refreshed = Credentials::from_token_response(response, current.as_ref());
        if refreshed.access_token().is_none() {
            return Err(TokenManagerError::new(
                TokenErrorKind::RefreshFailed,
                "Token refresh returned no access token",
            ));
        }

        self.persist(&refreshed).map_err(TokenManagerError::from_storage)?;
        debug!("Successfully refreshed access token");
        Ok(refreshed)
    }

    fn persist(&self, credentials: &Credentials) -> Result<(), StorageError> {
        self.store.save(credentials)?;
        let mtime = self.store.modified();
        let mut state = self.lock_state();
        state.credentials = Some(credentials.clone());
        state.file_mtime = mtime;
        Ok(())
    }

    /// Persists freshly issued credentials and caches them.
    pub fn store_credentials(&self, credentials: Credentials) -> Result<(), StorageError> {
        self.persist(&credentials)
    }

    /// Cached credentials without validation or I/O.
    pub fn get_current_credentials(&self) -> Option<Credentials> {
        self.lock_state().credentials.clone()
    }

    /// Drops the in-memory cache. The next call reloads from disk.
    pub fn clear_cache(&self) {
        let mut state = self.lock_state();
        state.credentials = None;
        state.file_mtime = None;
        state.last_refresh = None;
    }

    /// Deletes the persisted credentials and clears the cache.
    pub fn clear_persisted(&self) -> Result<(), StorageError> {
        self.store.delete()?;
        self.clear_cache();
        Ok(())
    }
}

const AUTH_ERROR_PHRASES: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid api key",
    "invalid access token",
    "token expired",
    "authentication",
    "access denied",
];

/// Whether a failure means the credentials were not accepted.
pub fn is_auth_error(status: Option<u16>, message: &str) -> bool {
    if matches!(status, Some(401 | 403)) {
        return true;
    }
    let message = message.to_lowercase();
    AUTH_ERROR_PHRASES.iter().any(|p| message.contains(p))
        || (message.contains("token") && message.contains("expired"))
}

/// [`is_auth_error`] for generator failures. Credential acquisition failures
/// are excluded: refreshing again cannot fix them.
pub fn is_auth_chat_error(err: &ChatError) -> bool {
    match err {
        ChatError::Credentials(_) => false,
        ChatError::Api { status, message } => is_auth_error(Some(*status), message),
        other => is_auth_error(other.status(), &other.to_string()),
    }
}
