//! Model discovery.
//!
//! The model service lists what the signed-in identity may use at
//! `{resource root}/api/v1/models`. Results land in a [`ModelCatalog`] shared
//! by the generator factory and whatever renders model pickers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::auth::TokenManager;
use crate::config::AuthType;

/// Resource root used when the credentials carry none.
pub const DEFAULT_RESOURCE_ROOT: &str = "https://tmcli.buguk12.com";

const MODELS_PATH: &str = "/api/v1/models";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFetchErrorCode {
    NetworkError,
    AuthError,
    EmptyResponse,
    NoToken,
}

impl ModelFetchErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFetchErrorCode::NetworkError => "NETWORK_ERROR",
            ModelFetchErrorCode::AuthError => "AUTH_ERROR",
            ModelFetchErrorCode::EmptyResponse => "EMPTY_RESPONSE",
            ModelFetchErrorCode::NoToken => "NO_TOKEN",
        }
    }
}

impl fmt::Display for ModelFetchErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({code})")]
pub struct ModelFetchError {
    pub code: ModelFetchErrorCode,
    pub message: String,
}

impl ModelFetchError {
    fn new(code: ModelFetchErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Outcome of one discovery run. `models` is empty unless `success`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelFetchResult {
    pub success: bool,
    pub models: Vec<String>,
    pub error: Option<ModelFetchError>,
}

impl ModelFetchResult {
    fn ok(models: Vec<String>) -> Self {
        Self {
            success: true,
            models,
            error: None,
        }
    }

    fn failed(error: ModelFetchError) -> Self {
        Self {
            success: false,
            models: Vec::new(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelFetchOptions {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for ModelFetchOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    available: Option<bool>,
}

/// Turns a resource URL into the API root: no `/v1`, no trailing slash, and
/// an `https://` scheme when none is given.
pub fn normalize_resource_root(resource_url: Option<&str>) -> String {
    let Some(url) = resource_url.map(str::trim).filter(|u| !u.is_empty()) else {
        return DEFAULT_RESOURCE_ROOT.to_string();
    };

    let mut root = url.trim_end_matches('/');
    if let Some(stripped) = root.strip_suffix("/v1") {
        root = stripped.trim_end_matches('/');
    }
    if root.starts_with("http://") || root.starts_with("https://") {
        root.to_string()
    } else {
        format!("https://{}", root)
    }
}

/// Lists the models available to the identity behind `tokens`.
///
/// Authentication failures are not retried and drop the token cache so the
/// next caller re-reads or refreshes credentials.
pub async fn fetch_models(
    tokens: &TokenManager,
    http: &reqwest::Client,
    options: &ModelFetchOptions,
) -> ModelFetchResult {
    let credentials = match tokens.get_valid_credentials(false).await {
        Ok(credentials) => credentials,
        Err(e) => {
            return ModelFetchResult::failed(ModelFetchError::new(
                ModelFetchErrorCode::NoToken,
                format!("No access token available: {}", e),
            ));
        }
    };
    let Some(token) = credentials.access_token() else {
        return ModelFetchResult::failed(ModelFetchError::new(
            ModelFetchErrorCode::NoToken,
            "No access token available",
        ));
    };

    let endpoint = format!(
        "{}{}",
        normalize_resource_root(credentials.resource_url.as_deref()),
        MODELS_PATH
    );
    let mut last_error = None;

    for attempt in 0..=options.max_retries {
        if attempt > 0 {
            let delay = options.backoff * attempt;
            debug!("Retrying model fetch in {:?} ({}/{})", delay, attempt, options.max_retries);
            tokio::time::sleep(delay).await;
        }

        let response = match http
            .get(&endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(ACCEPT, "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Model fetch from {} failed: {}", endpoint, e);
                last_error = Some(ModelFetchError::new(ModelFetchErrorCode::NetworkError, e.to_string()));
                continue;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let message = format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            );
            if matches!(status.as_u16(), 401 | 403) {
                error!(
                    "Model fetch failed (AUTH_ERROR, status {}) from {}",
                    status.as_u16(),
                    endpoint
                );
                tokens.clear_cache();
                return ModelFetchResult::failed(ModelFetchError::new(
                    ModelFetchErrorCode::AuthError,
                    message,
                ));
            }
            warn!("Model fetch from {} returned {}", endpoint, status);
            last_error = Some(ModelFetchError::new(ModelFetchErrorCode::NetworkError, message));
            continue;
        }

        let body: ModelsResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Model list from {} was unreadable: {}", endpoint, e);
                last_error = Some(ModelFetchError::new(ModelFetchErrorCode::NetworkError, e.to_string()));
                continue;
            }
        };

        let models: Vec<String> = body
            .data
            .into_iter()
            .filter(|m| m.available != Some(false))
            .filter_map(|m| m.name.filter(|n| !n.is_empty()))
            .collect();

        if models.is_empty() {
            error!("Model fetch failed (EMPTY_RESPONSE) from {}", endpoint);
            return ModelFetchResult::failed(ModelFetchError::new(
                ModelFetchErrorCode::EmptyResponse,
                "No available models returned by server.",
            ));
        }

        debug!("Discovered {} models", models.len());
        return ModelFetchResult::ok(models);
    }

    let error = last_error.unwrap_or_else(|| {
        ModelFetchError::new(
            ModelFetchErrorCode::NetworkError,
            "Network error during model fetch",
        )
    });
    error!("Model fetch failed ({}): {}", error.code, error.message);
    ModelFetchResult::failed(error)
}

/// A model as offered in a picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableModel {
    pub id: String,
    pub label: String,
}

impl AvailableModel {
    fn named(name: &str) -> Self {
        Self {
            id: name.to_string(),
            label: name.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    models: HashMap<AuthType, Vec<String>>,
    errors: HashMap<AuthType, ModelFetchError>,
}

/// Discovered models and the last discovery error, per auth type.
#[derive(Debug, Default)]
pub struct ModelCatalog {
    state: RwLock<CatalogState>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a discovery outcome. Success replaces the model list and
    /// clears the error; failure only records the error.
    pub fn record(&self, auth_type: AuthType, result: &ModelFetchResult) {
        let mut state = self.write();
        if result.success {
            state.models.insert(auth_type, result.models.clone());
            state.errors.remove(&auth_type);
        } else if let Some(error) = &result.error {
            state.errors.insert(auth_type, error.clone());
        }
    }

    pub fn models(&self, auth_type: AuthType) -> Vec<String> {
        self.read().models.get(&auth_type).cloned().unwrap_or_default()
    }

    pub fn last_error(&self, auth_type: AuthType) -> Option<ModelFetchError> {
        self.read().errors.get(&auth_type).cloned()
    }

    /// Models to offer for `auth_type`: the discovered list for OAuth
    /// identities, the configured model for static keys.
    pub fn available_models(&self, auth_type: AuthType, configured_model: &str) -> Vec<AvailableModel> {
        if auth_type.is_oauth() {
            return self.models(auth_type).iter().map(|m| AvailableModel::named(m)).collect();
        }
        if configured_model.is_empty() {
            Vec::new()
        } else {
            vec![AvailableModel::named(configured_model)]
        }
    }
}
