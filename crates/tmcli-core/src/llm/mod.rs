//! Generator factory
//!
//! The [`Gateway`] owns everything one identity needs: the OAuth client, the
//! shared token manager and the model catalog. It builds the right
//! [`ContentGenerator`] for an [`AuthType`], authenticating and discovering
//! models first when the identity uses the device flow.

pub mod credentialed;

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tmwire::{ChatError, ContentGenerator, OpenAiGenerator};
use tracing::{debug, info, warn};

use crate::auth::{
    AuthFailure, AuthSession, CredentialStore, Credentials, DeviceFlowAuthenticator,
    DeviceOAuthClient, HttpOAuthClient, StorageError, TokenManager,
};
use crate::config::{
    AuthType, Config, ContentGeneratorConfig, DEFAULT_DINGTALK_BASE_URL, DEFAULT_OPENAI_MODEL,
    PLACEHOLDER_MODEL, is_placeholder_model, user_agent,
};
use crate::models::{
    ModelCatalog, ModelFetchError, ModelFetchErrorCode, ModelFetchOptions, ModelFetchResult,
    fetch_models,
};

pub use credentialed::{CredentialedGenerator, apply_request_defaults, endpoint_for};

/// Base URL for static-key identities without one configured.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Error type for generator construction
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("OpenAI API key is required")]
    MissingApiKey,
    #[error("No cached credentials found. Please run `tmcli login`.")]
    NoCachedCredentials,
    #[error(transparent)]
    Auth(#[from] AuthFailure),
    #[error("Failed to fetch models: {0}")]
    ModelDiscovery(ModelFetchError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Applies per-auth-type defaults to the user's settings.
pub fn create_content_generator_config(
    settings: &Config,
    auth_type: AuthType,
) -> Result<ContentGeneratorConfig, FactoryError> {
    let (model, api_key, base_url) = match auth_type {
        AuthType::DingtalkOAuth => (
            non_empty(&settings.model).unwrap_or(PLACEHOLDER_MODEL).to_string(),
            None,
            settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_DINGTALK_BASE_URL.to_string()),
        ),
        AuthType::OpenAi => {
            if !settings.has_api_key() {
                return Err(FactoryError::MissingApiKey);
            }
            (
                non_empty(&settings.model).unwrap_or(DEFAULT_OPENAI_MODEL).to_string(),
                Some(SecretString::new(settings.api_key.expose_secret().clone())),
                settings
                    .base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            )
        }
    };

    Ok(ContentGeneratorConfig {
        model,
        api_key,
        base_url: Some(base_url),
        auth_type,
        timeout: settings.timeout_secs.map(Duration::from_secs),
        max_retries: settings.max_retries,
        sampling_params: settings.sampling.clone(),
        proxy: settings.proxy.clone(),
        user_agent: user_agent(),
    })
}

fn non_empty(s: &str) -> Option<&str> {
    Some(s.trim()).filter(|s| !s.is_empty())
}

/// Authentication, model discovery and generator construction for one
/// identity.
pub struct Gateway {
    http: reqwest::Client,
    oauth: Arc<dyn DeviceOAuthClient>,
    tokens: Arc<TokenManager>,
    catalog: Arc<ModelCatalog>,
    suppress_browser: bool,
    fetch_options: ModelFetchOptions,
}

impl Gateway {
    pub fn new(http: reqwest::Client, oauth: Arc<dyn DeviceOAuthClient>, store: CredentialStore) -> Self {
        let tokens = Arc::new(TokenManager::new(oauth.clone(), store));
        Self {
            http,
            oauth,
            tokens,
            catalog: Arc::new(ModelCatalog::new()),
            suppress_browser: false,
            fetch_options: ModelFetchOptions::default(),
        }
    }

    /// Builds the HTTP client, OAuth client and credential store from the
    /// settings file.
    pub fn from_config(config: &Config) -> Result<Self, FactoryError> {
        let mut builder = reqwest::Client::builder().user_agent(user_agent());
        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let http = builder.build()?;
        let oauth = Arc::new(HttpOAuthClient::new(http.clone(), config.oauth.client_config()));
        let store = CredentialStore::default_location()?;
        Ok(Self::new(http, oauth, store).with_suppress_browser(config.oauth.suppress_browser))
    }

    pub fn with_suppress_browser(mut self, suppress: bool) -> Self {
        self.suppress_browser = suppress;
        self
    }

    pub fn with_fetch_options(mut self, options: ModelFetchOptions) -> Self {
        self.fetch_options = options;
        self
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    /// Returns valid credentials, running the device flow when none can be
    /// loaded or refreshed. With `require_cached` the flow is never started.
    pub async fn authenticate(
        &self,
        session: &AuthSession,
        require_cached: bool,
    ) -> Result<Credentials, FactoryError> {
        match self.tokens.get_valid_credentials(false).await {
            Ok(credentials) => return Ok(credentials),
            Err(e) => debug!("No usable cached credentials ({}): {}", e.kind, e),
        }

        if require_cached {
            return Err(FactoryError::NoCachedCredentials);
        }

        info!("Starting device authorization");
        let authenticator = DeviceFlowAuthenticator::new(self.oauth.clone(), self.tokens.clone())
            .with_suppress_browser(self.suppress_browser);
        Ok(authenticator.authenticate(session).await?)
    }

    /// Runs model discovery and records the outcome in the catalog.
    pub async fn refresh_models(&self) -> ModelFetchResult {
        let result = fetch_models(&self.tokens, &self.http, &self.fetch_options).await;
        self.catalog.record(AuthType::DingtalkOAuth, &result);
        result
    }

    /// Builds the generator for `config.auth_type`.
    ///
    /// `initial_auth` requires cached credentials instead of prompting.
    pub async fn create_content_generator(
        &self,
        mut config: ContentGeneratorConfig,
        session: &AuthSession,
        initial_auth: bool,
    ) -> Result<Box<dyn ContentGenerator>, FactoryError> {
        match config.auth_type {
            AuthType::OpenAi => {
                let api_key = config
                    .api_key
                    .as_ref()
                    .filter(|k| !k.expose_secret().is_empty())
                    .ok_or(FactoryError::MissingApiKey)?;
                let generator = OpenAiGenerator::new(
                    config
                        .base_url
                        .clone()
                        .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
                    api_key.expose_secret().clone(),
                    config.model.clone(),
                    config.sampling_params.clone(),
                    &config.transport_options(),
                )?;
                Ok(Box::new(generator))
            }
            AuthType::DingtalkOAuth => {
                self.authenticate(session, initial_auth).await?;

                let result = self.refresh_models().await;
                match (result.success, result.error) {
                    (true, _) => {
                        if is_placeholder_model(&config.model)
                            && let Some(first) = result.models.first()
                        {
                            debug!("Selecting discovered model {}", first);
                            config.model = first.clone();
                        }
                    }
                    (false, error) => {
                        let error = error.unwrap_or_else(|| ModelFetchError {
                            code: ModelFetchErrorCode::NetworkError,
                            message: "unknown error".to_string(),
                        });
                        if is_placeholder_model(&config.model) {
                            return Err(FactoryError::ModelDiscovery(error));
                        }
                        warn!(
                            "Using configured model \"{}\" despite fetch error: {}",
                            config.model, error.message
                        );
                    }
                }

                let generator = CredentialedGenerator::from_config(&config, self.tokens.clone())?;
                Ok(Box::new(generator))
            }
        }
    }

    /// Deletes stored credentials and drops the token cache.
    pub fn logout(&self) -> Result<(), FactoryError> {
        self.tokens.clear_persisted()?;
        info!("Logged out, removed {}", self.tokens.store().path().display());
        Ok(())
    }
}
