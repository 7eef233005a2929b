//! Generator for device-flow identities.
//!
//! Every call fetches a valid token from the shared [`TokenManager`], points
//! the OpenAI-compatible transport at the identity's resource URL, and
//! retries exactly once after a forced refresh when the server rejects the
//! token.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tmwire::{
    ChatError, ContentGenerator, CountTokensRequest, CountTokensResponse, EmbedContentRequest,
    EmbedContentResponse, Endpoint, GenerateContentRequest, GenerateContentResponse,
    OpenAiTransport, ResponseStream,
};
use tracing::{debug, warn};

use crate::auth::{TokenManager, is_auth_chat_error};
use crate::config::{ContentGeneratorConfig, DEFAULT_DINGTALK_BASE_URL};

/// Model prefixes that reason harder by default.
const HIGH_REASONING_PREFIXES: &[&str] = &["doubao-seed-1.6"];

/// Chat endpoint for a credential's resource URL, else `fallback`.
pub fn endpoint_for(resource_url: Option<&str>, fallback: &str) -> String {
    let base = resource_url
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .unwrap_or(fallback);
    let base = if base.starts_with("http") {
        base.to_string()
    } else {
        format!("https://{}", base)
    };
    let base = base.trim_end_matches('/');
    if base.ends_with("/v1") {
        base.to_string()
    } else {
        format!("{}/v1", base)
    }
}

/// Keeps a flag in sync between the top level and the nested config. The
/// top-level value wins when both are set.
fn mirror<T: Clone>(top: &mut Option<T>, nested: &mut Option<T>) {
    match (top.as_ref(), nested.as_ref()) {
        (Some(value), _) => *nested = Some(value.clone()),
        (None, Some(value)) => *top = Some(value.clone()),
        (None, None) => {}
    }
}

/// Fills in streaming and reasoning defaults for `model`.
pub fn apply_request_defaults(mut request: GenerateContentRequest, model: &str) -> GenerateContentRequest {
    let config = &mut request.config;

    mirror(&mut request.stream, &mut config.stream);
    if request.stream.is_none() {
        request.stream = Some(true);
        config.stream = Some(true);
    }

    mirror(&mut request.reasoning_effort, &mut config.reasoning_effort);
    if request.reasoning_effort.is_none()
        && HIGH_REASONING_PREFIXES.iter().any(|p| model.starts_with(p))
    {
        request.reasoning_effort = Some("high".to_string());
        config.reasoning_effort = Some("high".to_string());
    }

    mirror(&mut request.thinking_type, &mut config.thinking_type);
    request
}

/// An OpenAI-compatible generator authenticated by the device flow.
pub struct CredentialedGenerator {
    transport: OpenAiTransport,
    tokens: Arc<TokenManager>,
    /// Used when the credentials carry no resource URL.
    base_url: String,
    installed: Mutex<Option<Endpoint>>,
}

impl CredentialedGenerator {
    pub fn new(transport: OpenAiTransport, tokens: Arc<TokenManager>) -> Self {
        Self {
            transport,
            tokens,
            base_url: DEFAULT_DINGTALK_BASE_URL.to_string(),
            installed: Mutex::new(None),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn from_config(config: &ContentGeneratorConfig, tokens: Arc<TokenManager>) -> Result<Self, ChatError> {
        let transport = OpenAiTransport::new(
            config.model.clone(),
            config.sampling_params.clone(),
            &config.transport_options(),
        )?;
        let generator = Self::new(transport, tokens);
        Ok(match config.base_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(base_url) => generator.with_base_url(base_url),
            None => generator,
        })
    }

    fn installed(&self) -> MutexGuard<'_, Option<Endpoint>> {
        self.installed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The endpoint used by the most recent call.
    pub fn installed_endpoint(&self) -> Option<Endpoint> {
        self.installed().clone()
    }

    /// Token of the last call, else whatever the manager has cached.
    pub fn current_token(&self) -> Option<String> {
        if let Some(endpoint) = self.installed().as_ref() {
            return Some(endpoint.api_key.clone());
        }
        self.tokens
            .get_current_credentials()
            .and_then(|c| c.access_token().map(str::to_string))
    }

    pub fn clear_token(&self) {
        *self.installed() = None;
        self.tokens.clear_cache();
    }

    async fn acquire_endpoint(&self, force_refresh: bool) -> Result<Endpoint, ChatError> {
        let credentials = self
            .tokens
            .get_valid_credentials(force_refresh)
            .await
            .map_err(|e| ChatError::Credentials(format!("{} ({})", e, e.kind)))?;
        let token = credentials
            .access_token()
            .ok_or_else(|| ChatError::Credentials("No access token available".to_string()))?;

        let endpoint = Endpoint::new(endpoint_for(credentials.resource_url.as_deref(), &self.base_url), token);
        *self.installed() = Some(endpoint.clone());
        Ok(endpoint)
    }

    /// Runs `operation` with fresh credentials, retrying once after a forced
    /// refresh if the server rejects them.
    async fn with_credentials<T, F, Fut>(&self, operation: F) -> Result<T, ChatError>
    where
        F: Fn(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, ChatError>>,
    {
        let endpoint = self.acquire_endpoint(false).await?;
        match operation(endpoint).await {
            Err(e) if is_auth_chat_error(&e) => {
                warn!("Request was not authorized, refreshing credentials: {}", e);
                self.tokens.clear_cache();
                let endpoint = self.acquire_endpoint(true).await?;
                debug!("Retrying request with refreshed credentials");
                operation(endpoint).await
            }
            other => other,
        }
    }

    fn prepare(&self, request: GenerateContentRequest) -> GenerateContentRequest {
        let model = if request.model.is_empty() {
            self.transport.model().to_string()
        } else {
            request.model.clone()
        };
        apply_request_defaults(request, &model)
    }
}

#[async_trait]
impl ContentGenerator for CredentialedGenerator {
    async fn generate_content(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ChatError> {
        let request = &self.prepare(request);
        self.with_credentials(|endpoint| async move { self.transport.generate(&endpoint, request).await })
            .await
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ResponseStream, ChatError> {
        let request = &self.prepare(request);
        self.with_credentials(|endpoint| async move {
            self.transport.generate_stream(&endpoint, request).await
        })
        .await
    }

    async fn count_tokens(&self, request: CountTokensRequest) -> Result<CountTokensResponse, ChatError> {
        Ok(self.transport.count_tokens(&request))
    }

    async fn embed_content(
        &self,
        request: EmbedContentRequest,
    ) -> Result<EmbedContentResponse, ChatError> {
        let request = &request;
        self.with_credentials(|endpoint| async move { self.transport.embed(&endpoint, request).await })
            .await
    }

    fn model_name(&self) -> &str {
        self.transport.model()
    }
}
