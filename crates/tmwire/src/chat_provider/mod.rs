//! Content generator abstractions.
//!
//! This module defines the [`ContentGenerator`] trait every backend
//! implements, the [`ChatError`] type shared by all of them, and the
//! [`Endpoint`] a request is sent to.

use crate::content::{
    CountTokensRequest, CountTokensResponse, EmbedContentRequest, EmbedContentResponse,
    GenerateContentRequest, GenerateContentResponse,
};
use async_trait::async_trait;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during generation.
#[derive(Error, Debug)]
pub enum ChatError {
    /// An error occurred while making the HTTP request.
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// An error occurred while parsing the response.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// The API returned an error response.
    #[error("API error ({status}): {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The error message from the API.
        message: String,
    },

    /// An error occurred while serializing/deserializing JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The stream ended unexpectedly.
    #[error("Stream ended unexpectedly")]
    StreamEnded,

    /// An invalid configuration was provided.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Valid credentials could not be obtained for the request.
    #[error("Failed to obtain valid credentials: {0}")]
    Credentials(String),

    /// A generic error with a message.
    #[error("{0}")]
    Other(String),
}

impl ChatError {
    /// HTTP status associated with the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ChatError::Api { status, .. } => Some(*status),
            ChatError::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether another attempt could plausibly succeed: rate limits, server
    /// errors and connection failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::Api { status, .. } => *status == 429 || *status >= 500,
            ChatError::Request(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.status().is_some_and(|s| s.as_u16() == 429 || s.is_server_error())
            }
            _ => false,
        }
    }
}

/// A stream of generated response chunks.
pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<GenerateContentResponse, ChatError>> + Send>>;

/// Where requests go and how they are authorized.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Base URL ending in the API version, e.g. `https://host/v1`.
    pub base_url: String,
    /// Bearer token sent with every request.
    pub api_key: String,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Joins `path` onto the base URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// The core trait for generation backends.
///
/// All methods are thread-safe (Send + Sync).
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Generates a complete response.
    async fn generate_content(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ChatError>;

    /// Generates a streaming response.
    ///
    /// ```rust,ignore
    /// use futures::StreamExt;
    ///
    /// let mut stream = generator.generate_content_stream(request).await?;
    /// while let Some(chunk) = stream.next().await {
    ///     print!("{}", chunk?.text());
    /// }
    /// ```
    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ResponseStream, ChatError>;

    /// Counts the tokens `request` would consume.
    async fn count_tokens(&self, request: CountTokensRequest) -> Result<CountTokensResponse, ChatError>;

    /// Computes embeddings for each content entry.
    async fn embed_content(
        &self,
        request: EmbedContentRequest,
    ) -> Result<EmbedContentResponse, ChatError>;

    /// Model this generator sends requests for.
    fn model_name(&self) -> &str;
}

pub mod openai;

pub use openai::{OpenAiGenerator, OpenAiTransport, TransportOptions};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_join() {
        let endpoint = Endpoint::new("https://example.com/v1/", "key");
        assert_eq!(endpoint.url("/chat/completions"), "https://example.com/v1/chat/completions");
        assert_eq!(endpoint.url("embeddings"), "https://example.com/v1/embeddings");
    }

    #[test]
    fn test_endpoint_debug_redacts_key() {
        let endpoint = Endpoint::new("https://example.com/v1", "sk-secret");
        assert!(!format!("{endpoint:?}").contains("sk-secret"));
    }

    #[test]
    fn test_error_status_and_retryable() {
        let rate_limited = ChatError::Api {
            status: 429,
            message: "slow down".into(),
        };
        assert_eq!(rate_limited.status(), Some(429));
        assert!(rate_limited.is_retryable());

        let unauthorized = ChatError::Api {
            status: 401,
            message: "bad key".into(),
        };
        assert!(!unauthorized.is_retryable());
        assert!(!ChatError::Credentials("no refresh token".into()).is_retryable());
        assert_eq!(ChatError::StreamEnded.status(), None);
    }
}
