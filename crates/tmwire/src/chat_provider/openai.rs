//! OpenAI-compatible transport.
//!
//! [`OpenAiTransport`] speaks the chat-completion and embeddings endpoints of
//! any OpenAI-compatible server. It does not own credentials: every call takes
//! the [`Endpoint`] to use, so a caller can swap tokens between attempts.
//! [`OpenAiGenerator`] pairs the transport with a fixed endpoint for static
//! API keys.
//!
//! # Example
//!
//! ```rust,no_run
//! use tmwire::{Content, ContentGenerator, GenerateContentRequest, OpenAiGenerator, TransportOptions};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let generator = OpenAiGenerator::new(
//!     "https://api.openai.com/v1",
//!     "your-api-key",
//!     "gpt-4o",
//!     Default::default(),
//!     &TransportOptions::default(),
//! )?;
//!
//! let request = GenerateContentRequest::new("gpt-4o", vec![Content::user("Hello!")]);
//! let mut stream = generator.generate_content_stream(request).await?;
//! while let Some(chunk) = stream.next().await {
//!     print!("{}", chunk?.text());
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Serialize;
use tracing::{debug, warn};

use super::{ChatError, ContentGenerator, Endpoint, ResponseStream};
use crate::content::{
    Candidate, Content, ContentRole, CountTokensRequest, CountTokensResponse, EmbedContentRequest,
    EmbedContentResponse, GenerateContentRequest, GenerateContentResponse, Part, SamplingParams,
};
use crate::converter::OpenAiConverter;
use crate::converter::types::{
    ChatCompletionChunk, ChatCompletionResponse, EmbeddingRequest, EmbeddingResponse,
};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Whole-request timeout. `None` disables it.
    pub timeout: Option<Duration>,
    /// Extra attempts after a retryable failure.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt up to one minute.
    pub retry_backoff: Duration,
    /// Proxy URL for all traffic.
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(120)),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            proxy: None,
            user_agent: format!("tmwire/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Chat-completion and embedding calls against an OpenAI-compatible API.
#[derive(Debug, Clone)]
pub struct OpenAiTransport {
    client: reqwest::Client,
    model: String,
    sampling: SamplingParams,
    max_retries: u32,
    retry_backoff: Duration,
}

impl OpenAiTransport {
    /// Creates a transport for `model`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Config`] if the proxy URL is invalid or the HTTP
    /// client cannot be created.
    pub fn new(
        model: impl Into<String>,
        sampling: SamplingParams,
        options: &TransportOptions,
    ) -> Result<Self, ChatError> {
        let mut builder = reqwest::Client::builder().user_agent(&options.user_agent);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(proxy) = options.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| ChatError::Config(format!("Invalid proxy URL: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| ChatError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            model: model.into(),
            sampling,
            max_retries: options.max_retries,
            retry_backoff: options.retry_backoff,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn converter(&self) -> OpenAiConverter {
        OpenAiConverter::new(self.model.clone()).with_sampling(self.sampling.clone())
    }

    fn build_headers(&self, endpoint: &Endpoint) -> Result<HeaderMap, ChatError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", endpoint.api_key))
                .map_err(|e| ChatError::Config(format!("Invalid API key: {}", e)))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF)
    }

    /// Posts `body` and returns the successful response, retrying
    /// rate limits, server errors and connection failures.
    async fn post<B: Serialize + ?Sized>(
        &self,
        endpoint: &Endpoint,
        path: &str,
        body: &B,
        headers: HeaderMap,
    ) -> Result<reqwest::Response, ChatError> {
        let url = endpoint.url(path);
        let mut attempt = 0;
        loop {
            let err = match self
                .client
                .post(&url)
                .headers(headers.clone())
                .json(body)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => api_error(response).await,
                Err(e) => ChatError::Request(e),
            };

            if attempt >= self.max_retries || !err.is_retryable() {
                return Err(err);
            }
            let delay = self.backoff(attempt);
            attempt += 1;
            warn!(
                "Request to {} failed ({}), retrying in {:?} ({}/{})",
                path, err, delay, attempt, self.max_retries
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Sends a chat completion and returns the whole response.
    ///
    /// A request that asks for streaming is streamed on the wire and the
    /// chunks are folded into one response.
    pub async fn generate(
        &self,
        endpoint: &Endpoint,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ChatError> {
        if request.stream_or(false) {
            let chunks = self.open_stream(endpoint, request).await?.try_collect::<Vec<_>>().await?;
            return Ok(merge_chunks(chunks));
        }
        self.complete(endpoint, request).await
    }

    /// Sends a chat completion and returns the converted chunks.
    ///
    /// A request with `stream` set to false is sent as a plain completion and
    /// yields a single chunk.
    pub async fn generate_stream(
        &self,
        endpoint: &Endpoint,
        request: &GenerateContentRequest,
    ) -> Result<ResponseStream, ChatError> {
        if !request.stream_or(true) {
            let response = self.complete(endpoint, request).await?;
            return Ok(Box::pin(futures::stream::iter([Ok(response)])));
        }
        self.open_stream(endpoint, request).await
    }

    async fn complete(
        &self,
        endpoint: &Endpoint,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ChatError> {
        let converter = self.converter();
        let body = converter.to_openai_request(request, false);
        debug!("Sending chat completion for model {}", body.model);

        let response = self
            .post(endpoint, "chat/completions", &body, self.build_headers(endpoint)?)
            .await?;
        let text = response.text().await?;
        let completion: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| ChatError::Parse(format!("Failed to parse completion: {}", e)))?;
        Ok(converter.from_openai_response(completion))
    }

    async fn open_stream(
        &self,
        endpoint: &Endpoint,
        request: &GenerateContentRequest,
    ) -> Result<ResponseStream, ChatError> {
        let mut converter = self.converter();
        converter.reset_streaming_tool_calls();
        let body = converter.to_openai_request(request, true);
        debug!("Opening chat completion stream for model {}", body.model);

        let mut headers = self.build_headers(endpoint)?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        let response = self.post(endpoint, "chat/completions", &body, headers).await?;

        Ok(Box::pin(process_stream(
            Box::pin(response.bytes_stream()),
            converter,
        )))
    }

    /// Computes embeddings, one vector per content entry.
    pub async fn embed(
        &self,
        endpoint: &Endpoint,
        request: &EmbedContentRequest,
    ) -> Result<EmbedContentResponse, ChatError> {
        let body = EmbeddingRequest {
            model: if request.model.is_empty() {
                self.model.clone()
            } else {
                request.model.clone()
            },
            input: request.contents.iter().map(|c| c.text()).collect(),
        };

        let response = self
            .post(endpoint, "embeddings", &body, self.build_headers(endpoint)?)
            .await?;
        let mut parsed: EmbeddingResponse = response.json().await?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(EmbedContentResponse {
            embeddings: parsed.data.into_iter().map(|d| d.embedding).collect(),
        })
    }

    /// Estimates tokens locally at roughly four characters per token.
    pub fn count_tokens(&self, request: &CountTokensRequest) -> CountTokensResponse {
        let chars: usize = request
            .contents
            .iter()
            .flat_map(|c| c.parts.iter())
            .map(|part| match part {
                Part::Text { text } => text.chars().count(),
                Part::Thought { thought } => thought.chars().count(),
                Part::FunctionCall { function_call } => {
                    function_call.name.len() + function_call.args.to_string().len()
                }
                Part::FunctionResponse { function_response } => {
                    function_response.name.len()
                        + serde_json::Value::Object(function_response.response.clone())
                            .to_string()
                            .len()
                }
            })
            .sum();
        CountTokensResponse {
            total_tokens: u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX),
        }
    }
}

/// Builds an [`ChatError::Api`] from a failed response, preferring the
/// provider's `error.message` over the raw body.
async fn api_error(response: reqwest::Response) -> ChatError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(str::to_owned))
        })
        .unwrap_or(body);
    ChatError::Api { status, message }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into SSE `data:` payloads. Lines may straddle
/// network chunks.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest)).into_iter().collect()
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim();
    // Blank separators and comments
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(data.to_string()))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

struct StreamState {
    bytes: ByteStream,
    decoder: SseDecoder,
    converter: OpenAiConverter,
    pending: VecDeque<Result<GenerateContentResponse, ChatError>>,
    finished: bool,
}

impl StreamState {
    fn handle(&mut self, events: Vec<SseEvent>) {
        for event in events {
            if self.finished {
                return;
            }
            match event {
                SseEvent::Done => self.finished = true,
                SseEvent::Data(data) => match serde_json::from_str::<ChatCompletionChunk>(&data) {
                    Ok(chunk) => {
                        let response = self.converter.from_openai_chunk(chunk);
                        if !response.candidates.is_empty()
                            || response.usage_metadata.is_some()
                            || response.reasoning_content.is_some()
                        {
                            self.pending.push_back(Ok(response));
                        }
                    }
                    Err(e) => self.pending.push_back(Err(ChatError::Parse(format!(
                        "Failed to parse chunk: {} - {}",
                        e, data
                    )))),
                },
            }
        }
    }
}

/// Folds streamed chunks into a single first-candidate response.
fn merge_chunks(chunks: Vec<GenerateContentResponse>) -> GenerateContentResponse {
    let mut merged = GenerateContentResponse::default();
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut parts = Vec::new();
    let mut finish_reason = None;

    for chunk in chunks {
        merged.response_id = merged.response_id.or(chunk.response_id);
        merged.model_version = merged.model_version.or(chunk.model_version);
        if chunk.usage_metadata.is_some() {
            merged.usage_metadata = chunk.usage_metadata;
        }
        if let Some(r) = chunk.reasoning_content {
            reasoning.push_str(&r);
        }
        for candidate in chunk.candidates.into_iter().filter(|c| c.index == 0) {
            if candidate.finish_reason.is_some() {
                finish_reason = candidate.finish_reason;
            }
            for part in candidate.content.parts {
                match part {
                    Part::Text { text: t } => text.push_str(&t),
                    other => parts.push(other),
                }
            }
        }
    }

    if !text.is_empty() {
        parts.insert(0, Part::text(text));
    }
    merged.reasoning_content = (!reasoning.is_empty()).then_some(reasoning);
    merged.candidates = vec![Candidate {
        index: 0,
        content: Content {
            role: ContentRole::Model,
            parts,
        },
        finish_reason,
    }];
    merged
}

/// Decodes the SSE body into converted response chunks.
fn process_stream(
    bytes: ByteStream,
    converter: OpenAiConverter,
) -> impl Stream<Item = Result<GenerateContentResponse, ChatError>> + Send + 'static {
    let state = StreamState {
        bytes,
        decoder: SseDecoder::default(),
        converter,
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.feed(&chunk);
                    state.handle(events);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.push_back(Err(ChatError::Request(e)));
                }
                None => {
                    let events = state.decoder.finish();
                    state.handle(events);
                    state.finished = true;
                }
            }
        }
    })
}

/// A generator bound to one endpoint and a static API key.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    transport: OpenAiTransport,
    endpoint: Endpoint,
}

impl OpenAiGenerator {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        sampling: SamplingParams,
        options: &TransportOptions,
    ) -> Result<Self, ChatError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(ChatError::Config("API key is empty".to_string()));
        }
        Ok(Self {
            transport: OpenAiTransport::new(model, sampling, options)?,
            endpoint: Endpoint::new(base_url, api_key),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.endpoint.base_url
    }
}

#[async_trait]
impl ContentGenerator for OpenAiGenerator {
    async fn generate_content(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ChatError> {
        self.transport.generate(&self.endpoint, &request).await
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ResponseStream, ChatError> {
        self.transport.generate_stream(&self.endpoint, &request).await
    }

    async fn count_tokens(&self, request: CountTokensRequest) -> Result<CountTokensResponse, ChatError> {
        Ok(self.transport.count_tokens(&request))
    }

    async fn embed_content(
        &self,
        request: EmbedContentRequest,
    ) -> Result<EmbedContentResponse, ChatError> {
        self.transport.embed(&self.endpoint, &request).await
    }

    fn model_name(&self) -> &str {
        self.transport.model()
    }
}
