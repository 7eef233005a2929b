//! # tmwire
//!
//! The wire layer of tmcli.
//!
//! This crate owns the internal chat-completion representation, the
//! [`ContentGenerator`] trait that every backend implements, and the
//! translation to and from the OpenAI chat-completion format.
//!
//! ## Features
//!
//! - **Content model** - role-tagged turns made of text, reasoning and tool parts
//! - **Protocol conversion** - requests, responses and streamed chunks
//! - **Streaming tool calls** - argument fragments reassembled per call index
//! - **Reasoning normalization** - every `reasoning_content` shape becomes one string
//! - **OpenAI-compatible transport** - retries, SSE decoding, embeddings
//!
//! ## Example
//!
//! ```rust,no_run
//! use tmwire::{Content, ContentGenerator, GenerateContentRequest, OpenAiGenerator, TransportOptions};
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
//! let request = GenerateContentRequest::new("gpt-4o", vec![Content::user("Hello, how are you?")]);
//! let response = generator.generate_content(request).await?;
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```

pub mod chat_provider;
pub mod content;
pub mod converter;

// Re-export main types for convenience
pub use chat_provider::{
    ChatError, ContentGenerator, Endpoint, OpenAiGenerator, OpenAiTransport, ResponseStream,
    TransportOptions,
};
pub use content::{
    Candidate, Content, ContentRole, CountTokensRequest, CountTokensResponse,
    EmbedContentRequest, EmbedContentResponse, FinishReason, FunctionCall, FunctionDeclaration,
    FunctionResponse, GenerateContentConfig, GenerateContentRequest, GenerateContentResponse,
    Part, SamplingParams, UsageMetadata,
};
pub use converter::{OpenAiConverter, ReasoningContent, StreamingToolCallBuffer, normalize_reasoning};

// Re-export async_trait for users implementing custom generators
pub use async_trait::async_trait;
