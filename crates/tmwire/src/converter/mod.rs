//! Translation between the internal content model and the OpenAI
//! chat-completion wire format.
//!
//! A converter is owned by one request or one stream. Streamed tool calls are
//! buffered per converter, so reusing one across concurrent streams would mix
//! their fragments.

mod reasoning;
mod streaming;
pub mod types;

pub use reasoning::{ReasoningContent, normalize_reasoning};
pub use streaming::StreamingToolCallBuffer;

use serde_json::Value;

use crate::content::{
    Candidate, Content, ContentRole, FinishReason, FunctionCall, FunctionDeclaration,
    FunctionResponse, GenerateContentRequest, GenerateContentResponse, Part, SamplingParams,
    UsageMetadata,
};
use streaming::parse_arguments;
use types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    FunctionDefinition, StreamOptions, ToolCall, ToolCallFunction, ToolDefinition, Usage,
};

/// Converts requests and responses for one model.
#[derive(Debug)]
pub struct OpenAiConverter {
    model: String,
    sampling: SamplingParams,
    tool_calls: StreamingToolCallBuffer,
}

impl OpenAiConverter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            sampling: SamplingParams::default(),
            tool_calls: StreamingToolCallBuffer::new(),
        }
    }

    /// Sets the configured sampling parameters. Values present on a request
    /// take precedence over these.
    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Clears any partially received tool calls.
    pub fn reset_streaming_tool_calls(&mut self) {
        self.tool_calls.reset();
    }

    /// Builds the `messages` array for a request.
    pub fn to_openai_messages(&self, request: &GenerateContentRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::new();

        if let Some(system) = request
            .config
            .system_instruction
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            messages.push(ChatMessage::System {
                content: system.to_string(),
            });
        }

        // Ids synthesized for calls that arrived without one, by function name.
        let mut synthesized: Vec<(String, String)> = Vec::new();
        for content in &request.contents {
            match content.role {
                ContentRole::Model => {
                    synthesized.clear();
                    if let Some(message) = assistant_message(content, &mut synthesized) {
                        messages.push(message);
                    }
                }
                ContentRole::User => push_user_messages(content, &mut messages, &mut synthesized),
            }
        }

        messages
    }

    /// Builds a complete chat-completion request body.
    pub fn to_openai_request(
        &self,
        request: &GenerateContentRequest,
        stream: bool,
    ) -> ChatCompletionRequest {
        let sampling = request.config.sampling.or(&self.sampling);
        let model = if request.model.is_empty() {
            self.model.clone()
        } else {
            request.model.clone()
        };

        ChatCompletionRequest {
            model,
            messages: self.to_openai_messages(request),
            tools: to_openai_tools(&request.config.tools),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            max_tokens: sampling.max_tokens,
            presence_penalty: sampling.presence_penalty,
            frequency_penalty: sampling.frequency_penalty,
            repetition_penalty: sampling.repetition_penalty,
            reasoning_effort: request
                .reasoning_effort
                .clone()
                .or_else(|| request.config.reasoning_effort.clone()),
            thinking_type: request
                .thinking_type
                .clone()
                .or_else(|| request.config.thinking_type.clone()),
        }
    }

    /// Converts a non-streaming response.
    pub fn from_openai_response(&self, response: ChatCompletionResponse) -> GenerateContentResponse {
        let mut reasoning = None;
        let candidates = response
            .choices
            .into_iter()
            .map(|choice| {
                let message = choice.message;
                if reasoning.is_none() {
                    reasoning = normalize_reasoning(message.reasoning_content.as_ref());
                }

                let mut parts = Vec::new();
                if let Some(text) = message.content.filter(|t| !t.is_empty()) {
                    parts.push(Part::text(text));
                }
                parts.extend(message.tool_calls.into_iter().map(|call| {
                    Part::function_call(FunctionCall {
                        id: Some(call.id),
                        name: call.function.name,
                        args: parse_arguments(&call.function.arguments),
                    })
                }));

                Candidate {
                    index: choice.index,
                    content: Content {
                        role: ContentRole::Model,
                        parts,
                    },
                    finish_reason: choice.finish_reason.as_deref().map(map_finish_reason),
                }
            })
            .collect();

        GenerateContentResponse {
            response_id: response.id,
            model_version: response.model.or_else(|| Some(self.model.clone())),
            candidates,
            usage_metadata: response.usage.map(map_usage),
            reasoning_content: reasoning,
        }
    }

    /// Converts one streamed chunk.
    ///
    /// Text and reasoning are passed through immediately. Tool-call fragments
    /// are buffered and emitted as complete function calls on the chunk that
    /// carries a finish reason.
    pub fn from_openai_chunk(&mut self, chunk: ChatCompletionChunk) -> GenerateContentResponse {
        let mut reasoning = None;
        let mut candidates = Vec::new();

        for choice in chunk.choices {
            let delta = choice.delta;
            if reasoning.is_none() {
                reasoning = normalize_reasoning(delta.reasoning_content.as_ref());
            }

            let mut parts = Vec::new();
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                parts.push(Part::text(text));
            }

            for call in delta.tool_calls {
                let function = call.function.unwrap_or_default();
                self.tool_calls.add_chunk(
                    call.index,
                    function.arguments.as_deref().unwrap_or(""),
                    call.id.as_deref(),
                    function.name.as_deref(),
                );
            }

            if choice.finish_reason.is_some() {
                parts.extend(self.tool_calls.take_completed().into_iter().map(Part::function_call));
            }

            candidates.push(Candidate {
                index: choice.index,
                content: Content {
                    role: ContentRole::Model,
                    parts,
                },
                finish_reason: choice.finish_reason.as_deref().map(map_finish_reason),
            });
        }

        GenerateContentResponse {
            response_id: chunk.id,
            model_version: chunk.model.or_else(|| Some(self.model.clone())),
            candidates,
            usage_metadata: chunk.usage.map(map_usage),
            reasoning_content: reasoning,
        }
    }
}

/// Wraps function declarations in the `{"type":"function"}` envelope.
pub fn to_openai_tools(tools: &[FunctionDeclaration]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|tool| ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: if tool.parameters.is_null() {
                    serde_json::json!({"type": "object", "properties": {}})
                } else {
                    tool.parameters.clone()
                },
            },
        })
        .collect()
}

fn assistant_message(
    content: &Content,
    synthesized: &mut Vec<(String, String)>,
) -> Option<ChatMessage> {
    let text = content.text();
    let tool_calls: Vec<ToolCall> = content
        .function_calls()
        .enumerate()
        .map(|(i, call)| ToolCall {
            id: call.id.clone().unwrap_or_else(|| {
                let id = format!("call_{i}");
                synthesized.push((call.name.clone(), id.clone()));
                id
            }),
            call_type: "function".to_string(),
            function: ToolCallFunction {
                name: call.name.clone(),
                arguments: if call.args.is_null() {
                    "{}".to_string()
                } else {
                    call.args.to_string()
                },
            },
        })
        .collect();

    if text.is_empty() && tool_calls.is_empty() {
        return None;
    }

    Some(ChatMessage::Assistant {
        content: (!text.is_empty()).then_some(text),
        tool_calls,
    })
}

fn push_user_messages(
    content: &Content,
    messages: &mut Vec<ChatMessage>,
    synthesized: &mut Vec<(String, String)>,
) {
    for part in &content.parts {
        if let Part::FunctionResponse { function_response } = part {
            let tool_call_id = match &function_response.id {
                Some(id) => id.clone(),
                None => synthesized
                    .iter()
                    .position(|(name, _)| *name == function_response.name)
                    .map(|i| synthesized.remove(i).1)
                    .unwrap_or_else(|| function_response.name.clone()),
            };
            messages.push(ChatMessage::Tool {
                tool_call_id,
                content: function_response_text(function_response),
            });
        }
    }

    let text = content.text();
    if !text.is_empty() {
        messages.push(ChatMessage::User { content: text });
    }
}

/// Tool message content: the `error` field wins, then a string `output`,
/// then the whole response serialized.
fn function_response_text(response: &FunctionResponse) -> String {
    if let Some(error) = response.response.get("error").filter(|v| !v.is_null()) {
        return match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
    }
    if let Some(Value::String(output)) = response.response.get("output") {
        return output.clone();
    }
    Value::Object(response.response.clone()).to_string()
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" | "tool_calls" | "function_call" => FinishReason::Stop,
        "length" => FinishReason::MaxTokens,
        "content_filter" => FinishReason::Safety,
        _ => FinishReason::Other,
    }
}

fn map_usage(usage: Usage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: usage.prompt_tokens,
        candidates_token_count: usage.completion_tokens,
        total_token_count: usage.total_tokens,
        cached_content_token_count: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::GenerateContentConfig;
    use serde_json::json;

    fn request_with_function_response(response: Value) -> GenerateContentRequest {
        let contents = vec![
            Content {
                role: ContentRole::Model,
                parts: vec![Part::function_call(FunctionCall {
                    id: Some("call_1".into()),
                    name: "shell".into(),
                    args: json!({}),
                })],
            },
            Content {
                role: ContentRole::User,
                parts: vec![Part::function_response(FunctionResponse {
                    id: Some("call_1".into()),
                    name: "shell".into(),
                    response: response.as_object().cloned().unwrap_or_default(),
                })],
            },
        ];
        GenerateContentRequest::new("models/test", contents)
    }

    fn tool_message_content(messages: &[ChatMessage]) -> String {
        messages
            .iter()
            .find_map(|m| match m {
                ChatMessage::Tool { content, .. } => Some(content.clone()),
                _ => None,
            })
            .expect("tool message")
    }

    #[test]
    fn test_function_response_output() {
        let converter = OpenAiConverter::new("test-model");
        let messages = converter.to_openai_messages(&request_with_function_response(
            json!({"output": "Raw output text"}),
        ));
        assert_eq!(tool_message_content(&messages), "Raw output text");
    }

    #[test]
    fn test_function_response_error_wins() {
        let converter = OpenAiConverter::new("test-model");
        let messages = converter.to_openai_messages(&request_with_function_response(
            json!({"error": "Command failed", "output": "partial"}),
        ));
        assert_eq!(tool_message_content(&messages), "Command failed");
    }

    #[test]
    fn test_function_response_structured_error() {
        let converter = OpenAiConverter::new("test-model");
        let messages = converter.to_openai_messages(&request_with_function_response(
            json!({"error": {"code": 2}}),
        ));
        assert_eq!(tool_message_content(&messages), r#"{"code":2}"#);
    }

    #[test]
    fn test_function_response_serialized_otherwise() {
        let converter = OpenAiConverter::new("test-model");
        let messages = converter.to_openai_messages(&request_with_function_response(
            json!({"data": {"value": 42}}),
        ));
        assert_eq!(tool_message_content(&messages), r#"{"data":{"value":42}}"#);
    }

    #[test]
    fn test_missing_call_ids_pair_up() {
        let mut request = request_with_function_response(json!({"output": "a"}));
        request.contents[0].parts = vec![
            Part::function_call(FunctionCall { id: None, name: "read".into(), args: json!({}) }),
            Part::function_call(FunctionCall { id: None, name: "shell".into(), args: json!({}) }),
        ];
        request.contents[1].parts = vec![
            Part::function_response(FunctionResponse {
                id: None,
                name: "shell".into(),
                response: Default::default(),
            }),
            Part::function_response(FunctionResponse {
                id: None,
                name: "read".into(),
                response: Default::default(),
            }),
        ];

        let messages = OpenAiConverter::new("test-model").to_openai_messages(&request);
        let call_ids: Vec<_> = match &messages[0] {
            ChatMessage::Assistant { tool_calls, .. } => {
                tool_calls.iter().map(|c| (c.function.name.clone(), c.id.clone())).collect()
            }
            other => panic!("unexpected message {other:?}"),
        };
        assert_eq!(call_ids, vec![("read".to_string(), "call_0".to_string()), ("shell".to_string(), "call_1".to_string())]);

        let response_ids: Vec<_> = messages[1..]
            .iter()
            .filter_map(|m| match m {
                ChatMessage::Tool { tool_call_id, .. } => Some(tool_call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(response_ids, vec!["call_1", "call_0"]);
    }

    #[test]
    fn test_message_layout() {
        let converter = OpenAiConverter::new("test-model");
        let mut request = request_with_function_response(json!({"output": "ok"}));
        request.config.system_instruction = Some("Be terse".into());
        request.contents[1].parts.push(Part::text("what next?"));

        let messages = converter.to_openai_messages(&request);
        let roles: Vec<_> = messages.iter().map(ChatMessage::role).collect();
        assert_eq!(roles, ["system", "assistant", "tool", "user"]);

        match &messages[1] {
            ChatMessage::Assistant { content, tool_calls } => {
                assert!(content.is_none());
                assert_eq!(tool_calls[0].id, "call_1");
                assert_eq!(tool_calls[0].function.arguments, "{}");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_request_sampling_overrides_configured() {
        let converter = OpenAiConverter::new("fallback").with_sampling(SamplingParams {
            temperature: Some(0.9),
            max_tokens: Some(1024),
            ..Default::default()
        });
        let request = GenerateContentRequest {
            model: String::new(),
            contents: vec![Content::user("hi")],
            config: GenerateContentConfig {
                sampling: SamplingParams {
                    temperature: Some(0.1),
                    ..Default::default()
                },
                tools: vec![FunctionDeclaration {
                    name: "read".into(),
                    description: "Read a file".into(),
                    parameters: Value::Null,
                }],
                reasoning_effort: Some("low".into()),
                ..Default::default()
            },
            reasoning_effort: Some("high".into()),
            ..Default::default()
        };

        let body = converter.to_openai_request(&request, true);
        assert_eq!(body.model, "fallback");
        assert_eq!(body.temperature, Some(0.1));
        assert_eq!(body.max_tokens, Some(1024));
        assert_eq!(body.reasoning_effort.as_deref(), Some("high"));
        assert_eq!(body.stream_options, Some(StreamOptions { include_usage: true }));

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_non_streaming_response() {
        let converter = OpenAiConverter::new("test-model");
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "resp-1",
            "model": "test-model",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "",
                    "reasoning_content": "逐步分析",
                    "tool_calls": [{
                        "id": "call_7",
                        "type": "function",
                        "function": {"name": "grep", "arguments": "{\"pattern\":\"fn\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }))
        .unwrap();

        let result = converter.from_openai_response(response);
        assert_eq!(result.reasoning_content.as_deref(), Some("逐步分析"));
        assert_eq!(result.response_id.as_deref(), Some("resp-1"));
        let calls = result.function_calls();
        assert_eq!(calls[0].name, "grep");
        assert_eq!(calls[0].args, json!({"pattern": "fn"}));
        assert_eq!(result.candidates[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(result.usage_metadata.unwrap().total_token_count, 15);
    }

    #[test]
    fn test_streaming_chunk_reasoning() {
        let mut converter = OpenAiConverter::new("test-model");
        let chunk: ChatCompletionChunk = serde_json::from_value(json!({
            "id": "chunk-1",
            "choices": [{
                "index": 0,
                "delta": {"role": "assistant", "reasoning_content": [{"text": "第一步"}, {"text": "第二步"}]},
                "finish_reason": null
            }]
        }))
        .unwrap();

        let result = converter.from_openai_chunk(chunk);
        assert_eq!(result.reasoning_content.as_deref(), Some("第一步第二步"));

        let empty: ChatCompletionChunk = serde_json::from_value(json!({
            "choices": [{"index": 0, "delta": {"reasoning_content": null}}]
        }))
        .unwrap();
        assert_eq!(converter.from_openai_chunk(empty).reasoning_content, None);
    }

    #[test]
    fn test_streaming_tool_calls_emitted_on_finish() {
        let mut converter = OpenAiConverter::new("test-model");
        let chunks = [
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "read_file", "arguments": "{\"path\":"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"src/main.rs\"}"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        ];

        let results: Vec<_> = chunks
            .into_iter()
            .map(|c| converter.from_openai_chunk(serde_json::from_value(c).unwrap()))
            .collect();

        assert!(results[0].function_calls().is_empty());
        assert!(results[1].function_calls().is_empty());
        let calls = results[2].function_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(calls[0].args, json!({"path": "src/main.rs"}));
        assert!(converter.tool_calls.is_empty());
    }

    #[test]
    fn test_reset_streaming_tool_calls() {
        let mut converter = OpenAiConverter::new("test-model");
        converter.reset_streaming_tool_calls();

        converter.tool_calls.add_chunk(0, "{\"arg\": \"value\"}", Some("test-id"), Some("test-function"));
        converter.tool_calls.add_chunk(1, "{\"arg2\": \"value2\"}", Some("test-id-2"), Some("test-function-2"));
        assert_eq!(converter.tool_calls.get_buffer(0), "{\"arg\": \"value\"}");

        converter.reset_streaming_tool_calls();
        converter.reset_streaming_tool_calls();
        assert_eq!(converter.tool_calls.get_buffer(0), "");
        assert_eq!(converter.tool_calls.get_buffer(1), "");
    }
}
