//! Normalization of `reasoning_content` payloads.
//!
//! Reasoning-capable providers disagree on the shape of the field: some send
//! a plain string, some an array of `{text}` items, some an object with a
//! `content` array and a `summary`. Everything is folded into one string.

use serde_json::Value;

/// The recognized shapes of a `reasoning_content` value.
#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningContent {
    /// A plain string, or an object whose `text` field is a string.
    Text(String),
    /// An array of fragments.
    Items(Vec<Value>),
    /// An object with a `content` array and an optional `summary`.
    Nested {
        content: Vec<Value>,
        summary: Option<String>,
    },
    /// Anything else that is not empty. Rendered as JSON.
    Other(Value),
}

impl ReasoningContent {
    /// Classifies a raw value. `null`, empty strings, empty arrays and empty
    /// objects yield `None`.
    pub fn classify(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Array(items) if items.is_empty() => None,
            Value::Array(items) => Some(Self::Items(items.clone())),
            Value::Object(map) if map.is_empty() => None,
            Value::Object(map) => {
                if let Some(Value::Array(content)) = map.get("content") {
                    return Some(Self::Nested {
                        content: content.clone(),
                        summary: map.get("summary").and_then(Value::as_str).map(str::to_owned),
                    });
                }
                if let Some(Value::String(text)) = map.get("text") {
                    return Some(Self::Text(text.clone()));
                }
                Some(Self::Other(value.clone()))
            }
            other => Some(Self::Other(other.clone())),
        }
    }

    /// Renders the canonical text.
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Items(items) => join_items(&items),
            Self::Nested { content, summary } => {
                let mut text = join_items(&content);
                if let Some(summary) = summary {
                    text.push_str(&summary);
                }
                text
            }
            Self::Other(value) => value.to_string(),
        }
    }
}

fn item_text(item: &Value) -> Option<&str> {
    match item {
        Value::String(s) => Some(s),
        Value::Object(map) => map
            .get("text")
            .and_then(Value::as_str)
            .or_else(|| map.get("content").and_then(Value::as_str)),
        _ => None,
    }
}

fn join_items(items: &[Value]) -> String {
    items.iter().filter_map(item_text).collect()
}

/// Normalizes an optional raw payload into reasoning text.
///
/// Returns `None` when the payload is missing, empty or renders to an empty
/// string.
pub fn normalize_reasoning(value: Option<&Value>) -> Option<String> {
    let text = ReasoningContent::classify(value?)?.into_text();
    if text.is_empty() { None } else { Some(text) }
}
