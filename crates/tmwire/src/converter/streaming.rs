//! Accumulation of fragmented tool calls in streamed responses.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::content::FunctionCall;

#[derive(Debug, Clone, Default, PartialEq)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Collects tool-call fragments keyed by their index in the choice.
///
/// Providers send the id and function name once, usually in the first
/// fragment for an index, and then stream the JSON arguments in pieces.
#[derive(Debug, Default)]
pub struct StreamingToolCallBuffer {
    calls: BTreeMap<u32, PendingToolCall>,
}

impl StreamingToolCallBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an argument fragment for `index`. The first non-empty id and
    /// name seen for an index are kept.
    pub fn add_chunk(&mut self, index: u32, fragment: &str, id: Option<&str>, name: Option<&str>) {
        let entry = self.calls.entry(index).or_default();
        if entry.id.is_none() {
            entry.id = id.filter(|s| !s.is_empty()).map(str::to_owned);
        }
        if entry.name.is_none() {
            entry.name = name.filter(|s| !s.is_empty()).map(str::to_owned);
        }
        entry.arguments.push_str(fragment);
    }

    /// Argument text accumulated so far for `index`; empty when unknown.
    pub fn get_buffer(&self, index: u32) -> &str {
        self.calls
            .get(&index)
            .map(|c| c.arguments.as_str())
            .unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drops everything. Safe to call any number of times.
    pub fn reset(&mut self) {
        self.calls.clear();
    }

    /// Drains the buffer into function calls, ordered by index.
    ///
    /// Entries without a function name are dropped. Arguments that are empty
    /// or not valid JSON become an empty object.
    pub fn take_completed(&mut self) -> Vec<FunctionCall> {
        std::mem::take(&mut self.calls)
            .into_values()
            .filter_map(|pending| {
                let name = pending.name?;
                Some(FunctionCall {
                    id: pending.id,
                    name,
                    args: parse_arguments(&pending.arguments),
                })
            })
            .collect()
    }
}

/// Parses tool-call arguments, falling back to an empty object.
pub(crate) fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Discarding malformed tool call arguments: {}", e);
            Value::Object(Default::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fragments_accumulate_per_index() {
        let mut buffer = StreamingToolCallBuffer::new();
        buffer.add_chunk(0, "{\"pa", Some("call_1"), Some("read_file"));
        buffer.add_chunk(1, "{}", Some("call_2"), Some("list_dir"));
        buffer.add_chunk(0, "th\": \"a.rs\"}", None, None);

        assert_eq!(buffer.get_buffer(0), "{\"path\": \"a.rs\"}");
        assert_eq!(buffer.get_buffer(1), "{}");
        assert_eq!(buffer.get_buffer(2), "");
    }

    #[test]
    fn test_id_and_name_from_first_introduction() {
        let mut buffer = StreamingToolCallBuffer::new();
        buffer.add_chunk(0, "", None, None);
        buffer.add_chunk(0, "{}", Some("call_9"), Some("grep"));
        buffer.add_chunk(0, "", Some("late"), Some("other"));

        let calls = buffer.take_completed();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id.as_deref(), Some("call_9"));
        assert_eq!(calls[0].name, "grep");
    }

    #[test]
    fn test_take_completed_orders_and_clears() {
        let mut buffer = StreamingToolCallBuffer::new();
        buffer.add_chunk(1, "{\"b\":2}", Some("c2"), Some("second"));
        buffer.add_chunk(0, "{\"a\":1}", Some("c1"), Some("first"));
        buffer.add_chunk(2, "not json", Some("c3"), Some("third"));

        let calls = buffer.take_completed();
        assert_eq!(calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), ["first", "second", "third"]);
        assert_eq!(calls[0].args, json!({"a": 1}));
        assert_eq!(calls[2].args, json!({}));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut buffer = StreamingToolCallBuffer::new();
        buffer.reset();
        buffer.add_chunk(0, "{\"arg\": \"value\"}", Some("test-id"), Some("test-function"));
        buffer.reset();
        buffer.reset();
        assert_eq!(buffer.get_buffer(0), "");
        assert!(buffer.is_empty());
    }
}
