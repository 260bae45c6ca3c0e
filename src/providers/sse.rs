//! Incremental usage extraction from provider responses.
//!
//! Providers report token usage in slightly different shapes; the
//! extraction here sniffs fields rather than switching on dialect so a
//! single parser covers OpenAI chat chunks, OpenAI responses events, and
//! Anthropic message events.
//!
//! Streaming: Anthropic sends input/cache counts on `message_start` and
//! output counts on `message_delta`; OpenAI sends a single `usage` object
//! on the final data event. Observed fields are merged as they arrive.

use serde_json::Value;

use super::Usage;

/// Line-buffered parser over SSE `data:` events.
#[derive(Debug, Default)]
pub struct SseUsageParser {
    buffer: Vec<u8>,
    usage: Usage,
    saw_usage: bool,
}

impl SseUsageParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(&line);
        }
    }

    /// Usage observed so far; `None` until any usage field has been seen.
    pub fn usage(&self) -> Option<Usage> {
        self.saw_usage.then_some(self.usage)
    }

    fn handle_line(&mut self, line: &[u8]) {
        let Ok(text) = std::str::from_utf8(line) else {
            return;
        };
        let Some(data) = text.trim().strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        if let Ok(event) = serde_json::from_str::<Value>(data) {
            self.absorb(&event);
        }
    }

    fn absorb(&mut self, event: &Value) {
        for usage in usage_candidates(event) {
            self.saw_usage |= merge_usage_fields(&mut self.usage, usage);
        }
    }
}

/// Places a usage object can live in an event or response body.
fn usage_candidates(value: &Value) -> impl Iterator<Item = &Value> {
    [
        value.get("usage"),
        value.get("message").and_then(|m| m.get("usage")),
        value.get("response").and_then(|r| r.get("usage")),
    ]
    .into_iter()
    .flatten()
    .filter(|v| v.is_object())
}

/// Copy every recognized token field present in `value` into `usage`.
/// Returns whether anything was recognized.
fn merge_usage_fields(usage: &mut Usage, value: &Value) -> bool {
    let mut saw = false;

    // OpenAI chat dialect.
    if let Some(n) = value.get("prompt_tokens").and_then(Value::as_u64) {
        usage.input_tokens = n;
        saw = true;
    }
    if let Some(n) = value.get("completion_tokens").and_then(Value::as_u64) {
        usage.output_tokens = n;
        saw = true;
    }
    if let Some(n) = value
        .pointer("/prompt_tokens_details/cached_tokens")
        .and_then(Value::as_u64)
    {
        usage.cache_read_tokens = n;
        saw = true;
    }

    // OpenAI responses and Anthropic messages dialects.
    if let Some(n) = value.get("input_tokens").and_then(Value::as_u64) {
        usage.input_tokens = n;
        saw = true;
    }
    if let Some(n) = value.get("output_tokens").and_then(Value::as_u64) {
        usage.output_tokens = n;
        saw = true;
    }
    if let Some(n) = value
        .pointer("/input_tokens_details/cached_tokens")
        .and_then(Value::as_u64)
    {
        usage.cache_read_tokens = n;
        saw = true;
    }
    if let Some(n) = value.get("cache_read_input_tokens").and_then(Value::as_u64) {
        usage.cache_read_tokens = n;
        saw = true;
    }
    if let Some(n) = value
        .get("cache_creation_input_tokens")
        .and_then(Value::as_u64)
    {
        usage.cache_write_tokens = n;
        saw = true;
    }

    saw
}

/// Extract usage from a complete (unary) response body.
pub fn usage_from_body(body: &[u8]) -> Option<Usage> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let mut usage = Usage::default();
    let mut saw = false;
    for candidate in usage_candidates(&value) {
        saw |= merge_usage_fields(&mut usage, candidate);
    }
    saw.then_some(usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unary_openai_chat_body() {
        let body = br#"{"id":"chatcmpl-1","choices":[],"usage":{"prompt_tokens":1000,"completion_tokens":500,"total_tokens":1500,"prompt_tokens_details":{"cached_tokens":100}}}"#;
        let usage = usage_from_body(body).unwrap();
        assert_eq!(usage.input_tokens, 1000);
        assert_eq!(usage.output_tokens, 500);
        assert_eq!(usage.cache_read_tokens, 100);
    }

    #[test]
    fn test_unary_anthropic_body() {
        let body = br#"{"id":"msg_1","content":[],"usage":{"input_tokens":200,"output_tokens":800,"cache_read_input_tokens":50,"cache_creation_input_tokens":25}}"#;
        let usage = usage_from_body(body).unwrap();
        assert_eq!(usage.input_tokens, 200);
        assert_eq!(usage.output_tokens, 800);
        assert_eq!(usage.cache_read_tokens, 50);
        assert_eq!(usage.cache_write_tokens, 25);
    }

    #[test]
    fn test_unary_openai_responses_body() {
        let body = br#"{"id":"resp_1","output":[],"usage":{"input_tokens":40,"output_tokens":12,"input_tokens_details":{"cached_tokens":8}}}"#;
        let usage = usage_from_body(body).unwrap();
        assert_eq!(usage.input_tokens, 40);
        assert_eq!(usage.output_tokens, 12);
        assert_eq!(usage.cache_read_tokens, 8);
    }

    #[test]
    fn test_body_without_usage() {
        assert_eq!(usage_from_body(br#"{"error":{"message":"bad"}}"#), None);
        assert_eq!(usage_from_body(b"not json"), None);
    }

    #[test]
    fn test_streaming_anthropic_events_merge() {
        let mut parser = SseUsageParser::new();
        parser.feed(
            b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":200,\"cache_read_input_tokens\":0}}}\n\n",
        );
        assert_eq!(parser.usage().unwrap().input_tokens, 200);

        parser.feed(b"data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hello\"}}\n\n");
        parser
            .feed(b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":800}}\n\n");

        let usage = parser.usage().unwrap();
        assert_eq!(usage.input_tokens, 200);
        assert_eq!(usage.output_tokens, 800);
    }

    #[test]
    fn test_streaming_openai_final_chunk() {
        let mut parser = SseUsageParser::new();
        parser.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}],\"usage\":null}\n\n");
        assert_eq!(parser.usage(), None);

        parser.feed(
            b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":15,\"completion_tokens\":7}}\n\ndata: [DONE]\n\n",
        );
        let usage = parser.usage().unwrap();
        assert_eq!(usage.input_tokens, 15);
        assert_eq!(usage.output_tokens, 7);
    }

    #[test]
    fn test_chunks_split_mid_line() {
        let mut parser = SseUsageParser::new();
        parser.feed(b"data: {\"usage\":{\"prompt_to");
        parser.feed(b"kens\":3,\"completion_tokens\":4}}\n");
        let usage = parser.usage().unwrap();
        assert_eq!(usage.input_tokens, 3);
        assert_eq!(usage.output_tokens, 4);
    }
}
