//! OpenAI chat completions codec

use inferload_core::client::{HistoryEntry, RequestCodec};
use inferload_core::error::{ErrorDetails, ErrorKind};
use inferload_core::model::{ParsedResponse, ResponseChunk, Turn, Usage};
use serde_json::{json, Value};

/// `/v1/chat/completions` request formatting and response parsing
pub struct ChatCodec;

impl RequestCodec for ChatCodec {
    fn endpoint_path(&self) -> &'static str {
        "/v1/chat/completions"
    }

    fn format(
        &self,
        turn: &Turn,
        history: &[HistoryEntry],
        model: &str,
        streaming: bool,
    ) -> Value {
        let mut messages: Vec<Value> = history
            .iter()
            .map(|entry| json!({"role": entry.role.to_string(), "content": entry.text}))
            .collect();
        messages.push(json!({"role": turn.role.to_string(), "content": turn.text}));

        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(max_tokens) = turn.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(min_tokens) = turn.min_tokens {
            body["min_tokens"] = json!(min_tokens);
        }
        if turn.ignore_eos {
            body["ignore_eos"] = json!(true);
        }
        if streaming {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    fn parse_stream_data(
        &self,
        data: &str,
        received_ns: u64,
    ) -> Result<Option<ResponseChunk>, ErrorDetails> {
        let value: Value = serde_json::from_str(data).map_err(|e| {
            ErrorDetails::new(
                ErrorKind::ResponseParseError,
                format!("malformed stream event: {e}"),
            )
        })?;

        let choice = value.get("choices").and_then(|c| c.get(0));
        let delta = choice.and_then(|c| c.get("delta"));
        Ok(Some(ResponseChunk {
            received_ns,
            delta_text: string_field(delta, "content"),
            delta_reasoning: string_field(delta, "reasoning_content"),
            finish_reason: choice
                .and_then(|c| c.get("finish_reason"))
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: parse_usage(&value),
        }))
    }

    fn parse_body(&self, body: &str, received_ns: u64) -> Result<ParsedResponse, ErrorDetails> {
        let value: Value = serde_json::from_str(body).map_err(|e| {
            ErrorDetails::new(
                ErrorKind::ResponseParseError,
                format!("unparseable response body: {e}"),
            )
        })?;

        let choice = value.get("choices").and_then(|c| c.get(0));
        let message = choice.and_then(|c| c.get("message"));
        Ok(ParsedResponse {
            chunks: vec![ResponseChunk {
                received_ns,
                delta_text: string_field(message, "content"),
                delta_reasoning: string_field(message, "reasoning_content"),
                finish_reason: choice
                    .and_then(|c| c.get("finish_reason"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                usage: parse_usage(&value),
            }],
        })
    }
}

pub(crate) fn string_field(container: Option<&Value>, field: &str) -> String {
    container
        .and_then(|c| c.get(field))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn parse_usage(value: &Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    if usage.is_null() {
        return None;
    }
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).map(|v| v as usize);
    Some(Usage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        reasoning_tokens: usage
            .get("completion_tokens_details")
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(Value::as_u64)
            .map(|v| v as usize),
        total_tokens: field("total_tokens"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use inferload_core::model::Role;

    #[test]
    fn test_format_includes_history() {
        let turn = Turn::user("third").with_max_tokens(64);
        let history = vec![
            HistoryEntry {
                role: Role::User,
                text: "first".to_string(),
            },
            HistoryEntry {
                role: Role::Assistant,
                text: "reply".to_string(),
            },
        ];
        let body = ChatCodec.format(&turn, &history, "test-model", true);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"], "reply");
        assert_eq!(messages[2]["content"], "third");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_format_non_streaming_omits_stream_fields() {
        let body = ChatCodec.format(&Turn::user("hi"), &[], "m", false);
        assert!(body.get("stream").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_parse_stream_delta() {
        let chunk = ChatCodec
            .parse_stream_data(
                r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#,
                42,
            )
            .unwrap()
            .unwrap();
        assert_eq!(chunk.delta_text, "Hello");
        assert_eq!(chunk.delta_reasoning, "");
        assert_eq!(chunk.received_ns, 42);
        assert!(chunk.finish_reason.is_none());
    }

    #[test]
    fn test_parse_stream_reasoning_delta() {
        let chunk = ChatCodec
            .parse_stream_data(
                r#"{"choices":[{"delta":{"reasoning_content":"thinking"}}]}"#,
                1,
            )
            .unwrap()
            .unwrap();
        assert_eq!(chunk.delta_text, "");
        assert_eq!(chunk.delta_reasoning, "thinking");
    }

    #[test]
    fn test_parse_stream_final_chunk_with_usage() {
        let chunk = ChatCodec
            .parse_stream_data(
                r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":20,"total_tokens":30}}"#,
                1,
            )
            .unwrap()
            .unwrap();
        assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
        let usage = chunk.usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(10));
        assert_eq!(usage.completion_tokens, Some(20));
    }

    #[test]
    fn test_parse_stream_rejects_malformed_json() {
        let error = ChatCodec.parse_stream_data("not json", 1).unwrap_err();
        assert_eq!(error.kind, ErrorKind::ResponseParseError);
    }

    #[test]
    fn test_parse_full_body() {
        let response = ChatCodec
            .parse_body(
                r#"{"choices":[{"message":{"content":"Hi there"},"finish_reason":"stop"}],"usage":{"completion_tokens":2}}"#,
                7,
            )
            .unwrap();
        assert_eq!(response.final_text(), "Hi there");
        assert_eq!(response.usage().unwrap().completion_tokens, Some(2));
        assert_eq!(response.chunks[0].received_ns, 7);
    }
}
