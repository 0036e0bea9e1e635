//! OpenAI completions codec

use inferload_core::client::{HistoryEntry, RequestCodec};
use inferload_core::error::{ErrorDetails, ErrorKind};
use inferload_core::model::{ParsedResponse, ResponseChunk, Turn};
use serde_json::{json, Value};

use crate::chat::parse_usage;

/// `/v1/completions` request formatting and response parsing
pub struct CompletionsCodec;

impl RequestCodec for CompletionsCodec {
    fn endpoint_path(&self) -> &'static str {
        "/v1/completions"
    }

    fn format(
        &self,
        turn: &Turn,
        history: &[HistoryEntry],
        model: &str,
        streaming: bool,
    ) -> Value {
        let mut body = json!({
            "model": model,
            "prompt": self.prompt_text(turn, history),
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
        Ok(Some(ResponseChunk {
            received_ns,
            delta_text: choice
                .and_then(|c| c.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            delta_reasoning: String::new(),
            finish_reason: choice
                .and_then(|c| c.get("finish_reason"))
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: parse_usage(&value),
        }))
    }

    fn parse_body(&self, body: &str, received_ns: u64) -> Result<ParsedResponse, ErrorDetails> {
        // Non-streamed completions use the same choice shape as deltas
        self.parse_stream_data(body, received_ns).map(|chunk| ParsedResponse {
            chunks: chunk.into_iter().collect(),
        })
    }
}
