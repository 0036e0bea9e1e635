//! OpenAI embeddings codec

use inferload_core::client::{HistoryEntry, RequestCodec};
use inferload_core::error::{ErrorDetails, ErrorKind};
use inferload_core::model::{ParsedResponse, ResponseChunk, Turn};
use serde_json::{json, Value};

use crate::chat::parse_usage;

/// `/v1/embeddings` request formatting and response parsing.
///
/// Embeddings do not stream and produce no output tokens; records carry
/// request latency and input length only.
pub struct EmbeddingsCodec;

impl RequestCodec for EmbeddingsCodec {
    fn endpoint_path(&self) -> &'static str {
        "/v1/embeddings"
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    fn format(&self, turn: &Turn, _history: &[HistoryEntry], model: &str, _streaming: bool) -> Value {
        json!({
            "model": model,
            "input": [turn.text],
        })
    }

    fn prompt_text(&self, turn: &Turn, _history: &[HistoryEntry]) -> String {
        turn.text.clone()
    }

    fn parse_stream_data(
        &self,
        _data: &str,
        _received_ns: u64,
    ) -> Result<Option<ResponseChunk>, ErrorDetails> {
        Err(ErrorDetails::new(
            ErrorKind::ResponseParseError,
            "embeddings endpoint does not stream",
        ))
    }

    fn parse_body(&self, body: &str, received_ns: u64) -> Result<ParsedResponse, ErrorDetails> {
        let value: Value = serde_json::from_str(body).map_err(|e| {
            ErrorDetails::new(
                ErrorKind::ResponseParseError,
                format!("unparseable embeddings body: {e}"),
            )
        })?;
        if value.get("data").and_then(Value::as_array).is_none() {
            return Err(ErrorDetails::new(
                ErrorKind::ResponseParseError,
                "embeddings body has no data array",
            ));
        }
        Ok(ParsedResponse {
            chunks: vec![ResponseChunk {
                received_ns,
                delta_text: String::new(),
                delta_reasoning: String::new(),
                finish_reason: None,
                usage: parse_usage(&value),
            }],
        })
    }
}
