//! Rankings endpoint codec

use inferload_core::client::{HistoryEntry, RequestCodec};
use inferload_core::error::{ErrorDetails, ErrorKind};
use inferload_core::model::{ParsedResponse, ResponseChunk, Turn};
use serde_json::{json, Value};

use crate::chat::parse_usage;

/// `/v1/ranking` request formatting and response parsing.
///
/// The turn text is the query; prior history entries become the passages
/// to rank. With no history the query doubles as the only passage.
pub struct RankingsCodec;

impl RequestCodec for RankingsCodec {
    fn endpoint_path(&self) -> &'static str {
        "/v1/ranking"
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    fn format(&self, turn: &Turn, history: &[HistoryEntry], model: &str, _streaming: bool) -> Value {
        let passages: Vec<Value> = if history.is_empty() {
            vec![json!({"text": turn.text})]
        } else {
            history
                .iter()
                .map(|entry| json!({"text": entry.text}))
                .collect()
        };
        json!({
            "model": model,
            "query": {"text": turn.text},
            "passages": passages,
        })
    }

    fn parse_stream_data(
        &self,
        _data: &str,
        _received_ns: u64,
    ) -> Result<Option<ResponseChunk>, ErrorDetails> {
        Err(ErrorDetails::new(
            ErrorKind::ResponseParseError,
            "rankings endpoint does not stream",
        ))
    }

    fn parse_body(&self, body: &str, received_ns: u64) -> Result<ParsedResponse, ErrorDetails> {
        let value: Value = serde_json::from_str(body).map_err(|e| {
            ErrorDetails::new(
                ErrorKind::ResponseParseError,
                format!("unparseable rankings body: {e}"),
            )
        })?;
        if value.get("rankings").and_then(Value::as_array).is_none() {
            return Err(ErrorDetails::new(
                ErrorKind::ResponseParseError,
                "rankings body has no rankings array",
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
