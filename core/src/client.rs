//! Inference client and endpoint codec traits
//!
//! These traits are defined in core to avoid circular dependencies; the
//! HTTP implementation and the built-in OpenAI-style codecs live in
//! `inferload-endpoints`. Tests substitute in-process mocks.

use async_trait::async_trait;

use crate::error::ErrorDetails;
use crate::model::{ParsedResponse, ResponseChunk, Role, Turn};

/// A prior exchange carried into subsequent turns of a conversation
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Who said it
    pub role: Role,
    /// What was said
    pub text: String,
}

/// Everything a client needs to execute one turn
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// `X-Request-ID` header value, unique per attempt
    pub x_request_id: String,

    /// `X-Correlation-ID` header value, stable across a conversation
    pub x_correlation_id: String,

    /// Model name for the payload (per-turn override already applied)
    pub model: String,

    /// The turn to send
    pub turn: Turn,

    /// Prior user turns and assistant replies, in order
    pub history: Vec<HistoryEntry>,

    /// Whether to request a streamed response
    pub streaming: bool,
}

/// Timed result of one request attempt.
///
/// Failures are carried in `error` rather than a `Result` so that timing
/// is always available; a worker turns every outcome into a record.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Monotonic time immediately before the request was sent
    pub start_ns: u64,

    /// Monotonic time of the first response byte (streaming only)
    pub ack_ns: Option<u64>,

    /// Monotonic time the attempt finished
    pub end_ns: u64,

    /// HTTP status, when a response line was received
    pub status: Option<u16>,

    /// Whether the response was actually streamed
    pub streamed: bool,

    /// Parsed response deltas
    pub response: ParsedResponse,

    /// Failure details, when the attempt did not complete normally
    pub error: Option<ErrorDetails>,
}

/// Executes requests against an inference endpoint
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Execute one turn and return its timed outcome
    async fn send(&self, request: &TurnRequest) -> TurnOutcome;

    /// The composed prompt text for the request, for input token counting
    fn prompt_text(&self, request: &TurnRequest) -> String;
}

/// Formats requests and parses responses for one endpoint flavor
pub trait RequestCodec: Send + Sync {
    /// Request path relative to the base URL, e.g. `/v1/chat/completions`
    fn endpoint_path(&self) -> &'static str;

    /// Whether the endpoint can stream
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Build the JSON request body for a turn
    fn format(
        &self,
        turn: &Turn,
        history: &[HistoryEntry],
        model: &str,
        streaming: bool,
    ) -> serde_json::Value;

    /// The prompt text as the endpoint will see it, history included
    fn prompt_text(&self, turn: &Turn, history: &[HistoryEntry]) -> String {
        let mut parts: Vec<&str> = history.iter().map(|entry| entry.text.as_str()).collect();
        parts.push(&turn.text);
        parts.join("\n")
    }

    /// Parse one SSE `data:` payload into a chunk.
    ///
    /// `Ok(None)` means the event carries nothing of interest (keepalive,
    /// unknown event type) and should be skipped.
    fn parse_stream_data(
        &self,
        data: &str,
        received_ns: u64,
    ) -> Result<Option<ResponseChunk>, ErrorDetails>;

    /// Parse a complete non-streamed body into a response
    fn parse_body(&self, body: &str, received_ns: u64)
        -> Result<ParsedResponse, ErrorDetails>;
}
