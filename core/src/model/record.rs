//! Request records and parsed responses

use serde::{Deserialize, Serialize};

use crate::error::ErrorDetails;

use super::{ConversationId, CreditPhase};

/// Token usage reported by the server, when present
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<usize>,

    /// Tokens in the completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<usize>,

    /// Reasoning tokens, for models that report them separately
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<usize>,

    /// Prompt + completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<usize>,
}

/// One delta received from the endpoint.
///
/// Chunks appear strictly in receive order; the first chunk carrying any
/// content determines first-token timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseChunk {
    /// Monotonic receive time
    pub received_ns: u64,

    /// Completion text carried by this delta (may be empty)
    pub delta_text: String,

    /// Reasoning text carried by this delta (may be empty)
    pub delta_reasoning: String,

    /// Finish reason, on the terminal delta
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    /// Usage statistics, typically only on the final delta
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ResponseChunk {
    /// Whether this chunk carries any content at all
    pub fn has_content(&self) -> bool {
        !self.delta_text.is_empty() || !self.delta_reasoning.is_empty()
    }

    /// Whether this chunk carries non-reasoning output
    pub fn has_output(&self) -> bool {
        !self.delta_text.is_empty()
    }
}

/// Normalised response shape produced by an endpoint codec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedResponse {
    /// Receive-ordered deltas. Non-streaming responses are represented as a
    /// single chunk.
    pub chunks: Vec<ResponseChunk>,
}

impl ParsedResponse {
    /// Concatenated completion text across all chunks
    pub fn final_text(&self) -> String {
        self.chunks.iter().map(|c| c.delta_text.as_str()).collect()
    }

    /// Concatenated reasoning text across all chunks
    pub fn reasoning_text(&self) -> String {
        self.chunks
            .iter()
            .map(|c| c.delta_reasoning.as_str())
            .collect()
    }

    /// The last usage block seen in the stream
    pub fn usage(&self) -> Option<&Usage> {
        self.chunks.iter().rev().find_map(|c| c.usage.as_ref())
    }

    /// Receive time of the first chunk with any content
    pub fn first_content_ns(&self) -> Option<u64> {
        self.chunks
            .iter()
            .find(|c| c.has_content())
            .map(|c| c.received_ns)
    }

    /// Receive time of the first chunk with non-reasoning output
    pub fn first_output_ns(&self) -> Option<u64> {
        self.chunks
            .iter()
            .find(|c| c.has_output())
            .map(|c| c.received_ns)
    }

    /// Receive times of all content-bearing chunks, in order
    pub fn content_chunk_times(&self) -> Vec<u64> {
        self.chunks
            .iter()
            .filter(|c| c.has_content())
            .map(|c| c.received_ns)
            .collect()
    }
}

/// A worker's timing snapshot of one request attempt.
///
/// Invariant: `start_ns <= ack_ns <= end_ns` whenever `ack_ns` is set. A
/// record carries either a parsed response or an error, never both empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRequestRecord {
    /// Unique id attached as the `X-Request-ID` header
    pub x_request_id: String,

    /// Stable per-conversation id attached as `X-Correlation-ID`
    pub x_correlation_id: String,

    /// Conversation this attempt belongs to
    pub conversation_id: ConversationId,

    /// Turn index within the conversation
    pub turn_index: usize,

    /// Whether this is the conversation's last turn; the aggregator frees
    /// the credit when the final turn's record is sealed
    pub final_turn: bool,

    /// Session number of the conversation
    pub session_num: usize,

    /// Worker that executed the attempt
    pub worker_id: usize,

    /// Warmup or profiling
    pub phase: CreditPhase,

    /// Monotonic time immediately before the request was sent
    pub start_ns: u64,

    /// Monotonic time of the first response byte (streaming only; equals
    /// `end_ns` for non-streaming requests)
    pub ack_ns: Option<u64>,

    /// Monotonic time the attempt finished (success, error, or cancel)
    pub end_ns: u64,

    /// Whether the response was streamed (first-token metrics only apply
    /// to streamed responses)
    pub streamed: bool,

    /// HTTP status, when a response line was received
    pub status: Option<u16>,

    /// Parsed response deltas (empty on transport errors)
    pub response: ParsedResponse,

    /// The composed prompt text that was sent, for input token counting
    pub input_text: String,

    /// Input length claimed by the trace, when replaying a trace that
    /// carries one (preferred over the tokenizer in that mode)
    pub input_length_hint: Option<usize>,

    /// Whether the attempt was aborted by the cancellation timer
    pub was_cancelled: bool,

    /// Monotonic time the cancellation was acknowledged
    pub cancellation_time_ns: Option<u64>,

    /// Latency from credit issue to request start, first turn only
    pub credit_drop_latency_ns: Option<u64>,

    /// Failure details, when the attempt did not complete normally
    pub error: Option<ErrorDetails>,

    /// Wall-clock time at request start, for export
    pub timestamp_wall_ns: i64,
}

impl RawRequestRecord {
    /// Whether this record represents a completed, well-formed attempt
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && !self.was_cancelled
    }

    /// Total request latency in nanoseconds
    pub fn latency_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}
