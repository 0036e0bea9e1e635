//! Base metric extractors
//!
//! The raw response is parsed once into a [`RecordView`]; every extractor
//! then reads the precomputed view. Extractors return `None` when the
//! metric does not apply to the record (e.g. first-token timings on a
//! non-streamed response).

use crate::clock::{ns_to_ms, ns_to_secs};
use crate::model::RawRequestRecord;
use crate::tokenizer::Tokenizer;

use super::MetricValue;

/// Precomputed per-record view shared by all extractors
pub struct RecordView<'a> {
    /// The raw record
    pub record: &'a RawRequestRecord,
    /// Input tokens: the trace's `input_length` when replaying a trace,
    /// otherwise the tokenizer count of the composed prompt
    pub input_tokens: usize,
    /// Output (non-reasoning) tokens across all deltas
    pub output_tokens: usize,
    /// Reasoning tokens across all deltas
    pub reasoning_tokens: usize,
    /// Receive times of content-bearing chunks, in order
    pub chunk_times_ns: Vec<u64>,
}

impl<'a> RecordView<'a> {
    /// Parse the record once. `prefer_usage` flips the source of output
    /// token counts from the tokenizer to the server's `usage` block.
    pub fn new(record: &'a RawRequestRecord, tokenizer: &dyn Tokenizer, prefer_usage: bool) -> Self {
        let input_tokens = record
            .input_length_hint
            .unwrap_or_else(|| tokenizer.count(&record.input_text));

        let final_text = record.response.final_text();
        let reasoning_text = record.response.reasoning_text();
        // Tokenizer counts over concatenated deltas; server usage fills in
        // when preferred or when the tokenizer sees no text at all.
        let mut output_tokens = tokenizer.count(&final_text);
        let mut reasoning_tokens = tokenizer.count(&reasoning_text);
        let usage = record.response.usage();
        let usage_preferred = prefer_usage && usage.is_some_and(|u| u.completion_tokens.is_some());
        if usage_preferred || (output_tokens == 0 && reasoning_tokens == 0) {
            if let Some(usage) = usage {
                output_tokens = usage.completion_tokens.unwrap_or(output_tokens);
                reasoning_tokens = usage.reasoning_tokens.unwrap_or(reasoning_tokens);
            }
        }

        Self {
            record,
            input_tokens,
            output_tokens,
            reasoning_tokens,
            chunk_times_ns: record.response.content_chunk_times(),
        }
    }

    fn total_output_tokens(&self) -> usize {
        self.output_tokens + self.reasoning_tokens
    }
}

pub(super) fn input_sequence_length(view: &RecordView<'_>) -> Option<MetricValue> {
    Some(MetricValue::Scalar(view.input_tokens as f64))
}

pub(super) fn request_latency(view: &RecordView<'_>) -> Option<MetricValue> {
    Some(MetricValue::Scalar(ns_to_ms(view.record.latency_ns())))
}

pub(super) fn time_to_first_token(view: &RecordView<'_>) -> Option<MetricValue> {
    if !view.record.streamed {
        return None;
    }
    let first = view.record.response.first_content_ns()?;
    Some(MetricValue::Scalar(ns_to_ms(
        first.saturating_sub(view.record.start_ns),
    )))
}

pub(super) fn time_to_first_output_token(view: &RecordView<'_>) -> Option<MetricValue> {
    if !view.record.streamed {
        return None;
    }
    let first = view.record.response.first_output_ns()?;
    Some(MetricValue::Scalar(ns_to_ms(
        first.saturating_sub(view.record.start_ns),
    )))
}

pub(super) fn time_to_second_token(view: &RecordView<'_>) -> Option<MetricValue> {
    if !view.record.streamed {
        return None;
    }
    let second = view.chunk_times_ns.get(1)?;
    Some(MetricValue::Scalar(ns_to_ms(
        second.saturating_sub(view.record.start_ns),
    )))
}

pub(super) fn inter_chunk_latency(view: &RecordView<'_>) -> Option<MetricValue> {
    if view.chunk_times_ns.len() < 2 {
        return None;
    }
    let deltas: Vec<f64> = view
        .chunk_times_ns
        .windows(2)
        .map(|pair| ns_to_ms(pair[1].saturating_sub(pair[0])))
        .collect();
    Some(MetricValue::Series(deltas))
}

/// Mean inter-token latency, weighted by delta token count: total decode
/// time divided by (output tokens - 1).
pub(super) fn inter_token_latency(view: &RecordView<'_>) -> Option<MetricValue> {
    let tokens = view.total_output_tokens();
    if tokens < 2 || view.chunk_times_ns.len() < 2 {
        return None;
    }
    let first = view.chunk_times_ns[0];
    let last = *view.chunk_times_ns.last().expect("len checked above");
    let decode_ms = ns_to_ms(last.saturating_sub(first));
    Some(MetricValue::Scalar(decode_ms / (tokens - 1) as f64))
}

pub(super) fn output_token_count(view: &RecordView<'_>) -> Option<MetricValue> {
    Some(MetricValue::Scalar(view.output_tokens as f64))
}

pub(super) fn reasoning_token_count(view: &RecordView<'_>) -> Option<MetricValue> {
    Some(MetricValue::Scalar(view.reasoning_tokens as f64))
}

pub(super) fn output_sequence_length(view: &RecordView<'_>) -> Option<MetricValue> {
    Some(MetricValue::Scalar(view.total_output_tokens() as f64))
}

pub(super) fn output_token_throughput_per_user(view: &RecordView<'_>) -> Option<MetricValue> {
    let ack = view.record.ack_ns?;
    let generation_secs = ns_to_secs(view.record.end_ns.saturating_sub(ack));
    if generation_secs <= 0.0 || view.output_tokens == 0 {
        return None;
    }
    Some(MetricValue::Scalar(
        view.output_tokens as f64 / generation_secs,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{extract_record_metrics, tag};
    use crate::model::{CreditPhase, ParsedResponse, ResponseChunk};
    use crate::tokenizer::HeuristicTokenizer;

    fn streamed_record(chunk_times_ns: &[u64], words_per_chunk: usize) -> RawRequestRecord {
        let chunks = chunk_times_ns
            .iter()
            .map(|&received_ns| ResponseChunk {
                received_ns,
                delta_text: vec!["word"; words_per_chunk].join(" ") + " ",
                delta_reasoning: String::new(),
                finish_reason: None,
                usage: None,
            })
            .collect();
        RawRequestRecord {
            x_request_id: "req-0".to_string(),
            x_correlation_id: "conv-0".to_string(),
            conversation_id: "conv-0".into(),
            turn_index: 0,
            final_turn: true,
            session_num: 0,
            worker_id: 0,
            phase: CreditPhase::Profiling,
            start_ns: 1_000_000,
            ack_ns: chunk_times_ns.first().copied(),
            end_ns: chunk_times_ns.last().copied().unwrap_or(2_000_000),
            streamed: true,
            status: Some(200),
            response: ParsedResponse { chunks },
            input_text: "one two three four".to_string(),
            input_length_hint: None,
            was_cancelled: false,
            cancellation_time_ns: None,
            credit_drop_latency_ns: None,
            error: None,
            timestamp_wall_ns: 0,
        }
    }

    fn tokenizer() -> HeuristicTokenizer {
        HeuristicTokenizer::from_corpus("word one two three four five six")
    }

    #[test]
    fn test_streamed_timings() {
        // 20ms TTFT, 5ms between chunks, 1 token per chunk
        let record = streamed_record(&[21_000_000, 26_000_000, 31_000_000], 1);
        let tok = tokenizer();
        let values = extract_record_metrics(&record, &tok, false);

        let ttft = values[tag::TIME_TO_FIRST_TOKEN].as_scalar().unwrap();
        assert!((ttft - 20.0).abs() < 1e-9);

        let tt2t = values[tag::TIME_TO_SECOND_TOKEN].as_scalar().unwrap();
        assert!((tt2t - 25.0).abs() < 1e-9);

        let icl = match &values[tag::INTER_CHUNK_LATENCY] {
            MetricValue::Series(vs) => vs.clone(),
            _ => panic!("expected series"),
        };
        assert_eq!(icl, vec![5.0, 5.0]);

        // 3 tokens over 10ms of decode -> 5 ms/token
        let itl = values[tag::INTER_TOKEN_LATENCY].as_scalar().unwrap();
        assert!((itl - 5.0).abs() < 1e-9);

        assert_eq!(values[tag::OUTPUT_TOKEN_COUNT].as_scalar(), Some(3.0));
        assert_eq!(values[tag::OUTPUT_SEQUENCE_LENGTH].as_scalar(), Some(3.0));
        assert_eq!(values[tag::INPUT_SEQUENCE_LENGTH].as_scalar(), Some(4.0));
    }

    #[test]
    fn test_non_streamed_omits_token_timings() {
        let mut record = streamed_record(&[5_000_000], 4);
        record.streamed = false;
        let tok = tokenizer();
        let values = extract_record_metrics(&record, &tok, false);

        assert!(!values.contains_key(tag::TIME_TO_FIRST_TOKEN));
        assert!(!values.contains_key(tag::TIME_TO_SECOND_TOKEN));
        assert!(values.contains_key(tag::REQUEST_LATENCY));
        assert_eq!(values[tag::OUTPUT_TOKEN_COUNT].as_scalar(), Some(4.0));
    }

    #[test]
    fn test_input_length_hint_wins() {
        let mut record = streamed_record(&[5_000_000], 1);
        record.input_length_hint = Some(512);
        let tok = tokenizer();
        let view = RecordView::new(&record, &tok, false);
        assert_eq!(view.input_tokens, 512);
    }

    #[test]
    fn test_single_chunk_has_no_itl() {
        let record = streamed_record(&[5_000_000], 2);
        let tok = tokenizer();
        let values = extract_record_metrics(&record, &tok, false);
        assert!(!values.contains_key(tag::INTER_TOKEN_LATENCY));
        assert!(!values.contains_key(tag::INTER_CHUNK_LATENCY));
    }

    #[test]
    fn test_prefer_usage_overrides_tokenizer_counts() {
        let mut record = streamed_record(&[5_000_000, 6_000_000], 2);
        record.response.chunks[1].usage = Some(crate::model::Usage {
            completion_tokens: Some(17),
            ..Default::default()
        });
        let tok = tokenizer();

        let by_tokenizer = RecordView::new(&record, &tok, false);
        assert_eq!(by_tokenizer.output_tokens, 4);

        let by_usage = RecordView::new(&record, &tok, true);
        assert_eq!(by_usage.output_tokens, 17);
    }

    #[test]
    fn test_throughput_per_user_uses_generation_window() {
        // ack at 1s, end at 2s, 10 output tokens -> 10 tokens/sec
        let mut record = streamed_record(&[1_000_000_000, 2_000_000_000], 5);
        record.start_ns = 0;
        record.ack_ns = Some(1_000_000_000);
        record.end_ns = 2_000_000_000;
        let tok = tokenizer();
        let values = extract_record_metrics(&record, &tok, false);
        let throughput = values[tag::OUTPUT_TOKEN_THROUGHPUT_PER_USER]
            .as_scalar()
            .unwrap();
        assert!((throughput - 10.0).abs() < 1e-9);
    }
}
