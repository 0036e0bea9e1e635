//! Metric registry and per-record metric values
//!
//! Metrics are plain values, not types: each metric is a [`MetricSpec`]
//! record naming its tag, unit, kind, extractor, and dependencies. Record
//! metrics are extracted per request by the processor pool; aggregate
//! metrics are summed by the aggregator; derived metrics are computed once
//! at finalization, in dependency order.

mod extract;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ErrorDetails;
use crate::model::{ConversationId, CreditPhase, RawRequestRecord};
use crate::tokenizer::Tokenizer;

pub use extract::RecordView;

/// How a metric participates in aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// One value (or series) per request; gets full summary statistics
    Record,
    /// A single accumulator summed across records
    Aggregate,
    /// Computed from other metric results at finalization
    Derived,
}

/// A metric value attached to one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// Single numeric value
    Scalar(f64),
    /// Per-event stream, e.g. inter-chunk latencies
    Series(Vec<f64>),
}

impl MetricValue {
    /// The scalar value, if this is not a series
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::Series(_) => None,
        }
    }

    /// All values carried by this metric value
    pub fn values(&self) -> Vec<f64> {
        match self {
            MetricValue::Scalar(v) => vec![*v],
            MetricValue::Series(vs) => vs.clone(),
        }
    }
}

/// Inputs available to derived metric resolvers at finalization
#[derive(Debug, Clone, Default)]
pub struct DerivedInputs {
    /// Measured benchmark duration (profiling phase only), seconds
    pub benchmark_duration_secs: f64,
    /// Completed (non-error) profiling requests
    pub completed_requests: u64,
    /// Failed or cancelled profiling requests
    pub error_requests: u64,
    /// Sum of `output_token_count` across completed records
    pub output_token_sum: f64,
    /// Completed requests meeting every goodput SLO; `None` when no SLOs
    /// were configured
    pub goodput_count: Option<u64>,
}

/// Static description of one metric
pub struct MetricSpec {
    /// Unique identifier, e.g. `time_to_first_token`
    pub tag: &'static str,
    /// Display name, e.g. `Time to First Token`
    pub header: &'static str,
    /// Base unit, e.g. `ms`
    pub unit: &'static str,
    /// Record, aggregate, or derived
    pub kind: MetricKind,
    /// Tags this metric depends on (derived metrics only)
    pub dependencies: &'static [&'static str],
    /// Per-record extractor (record metrics only); `None` means the metric
    /// does not apply to the given record
    pub extract: Option<fn(&RecordView<'_>) -> Option<MetricValue>>,
    /// Finalization resolver (derived metrics only)
    pub derive: Option<fn(&DerivedInputs) -> Option<f64>>,
}

/// Metric tags
pub mod tag {
    pub const INPUT_SEQUENCE_LENGTH: &str = "input_sequence_length";
    pub const REQUEST_LATENCY: &str = "request_latency";
    pub const TIME_TO_FIRST_TOKEN: &str = "time_to_first_token";
    pub const TIME_TO_FIRST_OUTPUT_TOKEN: &str = "time_to_first_output_token";
    pub const TIME_TO_SECOND_TOKEN: &str = "time_to_second_token";
    pub const INTER_CHUNK_LATENCY: &str = "inter_chunk_latency";
    pub const INTER_TOKEN_LATENCY: &str = "inter_token_latency";
    pub const OUTPUT_TOKEN_COUNT: &str = "output_token_count";
    pub const REASONING_TOKEN_COUNT: &str = "reasoning_token_count";
    pub const OUTPUT_SEQUENCE_LENGTH: &str = "output_sequence_length";
    pub const OUTPUT_TOKEN_THROUGHPUT_PER_USER: &str = "output_token_throughput_per_user";
    pub const ERROR_ISL: &str = "error_isl";
    pub const REQUEST_COUNT: &str = "request_count";
    pub const ERROR_REQUEST_COUNT: &str = "error_request_count";
    pub const REQUEST_THROUGHPUT: &str = "request_throughput";
    pub const OUTPUT_TOKEN_THROUGHPUT: &str = "output_token_throughput";
    pub const GOODPUT: &str = "goodput";
}

static REGISTRY: &[MetricSpec] = &[
    MetricSpec {
        tag: tag::INPUT_SEQUENCE_LENGTH,
        header: "Input Sequence Length",
        unit: "tokens",
        kind: MetricKind::Record,
        dependencies: &[],
        extract: Some(extract::input_sequence_length),
        derive: None,
    },
    MetricSpec {
        tag: tag::REQUEST_LATENCY,
        header: "Request Latency",
        unit: "ms",
        kind: MetricKind::Record,
        dependencies: &[],
        extract: Some(extract::request_latency),
        derive: None,
    },
    MetricSpec {
        tag: tag::TIME_TO_FIRST_TOKEN,
        header: "Time to First Token",
        unit: "ms",
        kind: MetricKind::Record,
        dependencies: &[],
        extract: Some(extract::time_to_first_token),
        derive: None,
    },
    MetricSpec {
        tag: tag::TIME_TO_FIRST_OUTPUT_TOKEN,
        header: "Time to First Output Token",
        unit: "ms",
        kind: MetricKind::Record,
        dependencies: &[],
        extract: Some(extract::time_to_first_output_token),
        derive: None,
    },
    MetricSpec {
        tag: tag::TIME_TO_SECOND_TOKEN,
        header: "Time to Second Token",
        unit: "ms",
        kind: MetricKind::Record,
        dependencies: &[],
        extract: Some(extract::time_to_second_token),
        derive: None,
    },
    MetricSpec {
        tag: tag::INTER_CHUNK_LATENCY,
        header: "Inter Chunk Latency",
        unit: "ms",
        kind: MetricKind::Record,
        dependencies: &[],
        extract: Some(extract::inter_chunk_latency),
        derive: None,
    },
    MetricSpec {
        tag: tag::INTER_TOKEN_LATENCY,
        header: "Inter Token Latency",
        unit: "ms",
        kind: MetricKind::Record,
        dependencies: &[],
        extract: Some(extract::inter_token_latency),
        derive: None,
    },
    MetricSpec {
        tag: tag::OUTPUT_TOKEN_COUNT,
        header: "Output Token Count",
        unit: "tokens",
        kind: MetricKind::Record,
        dependencies: &[],
        extract: Some(extract::output_token_count),
        derive: None,
    },
    MetricSpec {
        tag: tag::REASONING_TOKEN_COUNT,
        header: "Reasoning Token Count",
        unit: "tokens",
        kind: MetricKind::Record,
        dependencies: &[],
        extract: Some(extract::reasoning_token_count),
        derive: None,
    },
    MetricSpec {
        tag: tag::OUTPUT_SEQUENCE_LENGTH,
        header: "Output Sequence Length",
        unit: "tokens",
        kind: MetricKind::Record,
        dependencies: &[],
        extract: Some(extract::output_sequence_length),
        derive: None,
    },
    MetricSpec {
        tag: tag::OUTPUT_TOKEN_THROUGHPUT_PER_USER,
        header: "Output Token Throughput Per User",
        unit: "tokens/sec",
        kind: MetricKind::Record,
        dependencies: &[],
        extract: Some(extract::output_token_throughput_per_user),
        derive: None,
    },
    MetricSpec {
        tag: tag::ERROR_ISL,
        header: "Error Input Sequence Length",
        unit: "tokens",
        kind: MetricKind::Record,
        dependencies: &[],
        // extracted only for failed records, see RecordProcessor
        extract: None,
        derive: None,
    },
    MetricSpec {
        tag: tag::REQUEST_COUNT,
        header: "Request Count",
        unit: "requests",
        kind: MetricKind::Aggregate,
        dependencies: &[],
        extract: None,
        derive: None,
    },
    MetricSpec {
        tag: tag::ERROR_REQUEST_COUNT,
        header: "Error Request Count",
        unit: "requests",
        kind: MetricKind::Aggregate,
        dependencies: &[],
        extract: None,
        derive: None,
    },
    MetricSpec {
        tag: tag::REQUEST_THROUGHPUT,
        header: "Request Throughput",
        unit: "requests/sec",
        kind: MetricKind::Derived,
        dependencies: &[tag::REQUEST_COUNT],
        extract: None,
        derive: Some(|inputs| {
            (inputs.benchmark_duration_secs > 0.0)
                .then(|| inputs.completed_requests as f64 / inputs.benchmark_duration_secs)
        }),
    },
    MetricSpec {
        tag: tag::OUTPUT_TOKEN_THROUGHPUT,
        header: "Output Token Throughput",
        unit: "tokens/sec",
        kind: MetricKind::Derived,
        dependencies: &[tag::OUTPUT_TOKEN_COUNT],
        extract: None,
        derive: Some(|inputs| {
            (inputs.benchmark_duration_secs > 0.0)
                .then(|| inputs.output_token_sum / inputs.benchmark_duration_secs)
        }),
    },
    MetricSpec {
        tag: tag::GOODPUT,
        header: "Goodput",
        unit: "requests/sec",
        kind: MetricKind::Derived,
        dependencies: &[tag::REQUEST_COUNT, tag::REQUEST_THROUGHPUT],
        extract: None,
        derive: Some(|inputs| {
            let count = inputs.goodput_count?;
            (inputs.benchmark_duration_secs > 0.0)
                .then(|| count as f64 / inputs.benchmark_duration_secs)
        }),
    },
];

/// All registered metrics
pub fn registry() -> &'static [MetricSpec] {
    REGISTRY
}

/// Look up a metric by tag
pub fn spec(tag: &str) -> Option<&'static MetricSpec> {
    REGISTRY.iter().find(|spec| spec.tag == tag)
}

/// Derived metrics in dependency order.
///
/// Record and aggregate dependencies are always available before
/// finalization, so only derived-on-derived edges constrain the order.
pub fn derived_in_order() -> Vec<&'static MetricSpec> {
    let derived: Vec<&MetricSpec> = REGISTRY
        .iter()
        .filter(|spec| spec.kind == MetricKind::Derived)
        .collect();

    let mut resolved: Vec<&'static str> = Vec::new();
    let mut ordered: Vec<&'static MetricSpec> = Vec::new();
    let mut remaining: Vec<&'static MetricSpec> = derived;

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|spec| {
            spec.dependencies.iter().all(|dep| {
                resolved.contains(dep)
                    || self::spec(dep).is_none_or(|d| d.kind != MetricKind::Derived)
            })
        });
        assert!(
            !ready.is_empty(),
            "cycle detected in derived metric dependencies"
        );
        for spec in ready {
            resolved.push(spec.tag);
            ordered.push(spec);
        }
        remaining = blocked;
    }
    ordered
}

/// Export metadata for one processed record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecordMetadata {
    /// Sequential session number in the benchmark
    pub session_num: usize,
    /// `X-Request-ID` of the request
    pub x_request_id: String,
    /// `X-Correlation-ID` shared by all turns of a conversation
    pub x_correlation_id: String,
    /// Conversation the record belongs to
    pub conversation_id: ConversationId,
    /// Turn index within the conversation
    pub turn_index: usize,
    /// Whether this was the conversation's final turn
    pub final_turn: bool,
    /// Monotonic request start
    pub request_start_ns: u64,
    /// Monotonic first-byte acknowledgement, when streamed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_ack_ns: Option<u64>,
    /// Monotonic request end
    pub request_end_ns: u64,
    /// Wall-clock request start, nanoseconds since the epoch
    pub timestamp_ns: i64,
    /// Worker that executed the request
    pub worker_id: usize,
    /// Processor that extracted the metrics
    pub record_processor_id: usize,
    /// Warmup or profiling
    pub benchmark_phase: CreditPhase,
    /// Whether the request was cancelled mid-flight
    pub was_cancelled: bool,
    /// Monotonic cancellation acknowledgement time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_time_ns: Option<u64>,
}

/// Per-request metric values plus metadata, as produced by the processor
/// pool and consumed by the aggregator and the JSONL exporter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Record metadata
    pub metadata: MetricRecordMetadata,
    /// Extracted metric values keyed by tag
    pub values: BTreeMap<String, MetricValue>,
    /// Failure details for error records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

impl MetricRecord {
    /// Build the metadata block from a raw record
    pub fn metadata_from(record: &RawRequestRecord, processor_id: usize) -> MetricRecordMetadata {
        MetricRecordMetadata {
            session_num: record.session_num,
            x_request_id: record.x_request_id.clone(),
            x_correlation_id: record.x_correlation_id.clone(),
            conversation_id: record.conversation_id.clone(),
            turn_index: record.turn_index,
            final_turn: record.final_turn,
            request_start_ns: record.start_ns,
            request_ack_ns: record.ack_ns,
            request_end_ns: record.end_ns,
            timestamp_ns: record.timestamp_wall_ns,
            worker_id: record.worker_id,
            record_processor_id: processor_id,
            benchmark_phase: record.phase,
            was_cancelled: record.was_cancelled,
            cancellation_time_ns: record.cancellation_time_ns,
        }
    }

    /// Scalar value of a metric, if present
    pub fn scalar(&self, tag: &str) -> Option<f64> {
        self.values.get(tag).and_then(MetricValue::as_scalar)
    }
}

/// Extract all applicable record metrics for a successful record
pub fn extract_record_metrics(
    record: &RawRequestRecord,
    tokenizer: &dyn Tokenizer,
    prefer_usage: bool,
) -> BTreeMap<String, MetricValue> {
    let view = RecordView::new(record, tokenizer, prefer_usage);
    let mut values = BTreeMap::new();
    for spec in REGISTRY {
        if let Some(extractor) = spec.extract {
            if let Some(value) = extractor(&view) {
                values.insert(spec.tag.to_string(), value);
            }
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_tags_are_unique() {
        let mut tags: Vec<&str> = REGISTRY.iter().map(|spec| spec.tag).collect();
        let before = tags.len();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), before);
    }

    #[test]
    fn test_spec_lookup() {
        let spec = spec(tag::TIME_TO_FIRST_TOKEN).unwrap();
        assert_eq!(spec.unit, "ms");
        assert_eq!(spec.kind, MetricKind::Record);
        assert!(self::spec("no_such_metric").is_none());
    }

    #[test]
    fn test_derived_order_respects_dependencies() {
        let ordered = derived_in_order();
        let tags: Vec<&str> = ordered.iter().map(|spec| spec.tag).collect();
        let throughput = tags.iter().position(|&t| t == tag::REQUEST_THROUGHPUT);
        let goodput = tags.iter().position(|&t| t == tag::GOODPUT);
        assert!(throughput.unwrap() < goodput.unwrap());
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn test_derive_request_throughput() {
        let spec = spec(tag::REQUEST_THROUGHPUT).unwrap();
        let inputs = DerivedInputs {
            benchmark_duration_secs: 10.0,
            completed_requests: 50,
            ..Default::default()
        };
        assert_eq!((spec.derive.unwrap())(&inputs), Some(5.0));
    }

    #[test]
    fn test_goodput_absent_without_slos() {
        let spec = spec(tag::GOODPUT).unwrap();
        let inputs = DerivedInputs {
            benchmark_duration_secs: 10.0,
            goodput_count: None,
            ..Default::default()
        };
        assert_eq!((spec.derive.unwrap())(&inputs), None);

        let inputs = DerivedInputs {
            benchmark_duration_secs: 10.0,
            goodput_count: Some(20),
            ..Default::default()
        };
        assert_eq!((spec.derive.unwrap())(&inputs), Some(2.0));
    }

    #[test]
    fn test_metric_value_forms() {
        assert_eq!(MetricValue::Scalar(4.0).as_scalar(), Some(4.0));
        assert_eq!(MetricValue::Series(vec![1.0]).as_scalar(), None);
        assert_eq!(MetricValue::Series(vec![1.0, 2.0]).values(), vec![1.0, 2.0]);
    }
}
