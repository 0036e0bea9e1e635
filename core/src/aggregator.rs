//! Centralised metric aggregation
//!
//! The aggregator is the single consumer of the metric record queue. It
//! deduplicates on `x_request_id`, routes warmup records into a separate
//! bucket that never touches profiling statistics, buckets profiling
//! records into timeslices when slicing is enabled, maintains the API
//! error summary, and returns each sealed conversation's credit to the
//! scheduler. All accumulators live on this one task, so no locking is
//! needed anywhere in the metric state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::bus::{CreditReturn, Event, MessageBus, ProgressSnapshot};
use crate::clock::ns_to_secs;
use crate::config::{SloPredicate, UserConfig};
use crate::error::{Error, ErrorDetails, Result};
use crate::metrics::{self, tag, DerivedInputs, MetricKind, MetricRecord, MetricValue};
use crate::model::CreditPhase;
use crate::service::{ServiceHarness, ServiceState};
use crate::stats::MetricStats;

/// How many sealed records between progress events
const PROGRESS_EVERY: u64 = 50;

/// How the benchmark duration denominator is measured
pub const DURATION_MEASUREMENT: &str = "first_profiling_request_start_to_last_profiling_record_end";

/// Per-phase metric accumulators
#[derive(Debug, Default)]
struct PhaseStore {
    vectors: BTreeMap<String, Vec<f64>>,
    completed: u64,
    errors: u64,
    final_turns: u64,
}

impl PhaseStore {
    fn observe(&mut self, record: &MetricRecord) {
        for (tag, value) in &record.values {
            self.vectors
                .entry(tag.clone())
                .or_default()
                .extend(value.values());
        }
        if record.error.is_none() && !record.metadata.was_cancelled {
            self.completed += 1;
        } else {
            self.errors += 1;
        }
        if record.metadata.final_turn {
            self.final_turns += 1;
        }
    }

    fn records(&self) -> u64 {
        self.completed + self.errors
    }
}

/// Timeslice bucketing for profiling records
#[derive(Debug)]
struct SliceTracker {
    slice_ns: u64,
    anchor_ns: Option<u64>,
    slices: BTreeMap<u64, BTreeMap<String, Vec<f64>>>,
}

impl SliceTracker {
    fn new(slice_ns: u64) -> Self {
        Self {
            slice_ns,
            anchor_ns: None,
            slices: BTreeMap::new(),
        }
    }

    /// A record belongs to exactly one slice, keyed on its end time.
    /// The anchor is the first profiling record's start; records that end
    /// before it (out-of-order arrival) land in slice zero.
    fn observe(&mut self, record: &MetricRecord) {
        let anchor = *self
            .anchor_ns
            .get_or_insert(record.metadata.request_start_ns);
        let offset = record.metadata.request_end_ns.saturating_sub(anchor);
        let index = offset / self.slice_ns;
        let bucket = self.slices.entry(index).or_default();
        for (tag, value) in &record.values {
            bucket.entry(tag.clone()).or_default().extend(value.values());
        }
    }

    fn finalize(self) -> Vec<TimesliceSummary> {
        let anchor = self.anchor_ns.unwrap_or(0);
        self.slices
            .into_iter()
            .map(|(index, vectors)| TimesliceSummary {
                index,
                start_ns: anchor + index * self.slice_ns,
                end_ns: anchor + (index + 1) * self.slice_ns,
                metrics: vectors
                    .into_iter()
                    .map(|(tag, values)| {
                        let unit = metrics::spec(&tag).map(|s| s.unit).unwrap_or("");
                        TimesliceMetric {
                            tag,
                            unit: unit.to_string(),
                            stats: MetricStats::from_values(&values),
                        }
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Final statistics for one metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSummaryEntry {
    /// Metric tag
    pub tag: String,
    /// Display name
    pub header: String,
    /// Base unit
    pub unit: String,
    /// Record, aggregate, or derived
    pub kind: MetricKind,
    /// Full statistics (record metrics)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<MetricStats>,
    /// Single value (aggregate and derived metrics)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
}

/// One entry of the API error summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummaryEntry {
    /// The distinct error
    pub error: ErrorDetails,
    /// How many records carried it
    pub count: u64,
}

/// Statistics for one metric within one timeslice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimesliceMetric {
    /// Metric tag
    pub tag: String,
    /// Base unit
    pub unit: String,
    /// Statistics over the slice's values
    pub stats: MetricStats,
}

/// One wall-clock window of profiling records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimesliceSummary {
    /// Slice index
    pub index: u64,
    /// Monotonic window start
    pub start_ns: u64,
    /// Monotonic window end (exclusive)
    pub end_ns: u64,
    /// Per-metric statistics within the window
    pub metrics: Vec<TimesliceMetric>,
}

/// Final output of a benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSummary {
    /// Per-metric results (profiling bucket only)
    pub results: Vec<MetricSummaryEntry>,
    /// Distinct errors and their counts
    pub error_summary: Vec<ErrorSummaryEntry>,
    /// Completed profiling records
    pub completed: u64,
    /// Failed or cancelled profiling records
    pub errors: u64,
    /// Warmup records (excluded from all statistics)
    pub warmup_records: u64,
    /// Monotonic start of the measured window
    pub start_ns: u64,
    /// Monotonic end of the measured window
    pub end_ns: u64,
    /// Measured benchmark duration in seconds
    pub duration_secs: f64,
    /// Which duration rule produced `duration_secs`
    pub duration_measurement: String,
    /// Whether the run was aborted before completing normally
    pub was_aborted: bool,
    /// Timeslice statistics, when slicing was enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeslices: Option<Vec<TimesliceSummary>>,
    /// Every processed record, for the JSONL export
    pub records: Vec<MetricRecord>,
}

impl ProfileSummary {
    /// Look up a metric result by tag
    pub fn get(&self, tag: &str) -> Option<&MetricSummaryEntry> {
        self.results.iter().find(|entry| entry.tag == tag)
    }
}

/// The aggregator service
pub struct Aggregator {
    config: Arc<UserConfig>,
    bus: Arc<MessageBus>,
    metrics_rx: async_channel::Receiver<MetricRecord>,
    returns_tx: async_channel::Sender<CreditReturn>,
    // Subscribed at construction so phase events are never missed; taken
    // by the run loop.
    events: Option<broadcast::Receiver<Event>>,
    harness: ServiceHarness,

    seen: HashSet<String>,
    profiling: PhaseStore,
    warmup: PhaseStore,
    slice: Option<SliceTracker>,
    record_log: Vec<MetricRecord>,
    error_summary: HashMap<ErrorDetails, u64>,
    goodput_count: u64,

    expected_credits: HashMap<CreditPhase, u64>,
    sending_complete: HashMap<CreditPhase, bool>,
    phase_completed: HashSet<CreditPhase>,

    first_start_ns: Option<u64>,
    last_end_ns: Option<u64>,
    live_latency: hdrhistogram::Histogram<u64>,
    was_aborted: bool,
}

impl Aggregator {
    /// Create the aggregator
    pub fn new(config: Arc<UserConfig>, bus: &Arc<MessageBus>, harness: ServiceHarness) -> Self {
        let slice = config
            .load
            .slice_duration
            .map(|duration| SliceTracker::new(duration.as_nanos() as u64));
        Self {
            config,
            bus: Arc::clone(bus),
            metrics_rx: bus.metric_receiver(),
            returns_tx: bus.return_sender(),
            events: Some(bus.subscribe()),
            harness,
            seen: HashSet::new(),
            profiling: PhaseStore::default(),
            warmup: PhaseStore::default(),
            slice,
            record_log: Vec::new(),
            error_summary: HashMap::new(),
            goodput_count: 0,
            expected_credits: HashMap::new(),
            sending_complete: HashMap::new(),
            phase_completed: HashSet::new(),
            first_start_ns: None,
            last_end_ns: None,
            live_latency: hdrhistogram::Histogram::new_with_bounds(1, 3_600_000_000, 3)
                .expect("static histogram bounds are valid"),
            was_aborted: false,
        }
    }

    /// Run until the metric queue closes, then finalize
    pub async fn run(mut self) -> Result<ProfileSummary> {
        if !self.harness.startup_handshake().await? {
            self.was_aborted = true;
            return Ok(self.finalize());
        }
        let heartbeat = self.harness.spawn_heartbeat();
        let result = self.run_loop().await;
        heartbeat.abort();
        match result {
            Ok(()) => self.harness.publish_state(ServiceState::Stopped),
            Err(ref error) => {
                self.harness.publish_failure(error);
                self.was_aborted = true;
            }
        }
        Ok(self.finalize())
    }

    async fn run_loop(&mut self) -> Result<()> {
        let shutdown = self.harness.shutdown();
        let metrics_rx = self.metrics_rx.clone();
        let mut events = self
            .events
            .take()
            .ok_or_else(|| Error::Internal("aggregator event stream already taken".into()))?;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Aborted or grace period expired: finalize what we have
                    self.was_aborted = true;
                    return Ok(());
                }

                event = events.recv() => {
                    match event {
                        Ok(event) => self.observe_event(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "aggregator event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }

                record = metrics_rx.recv() => match record {
                    Ok(record) => self.seal(record).await?,
                    // Queue closed: every processor has drained and exited
                    Err(_) => return Ok(()),
                },
            }
        }
    }

    fn observe_event(&mut self, event: &Event) {
        match event {
            Event::CreditPhaseStarted { phase, expected } => {
                if let Some(expected) = expected {
                    self.expected_credits.insert(*phase, *expected);
                }
            }
            Event::CreditPhaseSendingComplete { phase, sent } => {
                self.expected_credits.insert(*phase, *sent);
                self.sending_complete.insert(*phase, true);
                self.check_phase_completion(*phase);
            }
            _ => {}
        }
    }

    /// A record enters aggregation exactly once
    async fn seal(&mut self, record: MetricRecord) -> Result<()> {
        if !self.seen.insert(record.metadata.x_request_id.clone()) {
            tracing::debug!(
                x_request_id = %record.metadata.x_request_id,
                "duplicate record dropped"
            );
            return Ok(());
        }

        let phase = record.metadata.benchmark_phase;
        if let Some(error) = &record.error {
            *self.error_summary.entry(error.clone()).or_insert(0) += 1;
        }

        match phase {
            CreditPhase::Warmup => self.warmup.observe(&record),
            CreditPhase::Profiling => {
                self.profiling.observe(&record);
                self.first_start_ns = Some(
                    self.first_start_ns
                        .map_or(record.metadata.request_start_ns, |v| {
                            v.min(record.metadata.request_start_ns)
                        }),
                );
                self.last_end_ns = Some(
                    self.last_end_ns
                        .map_or(record.metadata.request_end_ns, |v| {
                            v.max(record.metadata.request_end_ns)
                        }),
                );
                if let Some(latency) = record.scalar(tag::REQUEST_LATENCY) {
                    let _ = self.live_latency.record((latency * 1000.0) as u64);
                }
                if record.error.is_none() && !self.config.goodput.is_empty() {
                    if meets_slos(&record, &self.config.goodput) {
                        self.goodput_count += 1;
                    }
                }
                if let Some(slice) = &mut self.slice {
                    slice.observe(&record);
                }
            }
        }

        let final_turn = record.metadata.final_turn;
        self.record_log.push(record);

        // Sealing the final turn frees the conversation's credit, which is
        // what lets the concurrency-mode scheduler release the next one.
        if final_turn {
            self.returns_tx
                .send(CreditReturn { phase })
                .await
                .map_err(|_| Error::ChannelClosed("credit returns"))?;
        }

        let store = match phase {
            CreditPhase::Warmup => &self.warmup,
            CreditPhase::Profiling => &self.profiling,
        };
        if store.records() % PROGRESS_EVERY == 0 {
            self.publish_progress(phase);
        }
        self.check_phase_completion(phase);
        Ok(())
    }

    fn store(&self, phase: CreditPhase) -> &PhaseStore {
        match phase {
            CreditPhase::Warmup => &self.warmup,
            CreditPhase::Profiling => &self.profiling,
        }
    }

    fn check_phase_completion(&mut self, phase: CreditPhase) {
        if self.phase_completed.contains(&phase) {
            return;
        }
        let complete = self.sending_complete.get(&phase).copied().unwrap_or(false)
            && self
                .expected_credits
                .get(&phase)
                .is_some_and(|&expected| self.store(phase).final_turns >= expected);
        if complete {
            self.phase_completed.insert(phase);
            self.bus.publish(Event::CreditPhaseComplete {
                phase,
                completed: self.store(phase).records(),
            });
        }
    }

    fn publish_progress(&self, phase: CreditPhase) {
        let store = self.store(phase);
        self.bus.publish(Event::Progress(ProgressSnapshot {
            phase,
            completed: store.completed,
            errors: store.errors,
            expected: self.expected_credits.get(&phase).copied(),
            p50_latency_ms: self.live_latency.value_at_quantile(0.50) as f64 / 1000.0,
            p99_latency_ms: self.live_latency.value_at_quantile(0.99) as f64 / 1000.0,
        }));
    }

    /// Compute the final summary from the profiling bucket
    fn finalize(self) -> ProfileSummary {
        let start_ns = self.first_start_ns.unwrap_or(0);
        let end_ns = self.last_end_ns.unwrap_or(start_ns);
        let duration_secs = ns_to_secs(end_ns.saturating_sub(start_ns));

        let mut results = Vec::new();
        for spec in metrics::registry() {
            match spec.kind {
                MetricKind::Record => {
                    if let Some(values) = self.profiling.vectors.get(spec.tag) {
                        if !values.is_empty() {
                            results.push(MetricSummaryEntry {
                                tag: spec.tag.to_string(),
                                header: spec.header.to_string(),
                                unit: spec.unit.to_string(),
                                kind: spec.kind,
                                stats: Some(MetricStats::from_values(values)),
                                total: None,
                            });
                        }
                    }
                }
                MetricKind::Aggregate => {
                    let total = match spec.tag {
                        tag::REQUEST_COUNT => self.profiling.completed as f64,
                        tag::ERROR_REQUEST_COUNT => self.profiling.errors as f64,
                        _ => continue,
                    };
                    results.push(MetricSummaryEntry {
                        tag: spec.tag.to_string(),
                        header: spec.header.to_string(),
                        unit: spec.unit.to_string(),
                        kind: spec.kind,
                        stats: None,
                        total: Some(total),
                    });
                }
                MetricKind::Derived => {}
            }
        }

        let inputs = DerivedInputs {
            benchmark_duration_secs: duration_secs,
            completed_requests: self.profiling.completed,
            error_requests: self.profiling.errors,
            output_token_sum: self
                .profiling
                .vectors
                .get(tag::OUTPUT_TOKEN_COUNT)
                .map(|values| values.iter().sum())
                .unwrap_or(0.0),
            goodput_count: (!self.config.goodput.is_empty()).then_some(self.goodput_count),
        };
        for spec in metrics::derived_in_order() {
            let resolve = spec.derive.expect("derived metrics always have a resolver");
            if let Some(total) = resolve(&inputs) {
                results.push(MetricSummaryEntry {
                    tag: spec.tag.to_string(),
                    header: spec.header.to_string(),
                    unit: spec.unit.to_string(),
                    kind: spec.kind,
                    stats: None,
                    total: Some(total),
                });
            }
        }

        let mut error_summary: Vec<ErrorSummaryEntry> = self
            .error_summary
            .into_iter()
            .map(|(error, count)| ErrorSummaryEntry { error, count })
            .collect();
        error_summary.sort_by(|a, b| b.count.cmp(&a.count));

        ProfileSummary {
            results,
            error_summary,
            completed: self.profiling.completed,
            errors: self.profiling.errors,
            warmup_records: self.warmup.records(),
            start_ns,
            end_ns,
            duration_secs,
            duration_measurement: DURATION_MEASUREMENT.to_string(),
            was_aborted: self.was_aborted,
            timeslices: self.slice.map(SliceTracker::finalize),
            records: self.record_log,
        }
    }
}

/// All configured SLO predicates must hold; a record missing one of the
/// named metrics does not count toward goodput.
fn meets_slos(record: &MetricRecord, slos: &[SloPredicate]) -> bool {
    slos.iter().all(|slo| {
        record
            .values
            .get(&slo.tag)
            .and_then(MetricValue::as_scalar)
            .is_some_and(|value| value <= slo.threshold)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Command;
    use crate::metrics::MetricRecordMetadata;
    use crate::service::{ServiceId, ServiceKind};
    use tokio_util::sync::CancellationToken;

    fn record(
        x_request_id: &str,
        phase: CreditPhase,
        start_ns: u64,
        end_ns: u64,
        latency_ms: f64,
    ) -> MetricRecord {
        let mut values = BTreeMap::new();
        values.insert(
            tag::REQUEST_LATENCY.to_string(),
            MetricValue::Scalar(latency_ms),
        );
        values.insert(tag::OUTPUT_TOKEN_COUNT.to_string(), MetricValue::Scalar(5.0));
        MetricRecord {
            metadata: MetricRecordMetadata {
                session_num: 0,
                x_request_id: x_request_id.to_string(),
                x_correlation_id: "conv".to_string(),
                conversation_id: "conv".into(),
                turn_index: 0,
                final_turn: true,
                request_start_ns: start_ns,
                request_ack_ns: None,
                request_end_ns: end_ns,
                timestamp_ns: 0,
                worker_id: 0,
                record_processor_id: 0,
                benchmark_phase: phase,
                was_cancelled: false,
                cancellation_time_ns: None,
            },
            values,
            error: None,
        }
    }

    struct Rig {
        bus: Arc<MessageBus>,
        handle: tokio::task::JoinHandle<Result<ProfileSummary>>,
    }

    fn spawn_aggregator(config: UserConfig) -> Rig {
        let bus = Arc::new(MessageBus::default());
        let harness = ServiceHarness::new(
            ServiceId::new(ServiceKind::Aggregator, 0),
            &bus,
            CancellationToken::new(),
        );
        let aggregator = Aggregator::new(Arc::new(config), &bus, harness);
        let handle = tokio::spawn(aggregator.run());
        bus.broadcast_command(Command::Configure);
        bus.broadcast_command(Command::Start);
        Rig { bus, handle }
    }

    fn test_config() -> UserConfig {
        let mut config = UserConfig::default();
        config.endpoint.model = "test-model".to_string();
        config
    }

    #[tokio::test]
    async fn test_dedupe_and_counts() {
        let rig = spawn_aggregator(test_config());
        let tx = rig.bus.metric_sender();

        tx.send(record("a", CreditPhase::Profiling, 0, 1_000_000_000, 10.0))
            .await
            .unwrap();
        // Same x_request_id delivered twice: at-least-once transport
        tx.send(record("a", CreditPhase::Profiling, 0, 1_000_000_000, 10.0))
            .await
            .unwrap();
        tx.send(record("b", CreditPhase::Profiling, 0, 2_000_000_000, 20.0))
            .await
            .unwrap();
        tx.close();

        let summary = rig.handle.await.unwrap().unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.records.len(), 2);
        let latency = summary.get(tag::REQUEST_LATENCY).unwrap();
        assert_eq!(latency.stats.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_warmup_excluded_from_statistics() {
        let rig = spawn_aggregator(test_config());
        let tx = rig.bus.metric_sender();

        tx.send(record("w", CreditPhase::Warmup, 0, 1_000_000_000, 999.0))
            .await
            .unwrap();
        tx.send(record("p", CreditPhase::Profiling, 0, 1_000_000_000, 10.0))
            .await
            .unwrap();
        tx.close();

        let summary = rig.handle.await.unwrap().unwrap();
        assert_eq!(summary.warmup_records, 1);
        assert_eq!(summary.completed, 1);
        let stats = summary.get(tag::REQUEST_LATENCY).unwrap().stats.unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.max, 10.0);
    }

    #[tokio::test]
    async fn test_derived_throughputs() {
        let rig = spawn_aggregator(test_config());
        let tx = rig.bus.metric_sender();

        // 4 records of 5 output tokens over a 2-second window
        for (index, start) in [0u64, 500_000_000, 1_000_000_000, 1_500_000_000]
            .iter()
            .enumerate()
        {
            tx.send(record(
                &format!("r{index}"),
                CreditPhase::Profiling,
                *start,
                start + 500_000_000,
                10.0,
            ))
            .await
            .unwrap();
        }
        tx.close();

        let summary = rig.handle.await.unwrap().unwrap();
        assert!((summary.duration_secs - 2.0).abs() < 1e-9);
        let throughput = summary.get(tag::REQUEST_THROUGHPUT).unwrap().total.unwrap();
        assert!((throughput - 2.0).abs() < 1e-9);
        let token_throughput = summary
            .get(tag::OUTPUT_TOKEN_THROUGHPUT)
            .unwrap()
            .total
            .unwrap();
        assert!((token_throughput - 10.0).abs() < 1e-9);
        assert_eq!(summary.duration_measurement, DURATION_MEASUREMENT);
    }

    #[tokio::test]
    async fn test_goodput_counts_slo_satisfying_records() {
        let mut config = test_config();
        config.goodput = vec![SloPredicate {
            tag: tag::REQUEST_LATENCY.to_string(),
            threshold: 15.0,
        }];
        let rig = spawn_aggregator(config);
        let tx = rig.bus.metric_sender();

        tx.send(record("fast", CreditPhase::Profiling, 0, 1_000_000_000, 10.0))
            .await
            .unwrap();
        tx.send(record("slow", CreditPhase::Profiling, 0, 2_000_000_000, 50.0))
            .await
            .unwrap();
        tx.close();

        let summary = rig.handle.await.unwrap().unwrap();
        let goodput = summary.get(tag::GOODPUT).unwrap().total.unwrap();
        // 1 satisfying record over 2 seconds
        assert!((goodput - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_timeslice_assignment() {
        let mut config = test_config();
        config.load.slice_duration = Some(std::time::Duration::from_secs(1));
        config.load.benchmark_duration = Some(std::time::Duration::from_secs(60));
        let rig = spawn_aggregator(config);
        let tx = rig.bus.metric_sender();

        // anchor at 0; ends at 0.5s, 1.5s, 1.7s -> slices 0, 1, 1
        for (id, end) in [
            ("a", 500_000_000u64),
            ("b", 1_500_000_000),
            ("c", 1_700_000_000),
        ] {
            tx.send(record(id, CreditPhase::Profiling, 0, end, 10.0))
                .await
                .unwrap();
        }
        tx.close();

        let summary = rig.handle.await.unwrap().unwrap();
        let slices = summary.timeslices.unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].index, 0);
        assert_eq!(slices[1].index, 1);
        let slice_latency = slices[1]
            .metrics
            .iter()
            .find(|m| m.tag == tag::REQUEST_LATENCY)
            .unwrap();
        assert_eq!(slice_latency.stats.count, 2);
        // each record's end falls within its slice window
        assert!(slices[1].start_ns <= 1_500_000_000 && 1_500_000_000 < slices[1].end_ns);
    }

    #[tokio::test]
    async fn test_credit_returned_on_final_turn() {
        let rig = spawn_aggregator(test_config());
        let tx = rig.bus.metric_sender();
        let returns = rig.bus.return_receiver();

        let mut first = record("t0", CreditPhase::Profiling, 0, 1_000_000, 1.0);
        first.metadata.final_turn = false;
        first.metadata.turn_index = 0;
        tx.send(first).await.unwrap();
        let mut last = record("t1", CreditPhase::Profiling, 0, 2_000_000, 1.0);
        last.metadata.turn_index = 1;
        tx.send(last).await.unwrap();
        tx.close();

        let _ = rig.handle.await.unwrap().unwrap();
        // Exactly one return for the two-turn conversation
        assert_eq!(returns.recv().await.unwrap().phase, CreditPhase::Profiling);
        assert!(returns.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_summary_groups_by_details() {
        let rig = spawn_aggregator(test_config());
        let tx = rig.bus.metric_sender();

        for index in 0..3 {
            let mut bad = record(
                &format!("e{index}"),
                CreditPhase::Profiling,
                0,
                1_000_000,
                1.0,
            );
            bad.error = Some(ErrorDetails::http(503, "overloaded"));
            bad.values.clear();
            tx.send(bad).await.unwrap();
        }
        tx.close();

        let summary = rig.handle.await.unwrap().unwrap();
        assert_eq!(summary.errors, 3);
        assert_eq!(summary.error_summary.len(), 1);
        assert_eq!(summary.error_summary[0].count, 3);
        assert_eq!(summary.error_summary[0].error.code, Some(503));
    }

    #[tokio::test]
    async fn test_phase_complete_event() {
        let rig = spawn_aggregator(test_config());
        let tx = rig.bus.metric_sender();
        let mut events = rig.bus.subscribe();

        rig.bus.publish(Event::CreditPhaseSendingComplete {
            phase: CreditPhase::Profiling,
            sent: 1,
        });
        tx.send(record("only", CreditPhase::Profiling, 0, 1_000_000, 1.0))
            .await
            .unwrap();

        let completion = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Ok(Event::CreditPhaseComplete { phase, completed }) = events.recv().await {
                    return (phase, completed);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(completion, (CreditPhase::Profiling, 1));

        tx.close();
        let _ = rig.handle.await.unwrap().unwrap();
    }
}
