//! Record processor pool
//!
//! Processors transform raw request records into per-metric values. They
//! are stateless per record and load-balanced over the raw record queue:
//! the response is parsed once, then every registered record metric
//! extracts its value from the shared view. Failed or cancelled attempts
//! produce metadata-only records carrying `error_isl`, so wasted input
//! tokens remain countable without polluting latency statistics.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::metrics::{self, tag, MetricRecord, MetricValue};
use crate::model::RawRequestRecord;
use crate::service::{ServiceHarness, ServiceState};
use crate::tokenizer::TokenizerRef;

/// One member of the record processor pool
pub struct RecordProcessor {
    id: usize,
    tokenizer: TokenizerRef,
    prefer_usage: bool,
    records: async_channel::Receiver<RawRequestRecord>,
    metrics: async_channel::Sender<MetricRecord>,
    harness: ServiceHarness,
}

impl RecordProcessor {
    /// Create a processor
    pub fn new(
        id: usize,
        tokenizer: TokenizerRef,
        prefer_usage: bool,
        records: async_channel::Receiver<RawRequestRecord>,
        metrics: async_channel::Sender<MetricRecord>,
        harness: ServiceHarness,
    ) -> Self {
        Self {
            id,
            tokenizer,
            prefer_usage,
            records,
            metrics,
            harness,
        }
    }

    /// Run until the raw record queue closes
    pub async fn run(mut self) -> Result<()> {
        if !self.harness.startup_handshake().await? {
            return Ok(());
        }
        let heartbeat = self.harness.spawn_heartbeat();
        let result = self.run_loop().await;
        heartbeat.abort();
        match &result {
            Ok(()) => self.harness.publish_state(ServiceState::Stopped),
            Err(error) => self.harness.publish_failure(error),
        }
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        let shutdown = self.harness.shutdown();
        let mut processed: u64 = 0;
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                record = self.records.recv() => match record {
                    Ok(record) => {
                        let metric_record = self.process(&record);
                        self.metrics
                            .send(metric_record)
                            .await
                            .map_err(|_| Error::ChannelClosed("metric records"))?;
                        processed += 1;
                    }
                    Err(_) => break,
                },
            }
        }
        tracing::debug!(processor_id = self.id, processed, "record processor finished");
        Ok(())
    }

    /// Turn one raw record into a metric record
    pub fn process(&self, record: &RawRequestRecord) -> MetricRecord {
        let metadata = MetricRecord::metadata_from(record, self.id);

        if record.is_ok() {
            MetricRecord {
                metadata,
                values: metrics::extract_record_metrics(
                    record,
                    self.tokenizer.as_ref(),
                    self.prefer_usage,
                ),
                error: None,
            }
        } else {
            let mut values = BTreeMap::new();
            let error_isl = record
                .input_length_hint
                .unwrap_or_else(|| self.tokenizer.count(&record.input_text));
            values.insert(
                tag::ERROR_ISL.to_string(),
                MetricValue::Scalar(error_isl as f64),
            );
            MetricRecord {
                metadata,
                values,
                error: record.error.clone(),
            }
        }
    }
}
