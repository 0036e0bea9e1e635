//! Typed in-process message bus
//!
//! Four transport patterns connect the services of a run:
//!
//! - **Pub/Sub** (`tokio::broadcast`): control events, phase transitions,
//!   heartbeats, progress.
//! - **Push/Pull** (bounded `async-channel` MPMC queues): credits from the
//!   scheduler to the worker pool, raw records from workers to the record
//!   processors, metric records from processors to the aggregator, and
//!   credit returns from the aggregator back to the scheduler. Bounded
//!   capacities make back-pressure observable: a slow consumer blocks its
//!   producers.
//! - **Request/Reply** (`mpsc` carrying oneshot reply handles): dataset
//!   lookups.
//! - **Command** (broadcast envelope + ack stream): controller-issued
//!   commands with awaited acknowledgements.
//!
//! Messages carry a `message_type` discriminator when serialized. Delivery
//! is at-least-once within a run; the aggregator deduplicates records on
//! `x_request_id`. Ordering holds per producer per channel, not across
//! producers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::controller::RunPhase;
use crate::error::{Error, ErrorDetails, ErrorKind, Result};
use crate::metrics::MetricRecord;
use crate::model::{Conversation, ConversationId, Credit, CreditPhase, RawRequestRecord};
use crate::service::{ServiceId, ServiceState};

/// Bounded queue capacities for the push/pull channels
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Scheduler -> workers
    pub credit_capacity: usize,
    /// Workers -> record processors
    pub record_capacity: usize,
    /// Record processors -> aggregator
    pub metric_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            credit_capacity: 1024,
            record_capacity: 8192,
            metric_capacity: 8192,
        }
    }
}

/// Broadcast events published on the pub/sub channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum Event {
    /// The controller advanced the run phase
    PhaseChanged {
        /// New phase
        phase: RunPhase,
    },
    /// Periodic service liveness report
    Heartbeat {
        /// Reporting service
        service: ServiceId,
        /// Its lifecycle state
        state: ServiceState,
    },
    /// A service hit an unrecoverable error
    ServiceFailed {
        /// Failing service
        service: ServiceId,
        /// What went wrong
        error: ErrorDetails,
    },
    /// The scheduler began issuing credits for a phase
    CreditPhaseStarted {
        /// Warmup or profiling
        phase: CreditPhase,
        /// Expected credit count, when known up front
        expected: Option<u64>,
    },
    /// The scheduler issued the last credit of a phase
    CreditPhaseSendingComplete {
        /// Warmup or profiling
        phase: CreditPhase,
        /// Credits issued in the phase
        sent: u64,
    },
    /// The aggregator sealed every expected record of a phase
    CreditPhaseComplete {
        /// Warmup or profiling
        phase: CreditPhase,
        /// Records sealed in the phase
        completed: u64,
    },
    /// Periodic aggregation progress
    Progress(ProgressSnapshot),
}

/// Live aggregation counters for progress display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Phase the counters apply to
    pub phase: CreditPhase,
    /// Records sealed so far
    pub completed: u64,
    /// Error records sealed so far
    pub errors: u64,
    /// Expected records, when known
    pub expected: Option<u64>,
    /// Approximate median request latency so far (ms)
    pub p50_latency_ms: f64,
    /// Approximate p99 request latency so far (ms)
    pub p99_latency_ms: f64,
}

/// Credit returned to the scheduler after its conversation completed
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreditReturn {
    /// Phase of the returned credit
    pub phase: CreditPhase,
}

/// Commands the controller issues to services.
///
/// Shutdown is not a command: cancellation propagates through the run's
/// `CancellationToken` so it reaches tasks that are mid-request, not just
/// ones polling the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Apply configuration; services ack when ready to start
    Configure,
    /// Begin the run
    Start,
}

/// A command with its correlation id
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Correlates acks to the issuing command
    pub command_id: u64,
    /// The command itself
    pub command: Command,
}

/// Acknowledgement of a command by one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    /// Command being acknowledged
    pub command_id: u64,
    /// Acknowledging service
    pub service: ServiceId,
}

/// Request/reply messages served by the dataset provider
#[derive(Debug)]
pub enum DatasetRequest {
    /// Look up a conversation by id
    GetById {
        /// Conversation to fetch
        id: ConversationId,
        /// Reply handle
        reply: oneshot::Sender<Option<Arc<Conversation>>>,
    },
    /// Draw the next conversation id under the configured sampler policy
    NextId {
        /// Reply handle
        reply: oneshot::Sender<Option<ConversationId>>,
    },
    /// The full `(timestamp_ms, id)` schedule for trace replay, sorted
    TimedSchedule {
        /// Reply handle
        reply: oneshot::Sender<Vec<(i64, ConversationId)>>,
    },
    /// Number of conversations in the pool
    Count {
        /// Reply handle
        reply: oneshot::Sender<usize>,
    },
}

/// Client handle for the dataset request/reply channel
#[derive(Debug, Clone)]
pub struct DatasetHandle {
    tx: mpsc::Sender<DatasetRequest>,
}

impl DatasetHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DatasetRequest,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::ChannelClosed("dataset requests"))?;
        reply_rx
            .await
            .map_err(|_| Error::ChannelClosed("dataset reply"))
    }

    /// Fetch a conversation by id; a miss is reported as request-level
    /// error details so the worker can emit an error record.
    pub async fn get_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<std::result::Result<Arc<Conversation>, ErrorDetails>> {
        let id = id.clone();
        let found = self
            .call(|reply| DatasetRequest::GetById {
                id: id.clone(),
                reply,
            })
            .await?;
        Ok(found.ok_or_else(|| {
            ErrorDetails::new(
                ErrorKind::DatasetError,
                format!("conversation '{id}' not found"),
            )
        }))
    }

    /// Draw the next conversation id under the sampler policy
    pub async fn next_id(&self) -> Result<ConversationId> {
        self.call(|reply| DatasetRequest::NextId { reply })
            .await?
            .ok_or(Error::Dataset("dataset is empty".into()))
    }

    /// Sorted `(timestamp_ms, id)` pairs for fixed-schedule mode
    pub async fn timed_schedule(&self) -> Result<Vec<(i64, ConversationId)>> {
        self.call(|reply| DatasetRequest::TimedSchedule { reply })
            .await
    }

    /// Number of conversations in the pool
    pub async fn count(&self) -> Result<usize> {
        self.call(|reply| DatasetRequest::Count { reply }).await
    }
}

/// The bus instance shared by all services of one run
pub struct MessageBus {
    events_tx: broadcast::Sender<Event>,
    commands_tx: broadcast::Sender<CommandEnvelope>,
    next_command_id: AtomicU64,
    acks_tx: mpsc::Sender<CommandAck>,
    acks_rx: Mutex<Option<mpsc::Receiver<CommandAck>>>,
    credits: (async_channel::Sender<Credit>, async_channel::Receiver<Credit>),
    records: (
        async_channel::Sender<RawRequestRecord>,
        async_channel::Receiver<RawRequestRecord>,
    ),
    metrics: (
        async_channel::Sender<MetricRecord>,
        async_channel::Receiver<MetricRecord>,
    ),
    returns: (
        async_channel::Sender<CreditReturn>,
        async_channel::Receiver<CreditReturn>,
    ),
    dataset_tx: mpsc::Sender<DatasetRequest>,
    dataset_rx: Mutex<Option<mpsc::Receiver<DatasetRequest>>>,
}

impl MessageBus {
    /// Create a bus with the given queue bounds
    pub fn new(queues: QueueConfig) -> Self {
        let (events_tx, _) = broadcast::channel(4096);
        let (commands_tx, _) = broadcast::channel(64);
        let (acks_tx, acks_rx) = mpsc::channel(256);
        let (dataset_tx, dataset_rx) = mpsc::channel(256);
        Self {
            events_tx,
            commands_tx,
            next_command_id: AtomicU64::new(0),
            acks_tx,
            acks_rx: Mutex::new(Some(acks_rx)),
            credits: async_channel::bounded(queues.credit_capacity),
            records: async_channel::bounded(queues.record_capacity),
            metrics: async_channel::bounded(queues.metric_capacity),
            // Returns are bounded by issued credits and consumed lazily in
            // rate mode, so an explicit bound would only risk a deadlock.
            returns: async_channel::unbounded(),
            dataset_tx,
            dataset_rx: Mutex::new(Some(dataset_rx)),
        }
    }

    /// Publish an event; dropped silently when nobody subscribes
    pub fn publish(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    /// Subscribe to the pub/sub channel
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Broadcast a command; returns its correlation id
    pub fn broadcast_command(&self, command: Command) -> u64 {
        let command_id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.commands_tx.send(CommandEnvelope {
            command_id,
            command,
        });
        command_id
    }

    /// Subscribe to the command channel
    pub fn command_receiver(&self) -> broadcast::Receiver<CommandEnvelope> {
        self.commands_tx.subscribe()
    }

    /// Sender half services use to acknowledge commands
    pub fn ack_sender(&self) -> mpsc::Sender<CommandAck> {
        self.acks_tx.clone()
    }

    /// The ack stream; the controller takes this exactly once
    pub fn take_ack_receiver(&self) -> Option<mpsc::Receiver<CommandAck>> {
        self.acks_rx.lock().expect("ack receiver lock").take()
    }

    /// Producer half of the credit queue
    pub fn credit_sender(&self) -> async_channel::Sender<Credit> {
        self.credits.0.clone()
    }

    /// Consumer half of the credit queue
    pub fn credit_receiver(&self) -> async_channel::Receiver<Credit> {
        self.credits.1.clone()
    }

    /// Producer half of the raw record queue
    pub fn record_sender(&self) -> async_channel::Sender<RawRequestRecord> {
        self.records.0.clone()
    }

    /// Consumer half of the raw record queue
    pub fn record_receiver(&self) -> async_channel::Receiver<RawRequestRecord> {
        self.records.1.clone()
    }

    /// Producer half of the metric record queue
    pub fn metric_sender(&self) -> async_channel::Sender<MetricRecord> {
        self.metrics.0.clone()
    }

    /// Consumer half of the metric record queue
    pub fn metric_receiver(&self) -> async_channel::Receiver<MetricRecord> {
        self.metrics.1.clone()
    }

    /// Producer half of the credit return queue
    pub fn return_sender(&self) -> async_channel::Sender<CreditReturn> {
        self.returns.0.clone()
    }

    /// Consumer half of the credit return queue
    pub fn return_receiver(&self) -> async_channel::Receiver<CreditReturn> {
        self.returns.1.clone()
    }

    /// Client handle for dataset lookups
    pub fn dataset_handle(&self) -> DatasetHandle {
        DatasetHandle {
            tx: self.dataset_tx.clone(),
        }
    }

    /// The dataset request stream; the dataset service takes this once
    pub fn take_dataset_receiver(&self) -> Option<mpsc::Receiver<DatasetRequest>> {
        self.dataset_rx.lock().expect("dataset receiver lock").take()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
