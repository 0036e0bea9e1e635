//! Worker execution loop

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::DatasetHandle;
use crate::client::{HistoryEntry, InferenceClient, TurnRequest};
use crate::clock::RunClock;
use crate::error::{Error, Result};
use crate::model::{Conversation, Credit, ParsedResponse, RawRequestRecord, Role};
use crate::service::{ServiceHarness, ServiceState};

/// One member of the worker pool.
///
/// A worker pulls credits and executes each one as its own task, up to
/// `concurrency` credits at a time. Overall request concurrency is
/// governed by the scheduler; the per-worker ceiling only has to be high
/// enough that the pool as a whole can hold the configured concurrency.
pub struct Worker {
    shared: Arc<WorkerShared>,
    credits: async_channel::Receiver<Credit>,
    concurrency: usize,
    harness: ServiceHarness,
}

/// Per-credit state shared with spawned credit tasks
struct WorkerShared {
    id: usize,
    client: Arc<dyn InferenceClient>,
    dataset: DatasetHandle,
    records: async_channel::Sender<RawRequestRecord>,
    clock: Arc<RunClock>,
    model: String,
    streaming: bool,
    shutdown: CancellationToken,
    completed: AtomicU64,
    errors: AtomicU64,
}

impl Worker {
    /// Create a worker
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        client: Arc<dyn InferenceClient>,
        dataset: DatasetHandle,
        credits: async_channel::Receiver<Credit>,
        records: async_channel::Sender<RawRequestRecord>,
        clock: Arc<RunClock>,
        model: String,
        streaming: bool,
        concurrency: usize,
        harness: ServiceHarness,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            id,
            client,
            dataset,
            records,
            clock,
            model,
            streaming,
            shutdown: harness.shutdown(),
            completed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        });
        Self {
            shared,
            credits,
            concurrency: concurrency.max(1),
            harness,
        }
    }

    /// Run the worker until the credit queue closes or shutdown fires
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
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        tracing::debug!(
            worker_id = self.shared.id,
            concurrency = self.concurrency,
            "worker started"
        );
        loop {
            // The permit is taken before pulling a credit, so a saturated
            // worker leaves queued credits for its idle siblings.
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.expect("worker semaphore is never closed")
                }
            };

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                credit = self.credits.recv() => match credit {
                    Ok(credit) => {
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            match shared.process_credit(credit).await {
                                Ok(true) => {
                                    shared.completed.fetch_add(1, Ordering::Relaxed);
                                }
                                Ok(false) => {
                                    shared.errors.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(error) => {
                                    shared.errors.fetch_add(1, Ordering::Relaxed);
                                    tracing::debug!(
                                        worker_id = shared.id,
                                        error = %error,
                                        "credit task ended early"
                                    );
                                }
                            }
                            drop(permit);
                        });
                    }
                    // Queue closed: the scheduler is done and all credits
                    // are drained.
                    Err(_) => break,
                },
            }
        }

        // Wait for in-flight credit tasks to finish (or shutdown)
        tokio::select! {
            _ = shutdown.cancelled() => {}
            permits = semaphore.acquire_many(self.concurrency as u32) => {
                permits.expect("worker semaphore is never closed").forget();
            }
        }

        tracing::debug!(
            worker_id = self.shared.id,
            completed = self.shared.completed.load(Ordering::Relaxed),
            errors = self.shared.errors.load(Ordering::Relaxed),
            "worker finished"
        );
        Ok(())
    }
}

impl WorkerShared {
    /// Execute every turn of the credit's conversation.
    ///
    /// Returns whether all turns completed without error. Queue failures
    /// bubble up as service errors; request failures become error records.
    async fn process_credit(&self, credit: Credit) -> Result<bool> {
        let conversation = match self.dataset.get_by_id(&credit.conversation_id).await? {
            Ok(conversation) => conversation,
            Err(details) => {
                self.emit(self.lookup_failure_record(&credit, details)).await?;
                return Ok(false);
            }
        };

        let correlation_id = Uuid::new_v4().to_string();
        let mut history: Vec<HistoryEntry> = Vec::new();
        let mut all_ok = true;
        let turn_count = conversation.turns.len();

        for (turn_index, turn) in conversation.turns.iter().enumerate() {
            // Think-time before every turn but the first
            if turn_index > 0 {
                if let Some(delay_ms) =
                    conversation.turns[turn_index - 1].delay_after_ms.filter(|&d| d > 0)
                {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }

            let request = TurnRequest {
                x_request_id: Uuid::new_v4().to_string(),
                x_correlation_id: correlation_id.clone(),
                model: turn.model.clone().unwrap_or_else(|| self.model.clone()),
                turn: turn.clone(),
                history: history.clone(),
                streaming: self.streaming,
            };

            let record = self
                .execute_turn(&credit, &conversation, turn_index, turn_count, &request)
                .await;

            let ok = record.is_ok();
            let assistant_text = record.response.final_text();
            self.emit(record).await?;

            all_ok &= ok;
            history.push(HistoryEntry {
                role: Role::User,
                text: turn.text.clone(),
            });
            if ok && !assistant_text.is_empty() {
                history.push(HistoryEntry {
                    role: Role::Assistant,
                    text: assistant_text,
                });
            }
        }
        Ok(all_ok)
    }

    /// Send one request with the two extra completion paths: the
    /// cancellation timer and run shutdown. The in-flight exchange is
    /// dropped (aborted) when either fires, and the cancel timestamp is
    /// taken only after the abort.
    async fn execute_turn(
        &self,
        credit: &Credit,
        conversation: &Conversation,
        turn_index: usize,
        turn_count: usize,
        request: &TurnRequest,
    ) -> RawRequestRecord {
        let timer_start_ns = self.clock.now_ns();
        let wall_start_ns = self.clock.wall_now_ns();

        let outcome = if let Some(cancel_after) = credit.cancel_after {
            tokio::select! {
                outcome = self.client.send(request) => Some(outcome),
                _ = tokio::time::sleep(cancel_after) => None,
                _ = self.shutdown.cancelled() => None,
            }
        } else {
            tokio::select! {
                outcome = self.client.send(request) => Some(outcome),
                _ = self.shutdown.cancelled() => None,
            }
        };

        let mut record = match outcome {
            Some(outcome) => RawRequestRecord {
                x_request_id: request.x_request_id.clone(),
                x_correlation_id: request.x_correlation_id.clone(),
                conversation_id: conversation.id.clone(),
                turn_index,
                final_turn: turn_index + 1 == turn_count,
                session_num: conversation.session_num,
                worker_id: self.id,
                phase: credit.phase,
                start_ns: outcome.start_ns,
                ack_ns: outcome.ack_ns,
                end_ns: outcome.end_ns,
                streamed: outcome.streamed,
                status: outcome.status,
                response: outcome.response,
                input_text: self.client.prompt_text(request),
                input_length_hint: request.turn.input_ids.as_ref().map(Vec::len),
                was_cancelled: false,
                cancellation_time_ns: None,
                credit_drop_latency_ns: None,
                error: outcome.error,
                timestamp_wall_ns: wall_start_ns,
            },
            None => {
                // The send future was dropped, which aborts the exchange;
                // only then is the cancel timestamp taken.
                let cancellation_ns = self.clock.now_ns();
                let delay = credit.cancel_after.unwrap_or(Duration::ZERO);
                RawRequestRecord {
                    x_request_id: request.x_request_id.clone(),
                    x_correlation_id: request.x_correlation_id.clone(),
                    conversation_id: conversation.id.clone(),
                    turn_index,
                    final_turn: turn_index + 1 == turn_count,
                    session_num: conversation.session_num,
                    worker_id: self.id,
                    phase: credit.phase,
                    start_ns: timer_start_ns,
                    ack_ns: None,
                    end_ns: cancellation_ns,
                    streamed: false,
                    status: None,
                    response: ParsedResponse::default(),
                    input_text: self.client.prompt_text(request),
                    input_length_hint: request.turn.input_ids.as_ref().map(Vec::len),
                    was_cancelled: true,
                    cancellation_time_ns: Some(cancellation_ns),
                    credit_drop_latency_ns: None,
                    error: Some(crate::error::ErrorDetails::cancelled(delay)),
                    timestamp_wall_ns: wall_start_ns,
                }
            }
        };

        if turn_index == 0 {
            record.credit_drop_latency_ns = Some(record.start_ns.saturating_sub(credit.issued_ns));
        }
        record
    }

    /// Error record for a conversation that could not be fetched
    fn lookup_failure_record(
        &self,
        credit: &Credit,
        details: crate::error::ErrorDetails,
    ) -> RawRequestRecord {
        let now = self.clock.now_ns();
        RawRequestRecord {
            x_request_id: Uuid::new_v4().to_string(),
            x_correlation_id: Uuid::new_v4().to_string(),
            conversation_id: credit.conversation_id.clone(),
            turn_index: 0,
            final_turn: true,
            session_num: 0,
            worker_id: self.id,
            phase: credit.phase,
            start_ns: now,
            ack_ns: None,
            end_ns: now,
            streamed: false,
            status: None,
            response: ParsedResponse::default(),
            input_text: String::new(),
            input_length_hint: None,
            was_cancelled: false,
            cancellation_time_ns: None,
            credit_drop_latency_ns: None,
            error: Some(details),
            timestamp_wall_ns: self.clock.wall_now_ns(),
        }
    }

    async fn emit(&self, record: RawRequestRecord) -> Result<()> {
        self.records
            .send(record)
            .await
            .map_err(|_| Error::ChannelClosed("raw records"))
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("model", &self.shared.model)
            .field("streaming", &self.shared.streaming)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}
