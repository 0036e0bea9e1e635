//! Run controller
//!
//! Brings up the service topology, drives the configure/start command
//! handshake, advances the run phase machine, monitors service health,
//! and tears the pipeline down in drain order:
//!
//! ```text
//! Init -> Ready -> Warmup -> Profiling -> Cooldown -> Finalizing -> Done
//!                                                 \-> Aborted
//! ```
//!
//! The natural shutdown cascade needs no forced cancellation: the
//! scheduler closes the credit queue when done, workers drain it and
//! exit, the controller then closes the record and metric queues in turn,
//! and the aggregator finalizes once its queue runs dry. Forced
//! cancellation (abort, grace expiry, interrupt) short-circuits the same
//! cascade through the shared `CancellationToken`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::aggregator::{Aggregator, ProfileSummary};
use crate::bus::{Command, CommandAck, Event, MessageBus};
use crate::client::InferenceClient;
use crate::config::UserConfig;
use crate::context::RunContext;
use crate::dataset::{DatasetProvider, DatasetService};
use crate::error::{Error, Result};
use crate::model::CreditPhase;
use crate::processor::RecordProcessor;
use crate::scheduler::CreditScheduler;
use crate::service::{
    ServiceHarness, ServiceId, ServiceKind, ServiceSet, ServiceState, HEARTBEAT_INTERVAL,
    MISSED_HEARTBEAT_LIMIT,
};
use crate::tokenizer::TokenizerRef;
use crate::worker::Worker;

/// Run lifecycle phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Services are being constructed and spawned
    Init,
    /// Every service acknowledged configuration
    Ready,
    /// Warmup credits are in flight
    Warmup,
    /// Profiling credits are in flight
    Profiling,
    /// Credit issuing finished; in-flight requests are draining
    Cooldown,
    /// The aggregator is computing the final summary
    Finalizing,
    /// Finished cleanly
    Done,
    /// A service failed or the run was interrupted
    Aborted,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunPhase::Init => "init",
            RunPhase::Ready => "ready",
            RunPhase::Warmup => "warmup",
            RunPhase::Profiling => "profiling",
            RunPhase::Cooldown => "cooldown",
            RunPhase::Finalizing => "finalizing",
            RunPhase::Done => "done",
            RunPhase::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}

/// What a completed run produced
#[derive(Debug)]
pub struct RunOutcome {
    /// The final aggregation (partial when aborted)
    pub summary: ProfileSummary,
    /// Whether the run ended via the abort path
    pub aborted: bool,
}

/// The run controller
pub struct Controller {
    config: Arc<UserConfig>,
    ctx: RunContext,
    bus: Arc<MessageBus>,
    shutdown: CancellationToken,
    phase: RunPhase,
}

impl Controller {
    /// Create a controller. `shutdown` is the run-wide cancellation root;
    /// cancelling it externally (e.g. on SIGINT) drains and finalizes.
    pub fn new(
        config: Arc<UserConfig>,
        ctx: RunContext,
        bus: Arc<MessageBus>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            ctx,
            bus,
            shutdown,
            phase: RunPhase::Init,
        }
    }

    fn set_phase(&mut self, phase: RunPhase) {
        if self.phase != phase {
            tracing::info!(from = %self.phase, to = %phase, "run phase change");
            self.phase = phase;
            self.bus.publish(Event::PhaseChanged { phase });
        }
    }

    /// Execute the whole benchmark run
    pub async fn run(
        mut self,
        client: Arc<dyn InferenceClient>,
        tokenizer: TokenizerRef,
        provider: Box<dyn DatasetProvider>,
    ) -> Result<RunOutcome> {
        self.set_phase(RunPhase::Init);
        let mut events = self.bus.subscribe();
        let mut acks = self
            .bus
            .take_ack_receiver()
            .ok_or_else(|| Error::Internal("command ack stream already taken".into()))?;
        let dataset_rx = self
            .bus
            .take_dataset_receiver()
            .ok_or_else(|| Error::Internal("dataset request stream already taken".into()))?;

        // Dataset provider
        let mut support = ServiceSet::new();
        let dataset_id = ServiceId::new(ServiceKind::Dataset, 0);
        support.spawn(
            dataset_id,
            DatasetService::new(
                provider,
                dataset_rx,
                ServiceHarness::new(dataset_id, &self.bus, self.shutdown.clone()),
            )
            .run(),
        );

        // Scheduler and workers
        let mut producers = ServiceSet::new();
        let scheduler_id = ServiceId::new(ServiceKind::Scheduler, 0);
        producers.spawn(
            scheduler_id,
            CreditScheduler::new(
                Arc::clone(&self.config),
                &self.ctx,
                &self.bus,
                ServiceHarness::new(scheduler_id, &self.bus, self.shutdown.clone()),
            )
            .run(),
        );

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let worker_count = self.config.worker_count(cpus);
        // The pool as a whole must be able to hold the configured
        // concurrency; uncapped rate mode gets a fixed per-worker ceiling.
        let per_worker_concurrency = match self.config.load.concurrency {
            Some(concurrency) => concurrency.div_ceil(worker_count).max(1),
            None => 64,
        };
        for index in 0..worker_count {
            let id = ServiceId::new(ServiceKind::Worker, index);
            producers.spawn(
                id,
                Worker::new(
                    index,
                    Arc::clone(&client),
                    self.bus.dataset_handle(),
                    self.bus.credit_receiver(),
                    self.bus.record_sender(),
                    self.ctx.clock(),
                    self.config.endpoint.model.clone(),
                    self.config.endpoint.streaming,
                    per_worker_concurrency,
                    ServiceHarness::new(id, &self.bus, self.shutdown.clone()),
                )
                .run(),
            );
        }

        // Record processors
        let mut processors = ServiceSet::new();
        for index in 0..self.config.processor_count() {
            let id = ServiceId::new(ServiceKind::RecordProcessor, index);
            processors.spawn(
                id,
                RecordProcessor::new(
                    index,
                    Arc::clone(&tokenizer),
                    self.config.prefer_usage_token_counts,
                    self.bus.record_receiver(),
                    self.bus.metric_sender(),
                    ServiceHarness::new(id, &self.bus, self.shutdown.clone()),
                )
                .run(),
            );
        }

        // Aggregator (joined separately: it returns the summary)
        let aggregator_id = ServiceId::new(ServiceKind::Aggregator, 0);
        let aggregator_handle = tokio::spawn(
            Aggregator::new(
                Arc::clone(&self.config),
                &self.bus,
                ServiceHarness::new(aggregator_id, &self.bus, self.shutdown.clone()),
            )
            .run(),
        );

        tracing::info!(
            workers = worker_count,
            processors = self.config.processor_count(),
            mode = ?self.config.traffic_mode(),
            "topology spawned"
        );

        let mut monitored: Vec<ServiceId> = support.ids();
        monitored.extend(producers.ids());
        monitored.extend(processors.ids());
        monitored.push(aggregator_id);
        let expected_acks = monitored.len();

        // Configure / start handshake
        self.issue_command(Command::Configure, expected_acks, &mut acks).await?;
        self.set_phase(RunPhase::Ready);
        self.issue_command(Command::Start, expected_acks, &mut acks).await?;
        self.set_phase(if self.config.load.warmup_request_count > 0 {
            RunPhase::Warmup
        } else {
            RunPhase::Profiling
        });

        // Drive phases until the run completes or aborts
        let aborted = self.watch(&mut events, monitored).await;

        // Teardown in drain order
        let mut failures = 0;
        for (id, result) in producers.join_all().await {
            if let Err(error) = result {
                failures += 1;
                tracing::error!(service = %id, error = %error, "service ended with error");
            }
        }
        self.bus.record_sender().close();
        for (id, result) in processors.join_all().await {
            if let Err(error) = result {
                failures += 1;
                tracing::error!(service = %id, error = %error, "service ended with error");
            }
        }
        self.bus.metric_sender().close();

        let summary = match aggregator_handle.await {
            Ok(result) => result?,
            Err(join_error) => {
                return Err(Error::Internal(format!("aggregator panicked: {join_error}")))
            }
        };

        self.shutdown.cancel();
        let _ = support.join_all().await;

        let aborted = aborted || failures > 0;
        self.set_phase(if aborted { RunPhase::Aborted } else { RunPhase::Done });
        Ok(RunOutcome { summary, aborted })
    }

    /// Broadcast a command and wait for every service to acknowledge it
    async fn issue_command(
        &self,
        command: Command,
        expected: usize,
        acks: &mut mpsc::Receiver<CommandAck>,
    ) -> Result<()> {
        let command_id = self.bus.broadcast_command(command);
        let deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
        tokio::pin!(deadline);
        let mut received = 0usize;
        while received < expected {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(Error::Internal(format!(
                        "timed out waiting for {command:?} acknowledgements ({received}/{expected})"
                    )));
                }
                _ = self.shutdown.cancelled() => {
                    return Err(Error::Internal("shut down during startup handshake".into()));
                }
                ack = acks.recv() => match ack {
                    Some(ack) if ack.command_id == command_id => received += 1,
                    Some(_) => {}
                    None => return Err(Error::ChannelClosed("command acks")),
                },
            }
        }
        Ok(())
    }

    /// Watch events until the profiling phase completes, the grace period
    /// expires, or the run aborts. Returns whether the run aborted.
    async fn watch(
        &mut self,
        events: &mut broadcast::Receiver<Event>,
        monitored: Vec<ServiceId>,
    ) -> bool {
        let now = Instant::now();
        let mut last_heartbeat: HashMap<ServiceId, Instant> =
            monitored.into_iter().map(|id| (id, now)).collect();
        let stale_after = HEARTBEAT_INTERVAL * (MISSED_HEARTBEAT_LIMIT + 1);
        let mut monitor = tokio::time::interval(HEARTBEAT_INTERVAL);
        monitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut grace_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::warn!("run interrupted; draining what is in flight");
                    return true;
                }

                _ = monitor.tick() => {
                    if let Some(stale) = last_heartbeat
                        .iter()
                        .find(|(_, last)| last.elapsed() > stale_after)
                    {
                        tracing::error!(service = %stale.0, "service stopped heartbeating");
                        self.shutdown.cancel();
                        return true;
                    }
                    if grace_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        tracing::warn!(
                            grace_secs = self.config.load.grace_period.as_secs_f64(),
                            "grace period expired; cancelling outstanding requests"
                        );
                        self.shutdown.cancel();
                        return false;
                    }
                }

                event = events.recv() => match event {
                    Ok(Event::Heartbeat { service, state }) => match state {
                        ServiceState::Stopped => {
                            last_heartbeat.remove(&service);
                        }
                        ServiceState::Failed => {
                            tracing::error!(service = %service, "service reported failure");
                            self.shutdown.cancel();
                            return true;
                        }
                        _ => {
                            last_heartbeat.insert(service, Instant::now());
                        }
                    },
                    Ok(Event::ServiceFailed { service, error }) => {
                        tracing::error!(service = %service, error = %error, "aborting run");
                        self.shutdown.cancel();
                        return true;
                    }
                    Ok(Event::CreditPhaseComplete { phase: CreditPhase::Warmup, .. }) => {
                        self.set_phase(RunPhase::Profiling);
                    }
                    Ok(Event::CreditPhaseSendingComplete { phase: CreditPhase::Profiling, .. }) => {
                        self.set_phase(RunPhase::Cooldown);
                        grace_deadline = Some(Instant::now() + self.config.load.grace_period);
                    }
                    Ok(Event::CreditPhaseComplete { phase: CreditPhase::Profiling, .. }) => {
                        self.set_phase(RunPhase::Finalizing);
                        return false;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "controller event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                },
            }
        }
    }
}
