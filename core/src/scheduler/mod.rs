//! Credit scheduler
//!
//! Translates the traffic configuration into a stream of credits on the
//! push/pull credit queue. Three modes:
//!
//! - **Concurrency**: keep at most C credits outstanding; a new credit is
//!   released whenever the aggregator returns one.
//! - **Rate**: sleep a constant or Poisson inter-arrival, then emit;
//!   sleep-then-gate when a concurrency cap is set. The schedule does not
//!   catch up after being blocked.
//! - **Fixed schedule**: replay the dataset's millisecond timestamps, with
//!   auto/start/end offset handling.
//!
//! Warmup credits (the first `warmup_request_count`) are tagged so the
//! aggregator keeps them out of profiling statistics; profiling does not
//! begin until every warmup credit has been returned. Cancellation
//! injection marks each credit independently with the configured
//! probability, deterministically under the run seed.

mod interval;

pub use interval::ArrivalProcess;

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;

use crate::bus::{DatasetHandle, Event, MessageBus};
use crate::clock::{RunClock, NANOS_PER_MILLI};
use crate::config::{TrafficMode, UserConfig};
use crate::context::{rng_id, RunContext};
use crate::error::{Error, Result};
use crate::model::{ConversationId, Credit, CreditPhase};
use crate::service::{ServiceHarness, ServiceState};

/// Scheduler lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Constructed, not yet started
    Idle,
    /// Issuing credits
    Scheduling,
    /// Done issuing; waiting for outstanding credits to return
    Draining,
    /// Finished cleanly
    Done,
    /// Stopped on an error
    Failed,
}

/// The credit scheduler service
pub struct CreditScheduler {
    config: Arc<UserConfig>,
    bus: Arc<MessageBus>,
    dataset: DatasetHandle,
    credits: async_channel::Sender<Credit>,
    returns: async_channel::Receiver<crate::bus::CreditReturn>,
    clock: Arc<RunClock>,
    cancel_rng: StdRng,
    arrival: Option<ArrivalProcess>,
    harness: ServiceHarness,
    state: SchedulerState,
    credit_counter: u64,
    outstanding: u64,
}

impl CreditScheduler {
    /// Create the scheduler from the validated configuration
    pub fn new(
        config: Arc<UserConfig>,
        ctx: &RunContext,
        bus: &Arc<MessageBus>,
        harness: ServiceHarness,
    ) -> Self {
        let arrival = match config.traffic_mode() {
            TrafficMode::Rate { rate, mode } => Some(match mode {
                crate::config::RequestRateMode::Constant => ArrivalProcess::constant(rate),
                crate::config::RequestRateMode::Poisson => {
                    ArrivalProcess::poisson(rate, ctx.derive_rng(rng_id::REQUEST_INTERARRIVAL))
                }
            }),
            _ => None,
        };
        Self {
            config,
            bus: Arc::clone(bus),
            dataset: bus.dataset_handle(),
            credits: bus.credit_sender(),
            returns: bus.return_receiver(),
            clock: ctx.clock(),
            cancel_rng: ctx.derive_rng(rng_id::REQUEST_CANCELLATION),
            arrival,
            harness,
            state: SchedulerState::Idle,
            credit_counter: 0,
            outstanding: 0,
        }
    }

    /// Run the scheduler to completion
    pub async fn run(mut self) -> Result<()> {
        if !self.harness.startup_handshake().await? {
            self.credits.close();
            return Ok(());
        }
        let heartbeat = self.harness.spawn_heartbeat();
        let result = self.run_inner().await;
        // Closing the queue lets workers drain buffered credits and exit.
        self.credits.close();
        heartbeat.abort();
        match &result {
            Ok(()) => {
                self.set_state(SchedulerState::Done);
                self.harness.publish_state(ServiceState::Stopped);
            }
            Err(error) => {
                self.set_state(SchedulerState::Failed);
                self.harness.publish_failure(error);
            }
        }
        result
    }

    fn set_state(&mut self, state: SchedulerState) {
        tracing::debug!(from = ?self.state, to = ?state, "scheduler state change");
        self.state = state;
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.set_state(SchedulerState::Scheduling);

        let warmup_count = self.config.load.warmup_request_count;
        if warmup_count > 0 {
            self.bus.publish(Event::CreditPhaseStarted {
                phase: CreditPhase::Warmup,
                expected: Some(warmup_count),
            });
            let sent = self
                .issue_phase(CreditPhase::Warmup, Some(warmup_count), None)
                .await?;
            self.bus.publish(Event::CreditPhaseSendingComplete {
                phase: CreditPhase::Warmup,
                sent,
            });
            // Profiling statistics anchor on a clean start: wait for all
            // warmup credits to come back before issuing profiling ones.
            self.await_outstanding().await;
        }

        let deadline = self
            .config
            .load
            .benchmark_duration
            .map(|duration| self.clock.now_ns() + duration.as_nanos() as u64);

        let sent = match self.config.traffic_mode() {
            TrafficMode::FixedSchedule => {
                let schedule = self.load_trace_schedule().await?;
                self.bus.publish(Event::CreditPhaseStarted {
                    phase: CreditPhase::Profiling,
                    expected: Some(schedule.len() as u64),
                });
                self.issue_fixed_schedule(schedule, deadline).await?
            }
            _ => {
                self.bus.publish(Event::CreditPhaseStarted {
                    phase: CreditPhase::Profiling,
                    expected: self.config.load.request_count,
                });
                self.issue_phase(
                    CreditPhase::Profiling,
                    self.config.load.request_count,
                    deadline,
                )
                .await?
            }
        };
        self.bus.publish(Event::CreditPhaseSendingComplete {
            phase: CreditPhase::Profiling,
            sent,
        });

        self.set_state(SchedulerState::Draining);
        self.await_outstanding().await;
        Ok(())
    }

    /// Issue credits for one phase in concurrency or rate mode
    async fn issue_phase(
        &mut self,
        phase: CreditPhase,
        count: Option<u64>,
        deadline_ns: Option<u64>,
    ) -> Result<u64> {
        match self.config.traffic_mode() {
            TrafficMode::Concurrency => self.issue_gated(phase, count, deadline_ns).await,
            TrafficMode::Rate { .. } => self.issue_timed(phase, count, deadline_ns).await,
            TrafficMode::FixedSchedule => Err(Error::Internal(
                "fixed schedule phases are issued from the trace".into(),
            )),
        }
    }

    /// Concurrency mode: at most `concurrency` credits outstanding
    async fn issue_gated(
        &mut self,
        phase: CreditPhase,
        count: Option<u64>,
        deadline_ns: Option<u64>,
    ) -> Result<u64> {
        let shutdown = self.harness.shutdown();
        let limit = self.config.concurrency_limit() as u64;
        let mut sent: u64 = 0;

        loop {
            if count.is_some_and(|c| sent >= c) {
                break;
            }
            if deadline_ns.is_some_and(|d| self.clock.now_ns() >= d) {
                break;
            }
            self.drain_pending_returns();
            if self.outstanding >= limit {
                if !self.wait_for_return(&shutdown, deadline_ns).await {
                    break;
                }
                continue;
            }
            let scheduled_ns = self.clock.now_ns();
            self.issue(phase, None, scheduled_ns).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Rate mode: sleep the inter-arrival, then gate on the optional cap
    async fn issue_timed(
        &mut self,
        phase: CreditPhase,
        count: Option<u64>,
        deadline_ns: Option<u64>,
    ) -> Result<u64> {
        let shutdown = self.harness.shutdown();
        let cap = self.config.load.concurrency.map(|c| c as u64);
        let mut sent: u64 = 0;

        loop {
            if count.is_some_and(|c| sent >= c) {
                break;
            }
            let interval = self
                .arrival
                .as_mut()
                .expect("rate mode always has an arrival process")
                .next_interval();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if deadline_ns.is_some_and(|d| self.clock.now_ns() >= d) {
                break;
            }
            let scheduled_ns = self.clock.now_ns();

            self.drain_pending_returns();
            if let Some(cap) = cap {
                let mut stopped = false;
                while self.outstanding >= cap {
                    if !self.wait_for_return(&shutdown, deadline_ns).await {
                        stopped = true;
                        break;
                    }
                }
                if stopped {
                    break;
                }
            }

            self.issue(phase, None, scheduled_ns).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Fetch and normalise the trace schedule: auto-offset, then the
    /// inclusive `[start_offset, end_offset]` window, re-based so replay
    /// begins at the window start.
    async fn load_trace_schedule(&self) -> Result<Vec<(i64, ConversationId)>> {
        let mut schedule = self.dataset.timed_schedule().await?;
        if schedule.is_empty() {
            return Err(Error::Dataset(
                "fixed schedule requested but the dataset has no timestamps".into(),
            ));
        }
        if self.config.input.fixed_schedule_auto_offset {
            let first = schedule[0].0;
            for entry in &mut schedule {
                entry.0 -= first;
            }
        }
        if let Some(start) = self.config.input.fixed_schedule_start_offset_ms {
            schedule.retain(|(ts, _)| *ts >= start);
            for entry in &mut schedule {
                entry.0 -= start;
            }
        }
        if let Some(end) = self.config.input.fixed_schedule_end_offset_ms {
            let base = self.config.input.fixed_schedule_start_offset_ms.unwrap_or(0);
            schedule.retain(|(ts, _)| *ts + base <= end);
        }
        Ok(schedule)
    }

    /// Replay credits at the trace's wall-clock offsets
    async fn issue_fixed_schedule(
        &mut self,
        schedule: Vec<(i64, ConversationId)>,
        deadline_ns: Option<u64>,
    ) -> Result<u64> {
        let shutdown = self.harness.shutdown();
        let count = self.config.load.request_count;
        let anchor_ns = self.clock.now_ns();
        let mut sent: u64 = 0;

        for (ts_ms, conversation_id) in schedule {
            if count.is_some_and(|c| sent >= c) {
                break;
            }
            let target_ns = anchor_ns + ts_ms.max(0) as u64 * NANOS_PER_MILLI;
            if deadline_ns.is_some_and(|d| target_ns >= d) {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.clock.sleep_until_ns(target_ns) => {}
            }
            self.drain_pending_returns();
            self.issue(CreditPhase::Profiling, Some(conversation_id), target_ns)
                .await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Issue one credit, sampling cancellation and drawing a conversation
    /// from the dataset when the mode does not bind one.
    async fn issue(
        &mut self,
        phase: CreditPhase,
        conversation_id: Option<ConversationId>,
        scheduled_ns: u64,
    ) -> Result<()> {
        let conversation_id = match conversation_id {
            Some(id) => id,
            None => self.dataset.next_id().await?,
        };
        let credit = Credit {
            credit_num: self.credit_counter,
            conversation_id,
            phase,
            cancel_after: self.sample_cancellation(),
            scheduled_ns,
            issued_ns: self.clock.now_ns(),
        };
        self.credit_counter += 1;
        self.outstanding += 1;
        self.credits
            .send(credit)
            .await
            .map_err(|_| Error::ChannelClosed("credits"))
    }

    fn sample_cancellation(&mut self) -> Option<Duration> {
        let rate = self.config.load.cancellation_rate?;
        (self.cancel_rng.gen::<f64>() * 100.0 < rate)
            .then_some(self.config.load.cancellation_delay)
    }

    fn drain_pending_returns(&mut self) {
        while self.returns.try_recv().is_ok() {
            self.outstanding = self.outstanding.saturating_sub(1);
        }
    }

    /// Block until one credit returns. Returns `false` when scheduling
    /// should stop instead (shutdown, deadline, or closed return queue).
    async fn wait_for_return(
        &mut self,
        shutdown: &tokio_util::sync::CancellationToken,
        deadline_ns: Option<u64>,
    ) -> bool {
        let clock = Arc::clone(&self.clock);
        let deadline = async move {
            match deadline_ns {
                Some(target) => clock.sleep_until_ns(target).await,
                None => futures::future::pending::<()>().await,
            }
        };
        let returns = self.returns.clone();
        let returned = tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = deadline => return false,
            returned = returns.recv() => returned,
        };
        match returned {
            Ok(_) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                true
            }
            Err(_) => false,
        }
    }

    /// Wait for every outstanding credit to return, or shutdown
    async fn await_outstanding(&mut self) {
        let shutdown = self.harness.shutdown();
        while self.outstanding > 0 {
            if !self.wait_for_return(&shutdown, None).await {
                break;
            }
        }
    }
}

impl std::fmt::Debug for CreditScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditScheduler")
            .field("state", &self.state)
            .field("mode", &self.config.traffic_mode())
            .field("outstanding", &self.outstanding)
            .finish()
    }
}

#[cfg(test)]
mod tests;
