//! Scheduler mode tests

use super::*;
use crate::bus::{Command, CreditReturn, DatasetRequest, MessageBus};
use crate::service::{ServiceId, ServiceKind};

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn test_config() -> UserConfig {
    let mut config = UserConfig::default();
    config.endpoint.model = "test-model".to_string();
    config
}

fn spawn_scheduler(
    config: UserConfig,
    bus: &Arc<MessageBus>,
    ctx: &RunContext,
    token: &CancellationToken,
) -> tokio::task::JoinHandle<Result<()>> {
    let harness = ServiceHarness::new(
        ServiceId::new(ServiceKind::Scheduler, 0),
        bus,
        token.clone(),
    );
    let scheduler = CreditScheduler::new(Arc::new(config), ctx, bus, harness);
    let handle = tokio::spawn(scheduler.run());
    bus.broadcast_command(Command::Configure);
    bus.broadcast_command(Command::Start);
    handle
}

/// Serve conversation ids round-robin plus a fixed trace schedule
fn spawn_test_dataset(bus: &Arc<MessageBus>, ids: Vec<&str>, schedule: Vec<(i64, &str)>) {
    let mut rx = bus.take_dataset_receiver().unwrap();
    let ids: Vec<ConversationId> = ids.into_iter().map(Into::into).collect();
    let schedule: Vec<(i64, ConversationId)> = schedule
        .into_iter()
        .map(|(ts, id)| (ts, id.into()))
        .collect();
    tokio::spawn(async move {
        let mut cursor = 0usize;
        while let Some(request) = rx.recv().await {
            match request {
                DatasetRequest::NextId { reply } => {
                    let id = ids.get(cursor % ids.len()).cloned();
                    cursor += 1;
                    let _ = reply.send(id);
                }
                DatasetRequest::TimedSchedule { reply } => {
                    let _ = reply.send(schedule.clone());
                }
                DatasetRequest::Count { reply } => {
                    let _ = reply.send(ids.len());
                }
                DatasetRequest::GetById { reply, .. } => {
                    let _ = reply.send(None);
                }
            }
        }
    });
}

/// Consume credits like a worker pool would: hold each for `hold`, then
/// return it. Records every credit and the peak number held concurrently.
fn spawn_echo_workers(
    bus: &Arc<MessageBus>,
    hold: Duration,
) -> (
    Arc<std::sync::Mutex<Vec<Credit>>>,
    Arc<AtomicI64>,
) {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let max_active = Arc::new(AtomicI64::new(0));
    let active = Arc::new(AtomicI64::new(0));

    for _ in 0..4 {
        let rx = bus.credit_receiver();
        let returns = bus.return_sender();
        let seen = Arc::clone(&seen);
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);
        tokio::spawn(async move {
            while let Ok(credit) = rx.recv().await {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
                let phase = credit.phase;
                seen.lock().unwrap().push(credit);
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = returns.send(CreditReturn { phase }).await;
            }
        });
    }
    (seen, max_active)
}

#[tokio::test]
async fn test_concurrency_mode_bounds_outstanding() {
    let bus = Arc::new(MessageBus::default());
    let ctx = RunContext::new(Some(42));
    let token = CancellationToken::new();
    spawn_test_dataset(&bus, vec!["c0", "c1"], vec![]);
    let (seen, max_active) = spawn_echo_workers(&bus, Duration::from_millis(5));

    let mut config = test_config();
    config.load.concurrency = Some(2);
    config.load.request_count = Some(10);
    let handle = spawn_scheduler(config, &bus, &ctx, &token);

    handle.await.unwrap().unwrap();
    let credits = seen.lock().unwrap();
    assert_eq!(credits.len(), 10);
    assert!(credits.iter().all(|c| c.phase == CreditPhase::Profiling));
    assert!(max_active.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_warmup_credits_precede_profiling() {
    let bus = Arc::new(MessageBus::default());
    let ctx = RunContext::new(Some(42));
    let token = CancellationToken::new();
    spawn_test_dataset(&bus, vec!["c0"], vec![]);
    let (seen, _) = spawn_echo_workers(&bus, Duration::from_millis(1));

    let mut config = test_config();
    config.load.concurrency = Some(1);
    config.load.request_count = Some(3);
    config.load.warmup_request_count = 2;
    let handle = spawn_scheduler(config, &bus, &ctx, &token);

    handle.await.unwrap().unwrap();
    let credits = seen.lock().unwrap();
    let phases: Vec<CreditPhase> = credits.iter().map(|c| c.phase).collect();
    assert_eq!(
        phases,
        vec![
            CreditPhase::Warmup,
            CreditPhase::Warmup,
            CreditPhase::Profiling,
            CreditPhase::Profiling,
            CreditPhase::Profiling,
        ]
    );
    // Credit numbering is continuous across phases
    let numbers: Vec<u64> = credits.iter().map(|c| c.credit_num).collect();
    assert_eq!(numbers, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_constant_rate_spacing() {
    let bus = Arc::new(MessageBus::default());
    let ctx = RunContext::new(Some(42));
    let token = CancellationToken::new();
    spawn_test_dataset(&bus, vec!["c0"], vec![]);
    let (seen, _) = spawn_echo_workers(&bus, Duration::ZERO);

    let mut config = test_config();
    config.load.request_rate = Some(100.0);
    config.load.request_rate_mode = crate::config::RequestRateMode::Constant;
    config.load.request_count = Some(10);
    let handle = spawn_scheduler(config, &bus, &ctx, &token);

    handle.await.unwrap().unwrap();
    let credits = seen.lock().unwrap();
    assert_eq!(credits.len(), 10);

    let mut issued: Vec<u64> = credits.iter().map(|c| c.issued_ns).collect();
    issued.sort_unstable();
    let span_ms = (issued[9] - issued[0]) as f64 / 1_000_000.0;
    // 9 gaps of 10ms; allow generous scheduling slack
    assert!((60.0..200.0).contains(&span_ms), "span {span_ms} ms");
}

#[tokio::test]
async fn test_poisson_rate_spacing() {
    let bus = Arc::new(MessageBus::default());
    let ctx = RunContext::new(Some(42));
    let token = CancellationToken::new();
    spawn_test_dataset(&bus, vec!["c0"], vec![]);
    let (seen, _) = spawn_echo_workers(&bus, Duration::ZERO);

    let mut config = test_config();
    config.load.request_rate = Some(100.0);
    config.load.request_rate_mode = crate::config::RequestRateMode::Poisson;
    config.load.request_count = Some(20);
    let handle = spawn_scheduler(config, &bus, &ctx, &token);

    handle.await.unwrap().unwrap();
    let credits = seen.lock().unwrap();
    assert_eq!(credits.len(), 20);

    let mut issued: Vec<u64> = credits.iter().map(|c| c.issued_ns).collect();
    issued.sort_unstable();
    // 19 exponential gaps with a 10ms mean; the sum wanders around 190ms
    // (stddev ~44ms), so bound it loosely rather than per-gap
    let span_ms = (issued[19] - issued[0]) as f64 / 1_000_000.0;
    assert!((50.0..600.0).contains(&span_ms), "span {span_ms} ms");
    let rate = 19.0 / (span_ms / 1000.0);
    assert!((30.0..400.0).contains(&rate), "measured rate {rate} req/s");

    // Exponential inter-arrivals jitter; a constant schedule would not
    let gaps: Vec<u64> = issued.windows(2).map(|pair| pair[1] - pair[0]).collect();
    let min_gap = *gaps.iter().min().unwrap();
    let max_gap = *gaps.iter().max().unwrap();
    assert!(
        max_gap > min_gap + 2_000_000,
        "gaps did not vary: min {min_gap} max {max_gap}"
    );
}

#[tokio::test]
async fn test_fixed_schedule_replay_with_offsets() {
    let bus = Arc::new(MessageBus::default());
    let ctx = RunContext::new(Some(42));
    let token = CancellationToken::new();
    spawn_test_dataset(
        &bus,
        vec![],
        vec![(1000, "a"), (1050, "b"), (1100, "c"), (5000, "d")],
    );
    let (seen, _) = spawn_echo_workers(&bus, Duration::ZERO);

    let mut config = test_config();
    config.input.fixed_schedule = true;
    config.input.fixed_schedule_auto_offset = true;
    config.input.fixed_schedule_end_offset_ms = Some(100);
    config.input.file = Some(std::path::PathBuf::from("trace.jsonl"));
    config.load.request_count = None;
    let handle = spawn_scheduler(config, &bus, &ctx, &token);

    handle.await.unwrap().unwrap();
    let credits = seen.lock().unwrap();
    // The 5000ms entry is beyond end-offset and must not be issued
    assert_eq!(credits.len(), 3);
    let ids: Vec<String> = credits.iter().map(|c| c.conversation_id.to_string()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    let spacing_ms =
        (credits[2].scheduled_ns - credits[0].scheduled_ns) as f64 / 1_000_000.0;
    assert!((spacing_ms - 100.0).abs() < 20.0, "spacing {spacing_ms} ms");
}

#[tokio::test]
async fn test_cancellation_rate_marks_all_credits() {
    let bus = Arc::new(MessageBus::default());
    let ctx = RunContext::new(Some(42));
    let token = CancellationToken::new();
    spawn_test_dataset(&bus, vec!["c0"], vec![]);
    let (seen, _) = spawn_echo_workers(&bus, Duration::ZERO);

    let mut config = test_config();
    config.load.concurrency = Some(4);
    config.load.request_count = Some(20);
    config.load.cancellation_rate = Some(100.0);
    config.load.cancellation_delay = Duration::from_millis(100);
    let handle = spawn_scheduler(config, &bus, &ctx, &token);

    handle.await.unwrap().unwrap();
    let credits = seen.lock().unwrap();
    assert_eq!(credits.len(), 20);
    assert!(credits
        .iter()
        .all(|c| c.cancel_after == Some(Duration::from_millis(100))));
}

#[tokio::test]
async fn test_duration_stops_issuing() {
    let bus = Arc::new(MessageBus::default());
    let ctx = RunContext::new(Some(42));
    let token = CancellationToken::new();
    spawn_test_dataset(&bus, vec!["c0"], vec![]);
    let (seen, _) = spawn_echo_workers(&bus, Duration::from_millis(20));

    let mut config = test_config();
    config.load.concurrency = Some(1);
    config.load.request_count = None;
    config.load.benchmark_duration = Some(Duration::from_millis(100));
    let handle = spawn_scheduler(config, &bus, &ctx, &token);

    handle.await.unwrap().unwrap();
    let credits = seen.lock().unwrap();
    // ~20ms per credit within a 100ms window
    assert!(!credits.is_empty());
    assert!(credits.len() <= 8, "issued {}", credits.len());
}
