//! Monotonic run clock
//!
//! All latency arithmetic uses a monotonic clock; wall-clock timestamps are
//! recorded separately for export. The run clock anchors an `Instant` at
//! construction and hands out nanosecond offsets from that anchor, so every
//! component measures against the same origin.

use std::time::{Duration, Instant};

/// Nanoseconds per second
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Nanoseconds per millisecond
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Shared monotonic clock for one benchmark run
#[derive(Debug, Clone)]
pub struct RunClock {
    origin: Instant,
}

impl RunClock {
    /// Create a clock anchored at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Monotonic nanoseconds since the run origin
    pub fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    /// Wall-clock nanoseconds since the Unix epoch (export only, never used
    /// for latency arithmetic)
    pub fn wall_now_ns(&self) -> i64 {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
    }

    /// Sleep until the given monotonic offset; returns immediately if the
    /// offset is already in the past.
    pub async fn sleep_until_ns(&self, target_ns: u64) {
        let now = self.now_ns();
        if target_ns > now {
            tokio::time::sleep(Duration::from_nanos(target_ns - now)).await;
        }
    }
}

impl Default for RunClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a nanosecond delta to fractional milliseconds
pub fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / NANOS_PER_MILLI as f64
}

/// Convert a nanosecond delta to fractional seconds
pub fn ns_to_secs(ns: u64) -> f64 {
    ns as f64 / NANOS_PER_SEC as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = RunClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_ns_conversions() {
        assert_eq!(ns_to_ms(1_500_000), 1.5);
        assert_eq!(ns_to_secs(2_500_000_000), 2.5);
    }

    #[tokio::test]
    async fn test_sleep_until_past_offset_returns_immediately() {
        let clock = RunClock::new();
        let start = Instant::now();
        clock.sleep_until_ns(0).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
