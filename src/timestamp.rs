//! Client-side query timestamp generation.
//!
//! Grounded on `original_source/cpp-driver/src/timestamp_generator.cpp`: a
//! server-side sentinel variant and a monotonic client-side variant backed
//! by an atomic CAS loop, re-expressed here with `tokio::time::Instant`
//! standing in for the original's monotonic-clock skew-warning rate
//! limiter (`uv_hrtime`).

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::time::Instant;

/// Sentinel timestamp meaning "let the server assign one", matching the
/// protocol's documented `MIN_INT64`.
pub const SERVER_SIDE_TIMESTAMP: i64 = i64::MIN;

/// A pluggable source of query timestamps (microseconds since the epoch).
pub trait TimestampGenerator: Send + Sync {
    fn next(&self) -> i64;
}

/// Always defers to the server.
#[derive(Debug, Default)]
pub struct ServerSideTimestampGenerator;

impl TimestampGenerator for ServerSideTimestampGenerator {
    fn next(&self) -> i64 {
        SERVER_SIDE_TIMESTAMP
    }
}

/// Returns strictly increasing microsecond timestamps even under clock skew
/// or back-to-back calls within the same microsecond, by forcing the
/// counter ahead of the wall clock when necessary. Logs a rate-limited
/// warning when it has to do so by more than `warning_threshold`.
pub struct MonotonicTimestampGenerator {
    last_micros: AtomicI64,
    warning_threshold: Duration,
    warning_interval: Duration,
    last_warning_at: std::sync::Mutex<Option<Instant>>,
}

impl std::fmt::Debug for MonotonicTimestampGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotonicTimestampGenerator")
            .field("last_micros", &self.last_micros.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MonotonicTimestampGenerator {
    fn default() -> Self {
        Self::new(Duration::from_millis(1), Duration::from_secs(1))
    }
}

impl MonotonicTimestampGenerator {
    pub fn new(warning_threshold: Duration, warning_interval: Duration) -> Self {
        Self {
            last_micros: AtomicI64::new(i64::MIN),
            warning_threshold,
            warning_interval,
            last_warning_at: std::sync::Mutex::new(None),
        }
    }

    fn maybe_warn(&self, skew: Duration) {
        if skew < self.warning_threshold {
            return;
        }
        let now = Instant::now();
        let mut last_warning_at = self.last_warning_at.lock().unwrap();
        let should_warn =
            last_warning_at.map(|last| now.duration_since(last) >= self.warning_interval).unwrap_or(true);
        if should_warn {
            *last_warning_at = Some(now);
            drop(last_warning_at);
            tracing::warn!(
                skew_micros = skew.as_micros() as u64,
                "clock skew forced the timestamp generator ahead of the wall clock"
            );
        }
    }
}

impl TimestampGenerator for MonotonicTimestampGenerator {
    fn next(&self) -> i64 {
        let wall_clock_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);

        loop {
            let prev = self.last_micros.load(Ordering::Relaxed);
            let candidate = if wall_clock_micros > prev { wall_clock_micros } else { prev + 1 };

            if self
                .last_micros
                .compare_exchange(prev, candidate, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                if candidate > wall_clock_micros {
                    self.maybe_warn(Duration::from_micros((candidate - wall_clock_micros) as u64));
                }
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_side_always_returns_the_sentinel() {
        let generator = ServerSideTimestampGenerator;
        assert_eq!(generator.next(), SERVER_SIDE_TIMESTAMP);
        assert_eq!(generator.next(), SERVER_SIDE_TIMESTAMP);
    }

    #[test]
    fn monotonic_generator_is_strictly_increasing_under_back_to_back_calls() {
        let generator = MonotonicTimestampGenerator::default();
        let mut previous = generator.next();
        for _ in 0..1000 {
            let next = generator.next();
            assert!(next > previous);
            previous = next;
        }
    }
}
