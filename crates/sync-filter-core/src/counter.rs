//! Rate-limited flush counter
//!
//! Counts events and emits a summary through `tracing` at most once per
//! configured interval, so a busy publisher logs a heartbeat instead of one
//! line per artifact.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Default minimum time between two summaries
pub const DEFAULT_MIN_TIME_BETWEEN_LOG_OUTPUT: Duration = Duration::from_millis(30_000);

/// Summary emitted when the interval has elapsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateSummary {
    pub label: String,
    pub count: u64,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct RateLimitState {
    count: u64,
    last_logged: Instant,
}

/// Event counter that logs a summary once `min_interval` has passed.
///
/// Each owner keeps its own counter; the lock only guards against a filter
/// instance being driven by several batch workers at once.
#[derive(Debug)]
pub struct RateLimitedCounter {
    min_interval: Duration,
    state: Mutex<RateLimitState>,
}

impl RateLimitedCounter {
    pub fn new(min_interval: Duration) -> Self {
        Self::starting_at(min_interval, Instant::now())
    }

    fn starting_at(min_interval: Duration, now: Instant) -> Self {
        Self {
            min_interval,
            state: Mutex::new(RateLimitState {
                count: 0,
                last_logged: now,
            }),
        }
    }

    /// Count one event and log a summary if the interval has elapsed
    pub fn record_event(&self, label: &str) -> Option<RateSummary> {
        self.record_event_at(label, Instant::now())
    }

    fn record_event_at(&self, label: &str, now: Instant) -> Option<RateSummary> {
        let mut state = self.state.lock();
        state.count += 1;

        let elapsed = now.saturating_duration_since(state.last_logged);
        if elapsed <= self.min_interval {
            return None;
        }

        let summary = RateSummary {
            label: label.to_string(),
            count: state.count,
            elapsed,
        };
        info!(
            filter = label,
            published = summary.count,
            elapsed_ms = elapsed.as_millis() as u64,
            "Published {} messages in the last {} ms",
            summary.count,
            elapsed.as_millis()
        );
        state.count = 0;
        state.last_logged = now;
        Some(summary)
    }

    /// Events counted since the last summary
    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

impl Default for RateLimitedCounter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_TIME_BETWEEN_LOG_OUTPUT)
    }
}
