//! Counters for the event consumer loop.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for consumer monitoring.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    /// Messages returned by the broker.
    received: AtomicU64,
    /// Messages addressed to another service.
    skipped: AtomicU64,
    /// Messages handed to the handler pool.
    dispatched: AtomicU64,
    /// Handler invocations that returned success.
    handled: AtomicU64,
    /// Decode failures, handler errors and panics.
    failed: AtomicU64,
    /// Handler invocations over the slow threshold.
    slow: AtomicU64,
    /// Messages acknowledged.
    acked: AtomicU64,
    /// Failed broker reads.
    poll_errors: AtomicU64,
    /// Longest handler time observed, in milliseconds.
    max_handling_ms: AtomicU64,
    /// Last successful poll.
    last_poll: RwLock<Option<Instant>>,
}

impl ConsumerMetrics {
    /// Records a batch read from the broker.
    pub fn record_received(&self, count: usize) {
        self.received.fetch_add(count as u64, Ordering::Relaxed);
        *self.last_poll.write() = Some(Instant::now());
    }

    /// Records a message skipped by routing.
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dispatch.
    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed handler invocation.
    pub fn record_handled(&self, elapsed: Duration) {
        self.handled.fetch_add(1, Ordering::Relaxed);
        self.record_handling_time(elapsed);
    }

    /// Records a failure.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a slow handler invocation.
    pub fn record_slow(&self) {
        self.slow.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an acknowledgement.
    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed broker read.
    pub fn record_poll_error(&self) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_handling_time(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.max_handling_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Returns the number of received messages.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Returns the number of skipped messages.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Returns the number of dispatched messages.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Returns the number of successfully handled messages.
    #[must_use]
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Returns the number of failures.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Returns the number of slow invocations.
    #[must_use]
    pub fn slow(&self) -> u64 {
        self.slow.load(Ordering::Relaxed)
    }

    /// Returns the number of acknowledged messages.
    #[must_use]
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    /// Returns the number of failed broker reads.
    #[must_use]
    pub fn poll_errors(&self) -> u64 {
        self.poll_errors.load(Ordering::Relaxed)
    }

    /// Returns the time since the last successful poll.
    #[must_use]
    pub fn since_last_poll(&self) -> Option<Duration> {
        self.last_poll.read().map(|at| at.elapsed())
    }

    /// Converts metrics to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "received": self.received(),
            "skipped": self.skipped(),
            "dispatched": self.dispatched(),
            "handled": self.handled(),
            "failed": self.failed(),
            "slow": self.slow(),
            "acked": self.acked(),
            "poll_errors": self.poll_errors(),
            "max_handling_ms": self.max_handling_ms.load(Ordering::Relaxed),
        })
    }
}
