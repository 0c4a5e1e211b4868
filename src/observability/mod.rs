//! Delivery counters and send timing.
//!
//! Events themselves are logged with `tracing` where they happen; this
//! module only keeps the numbers a caller may want to poll.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
enum Counter {
    Sent,
    Failed,
    Attempts,
    AttemptFailures,
    Fallbacks,
}

const COUNTERS: usize = 5;

/// Counters shared by every send of a mailer.
///
/// All updates are relaxed: the counters are independent of each other and
/// a snapshot taken during concurrent sends may mix in-flight values.
#[derive(Debug, Default)]
pub struct MailerMetrics {
    counters: [AtomicU64; COUNTERS],
}

impl MailerMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn read(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// A message reached some transport.
    pub fn record_send_success(&self) {
        self.bump(Counter::Sent);
    }

    /// A message reached no transport.
    pub fn record_send_failure(&self) {
        self.bump(Counter::Failed);
    }

    /// One call into one transport.
    pub fn record_attempt(&self, delivered: bool) {
        self.bump(Counter::Attempts);
        if !delivered {
            self.bump(Counter::AttemptFailures);
        }
    }

    /// Delivery moved on to the next transport in line.
    pub fn record_fallback(&self) {
        self.bump(Counter::Fallbacks);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.read(Counter::Sent),
            messages_failed: self.read(Counter::Failed),
            transport_attempts: self.read(Counter::Attempts),
            transport_failures: self.read(Counter::AttemptFailures),
            fallbacks: self.read(Counter::Fallbacks),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`MailerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Messages some transport accepted.
    pub messages_sent: u64,
    /// Messages every transport failed.
    pub messages_failed: u64,
    /// Calls into transports.
    pub transport_attempts: u64,
    /// Attempts that raised or were refused.
    pub transport_failures: u64,
    /// Moves to the next transport after a failed attempt.
    pub fallbacks: u64,
}

impl MetricsSnapshot {
    /// Delivered share of finished sends; 1.0 before the first send.
    pub fn success_rate(&self) -> f64 {
        match self.messages_sent + self.messages_failed {
            0 => 1.0,
            finished => self.messages_sent as f64 / finished as f64,
        }
    }
}

/// Measures one labelled operation and logs its duration when stopped.
#[derive(Debug)]
pub struct Timer {
    label: &'static str,
    started: Instant,
}

impl Timer {
    /// Starts timing `label`.
    pub fn start(label: &'static str) -> Self {
        Self {
            label,
            started: Instant::now(),
        }
    }

    /// Time since start.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Logs the elapsed time at debug level and returns it.
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        tracing::debug!(operation = self.label, ?elapsed, "operation finished");
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_rate() {
        let metrics = MailerMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert_eq!(metrics.snapshot().success_rate(), 1.0);

        // one message delivered after a fallback, one lost
        metrics.record_attempt(false);
        metrics.record_fallback();
        metrics.record_attempt(true);
        metrics.record_send_success();
        metrics.record_attempt(false);
        metrics.record_send_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot,
            MetricsSnapshot {
                messages_sent: 1,
                messages_failed: 1,
                transport_attempts: 3,
                transport_failures: 2,
                fallbacks: 1,
            }
        );
        assert_eq!(snapshot.success_rate(), 0.5);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_timer_measures_sleep() {
        let timer = Timer::start("sleep");
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
        assert!(timer.stop() >= Duration::from_millis(5));
    }
}
