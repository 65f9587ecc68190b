//! Lock-free frame counters shared between the hardware, transport and
//! command threads

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use serde::Serialize;
use tracing::debug;

/// Counters on the camera side of the pipeline
#[derive(Default)]
pub struct CaptureCounters {
    converted: CachePadded<AtomicU64>,
    delivered: CachePadded<AtomicU64>,
    dropped_after_release: CachePadded<AtomicU64>,
    convert_failed: CachePadded<AtomicU64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub converted: u64,
    pub delivered: u64,
    pub dropped_after_release: u64,
    pub convert_failed: u64,
}

impl CaptureCounters {
    pub fn record_converted(&self) {
        self.converted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relaycam_frames_converted_total").increment(1);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the running total so the caller can rate-limit its log line
    pub fn record_dropped_after_release(&self) -> u64 {
        metrics::counter!("relaycam_frames_dropped_total", "reason" => "released").increment(1);
        self.dropped_after_release.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_convert_failed(&self) -> u64 {
        metrics::counter!("relaycam_frames_dropped_total", "reason" => "convert").increment(1);
        self.convert_failed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            converted: self.converted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_after_release: self.dropped_after_release.load(Ordering::Relaxed),
            convert_failed: self.convert_failed.load(Ordering::Relaxed),
        }
    }
}

/// Counters on the transport side of the pipeline
#[derive(Default)]
pub struct PublishCounters {
    accepted: CachePadded<AtomicU64>,
    dropped_inactive: CachePadded<AtomicU64>,
    rejected: CachePadded<AtomicU64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishStats {
    pub accepted: u64,
    pub dropped_inactive: u64,
    pub rejected: u64,
}

impl PublishCounters {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relaycam_frames_published_total").increment(1);
    }

    pub fn record_dropped_inactive(&self) -> u64 {
        metrics::counter!("relaycam_frames_dropped_total", "reason" => "inactive").increment(1);
        self.dropped_inactive.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_rejected(&self) -> u64 {
        metrics::counter!("relaycam_frames_dropped_total", "reason" => "rejected").increment(1);
        self.rejected.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> PublishStats {
        PublishStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped_inactive: self.dropped_inactive.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Whether the `total`-th drop should be logged: the first one, then every
/// `interval`-th.
pub fn should_log_drop(total: u64, interval: u64) -> bool {
    total == 1 || (interval > 0 && total % interval == 0)
}

pub(crate) fn log_drop(what: &str, total: u64, interval: u64) {
    if should_log_drop(total, interval) {
        debug!(total, "{} frames dropped", what);
    }
}

/// What to do about the latest failure in a run of consecutive failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakAction {
    Log,
    Quiet,
    GiveUp,
}

/// Consecutive-failure tracker for retry loops on hardware or network
/// threads. Logging follows [`should_log_drop`]; after `limit` failures in a
/// row the loop should stop.
#[derive(Debug)]
pub struct FailureStreak {
    count: u64,
    limit: u64,
    log_interval: u64,
}

impl FailureStreak {
    pub fn new(limit: u64, log_interval: u64) -> Self {
        Self {
            count: 0,
            limit,
            log_interval,
        }
    }

    pub fn record_failure(&mut self) -> StreakAction {
        self.count += 1;
        if self.count >= self.limit {
            StreakAction::GiveUp
        } else if should_log_drop(self.count, self.log_interval) {
            StreakAction::Log
        } else {
            StreakAction::Quiet
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_logging_is_rate_limited() {
        let logged: Vec<u64> = (1..=300).filter(|&n| should_log_drop(n, 100)).collect();
        assert_eq!(logged, vec![1, 100, 200, 300]);
    }

    #[test]
    fn failure_streak_logs_sparingly_then_gives_up() {
        let mut streak = FailureStreak::new(250, 100);
        let actions: Vec<StreakAction> = (0..250).map(|_| streak.record_failure()).collect();

        let logged = actions.iter().filter(|a| **a == StreakAction::Log).count();
        assert_eq!(logged, 3);
        assert_eq!(actions[248], StreakAction::Quiet);
        assert_eq!(actions[249], StreakAction::GiveUp);
    }

    #[test]
    fn success_resets_the_streak() {
        let mut streak = FailureStreak::new(3, 100);
        streak.record_failure();
        streak.record_failure();
        streak.reset();
        assert_eq!(streak.record_failure(), StreakAction::Log);
        assert_eq!(streak.count(), 1);
    }

    #[test]
    fn snapshots_reflect_records() {
        let counters = PublishCounters::default();
        counters.record_accepted();
        counters.record_accepted();
        assert_eq!(counters.record_dropped_inactive(), 1);

        assert_eq!(
            counters.snapshot(),
            PublishStats {
                accepted: 2,
                dropped_inactive: 1,
                rejected: 0
            }
        );
    }
}
