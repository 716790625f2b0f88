//! Per-connection client statistics.
//!
//! `num_completed` counts failures too, so `num_completed >= num_failed`
//! always holds, and once nothing is in flight `num_completed ==
//! num_queued`. Latency is submit → completion, recorded in nanoseconds
//! and reported in microseconds.

use metriken::AtomicHistogram;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct ClientStats {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    latency: AtomicHistogram,
}

impl ClientStats {
    pub(crate) fn new() -> Self {
        Self {
            queued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            latency: AtomicHistogram::new(7, 64),
        }
    }

    pub(crate) fn record_queued(&self, n: u64) {
        self.queued.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_completion(&self, ok: bool, elapsed: Duration) {
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        // Failures first: a reader never sees failed > completed.
        self.completed.fetch_add(1, Ordering::Release);
        let _ = self.latency.increment(elapsed.as_nanos() as u64);
    }

    /// Submit-to-completion latency, nanoseconds.
    pub fn latency(&self) -> &AtomicHistogram {
        &self.latency
    }

    pub fn snapshot(&self) -> ClientStatsSnapshot {
        let num_completed = self.completed.load(Ordering::Acquire);
        let num_failed = self.failed.load(Ordering::Relaxed).min(num_completed);
        let mut snap = ClientStatsSnapshot {
            num_queued: self.queued.load(Ordering::Relaxed).max(num_completed),
            num_completed,
            num_failed,
            ..Default::default()
        };
        if let Some(hist) = self.latency.load() {
            if let Ok(Some(results)) = hist.percentiles(&[50.0, 90.0, 99.0]) {
                for (pct, bucket) in results {
                    let us = bucket.end() / 1000;
                    if pct == 50.0 {
                        snap.p50_us = us;
                    } else if pct == 90.0 {
                        snap.p90_us = us;
                    } else {
                        snap.p99_us = us;
                    }
                }
            }
        }
        snap
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStatsSnapshot {
    pub num_queued: u64,
    pub num_completed: u64,
    pub num_failed: u64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
}

impl fmt::Display for ClientStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "num_queued={} num_completed={} num_failed={} p50_us={} p90_us={} p99_us={}",
            self.num_queued,
            self.num_completed,
            self.num_failed,
            self.p50_us,
            self.p90_us,
            self.p99_us
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_format() {
        let stats = ClientStats::new();
        stats.record_queued(3);
        stats.record_completion(true, Duration::from_micros(100));
        stats.record_completion(false, Duration::from_micros(200));

        let snap = stats.snapshot();
        assert_eq!(snap.num_queued, 3);
        assert_eq!(snap.num_completed, 2);
        assert_eq!(snap.num_failed, 1);
        assert!(snap.p99_us >= snap.p50_us);
        assert!(snap
            .to_string()
            .starts_with("num_queued=3 num_completed=2 num_failed=1 p50_us="));
    }
}
