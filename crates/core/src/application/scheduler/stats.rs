// Scheduler statistics and health views

use super::constants::DEGRADED_AFTER_POLL_FAILURES;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};

/// Snapshot of scheduler counters. Returned by value; callers never see the lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub batches_retried: u64,
    pub lock_contentions: u64,
    pub consecutive_poll_failures: u32,
    pub total_activities: u64,
    pub successful_activities: u64,
    pub failed_activities: u64,
    pub total_emissions: f64,
    pub average_processing_time_ms: u64,
    pub last_polling_time: Option<i64>,
    pub next_polling_time: Option<i64>,
    pub workers_active: usize,
    /// Batches returned by the last poll
    pub pending_batches: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Stopped,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub scheduler_running: bool,
    pub batches_processed: u64,
    pub workers_active: usize,
    pub pending_batches: usize,
    pub total_emissions: f64,
    pub timestamp: i64,
}

impl HealthStatus {
    pub fn from_stats(stats: &SchedulerStats, running: bool, timestamp: i64) -> Self {
        let status = if !running {
            HealthState::Stopped
        } else if stats.consecutive_poll_failures >= DEGRADED_AFTER_POLL_FAILURES {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        Self {
            status,
            scheduler_running: running,
            batches_processed: stats.batches_processed,
            workers_active: stats.workers_active,
            pending_batches: stats.pending_batches,
            total_emissions: stats.total_emissions,
            timestamp,
        }
    }
}

/// How one dispatched batch ended, as far as the counters care
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BatchTally {
    Completed {
        successful: u64,
        failed: u64,
        emissions: f64,
        elapsed_ms: u64,
    },
    Failed {
        elapsed_ms: u64,
    },
}

#[derive(Default)]
struct Counters {
    stats: SchedulerStats,
    timed_batches: u64,
}

impl Counters {
    fn add_timing(&mut self, elapsed_ms: u64) {
        self.timed_batches += 1;
        let n = self.timed_batches;
        let avg = self.stats.average_processing_time_ms;
        self.stats.average_processing_time_ms = (avg * (n - 1) + elapsed_ms) / n;
    }
}

/// Read-write locked counters, separate from the worker pool
#[derive(Default)]
pub(crate) struct StatsRecorder {
    inner: RwLock<Counters>,
}

impl StatsRecorder {
    fn update(&self, f: impl FnOnce(&mut Counters)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    /// Snapshot with the live pool occupancy filled in
    pub fn snapshot(&self, workers_active: usize) -> SchedulerStats {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = guard.stats.clone();
        stats.workers_active = workers_active;
        stats
    }

    pub fn record_poll(&self, polled_at: i64, next_poll_at: i64, pending: usize) {
        self.update(|c| {
            c.stats.last_polling_time = Some(polled_at);
            c.stats.next_polling_time = Some(next_poll_at);
            c.stats.pending_batches = pending;
            c.stats.consecutive_poll_failures = 0;
        });
    }

    pub fn record_poll_failure(&self, polled_at: i64, next_poll_at: i64) {
        self.update(|c| {
            c.stats.last_polling_time = Some(polled_at);
            c.stats.next_polling_time = Some(next_poll_at);
            c.stats.consecutive_poll_failures += 1;
        });
    }

    pub fn record_lock_contention(&self) {
        self.update(|c| c.stats.lock_contentions += 1);
    }

    pub fn record_retried(&self, count: u64) {
        self.update(|c| c.stats.batches_retried += count);
    }

    pub fn record_batch(&self, tally: BatchTally) {
        self.update(|c| match tally {
            BatchTally::Completed {
                successful,
                failed,
                emissions,
                elapsed_ms,
            } => {
                c.stats.batches_processed += 1;
                c.stats.total_activities += successful + failed;
                c.stats.successful_activities += successful;
                c.stats.failed_activities += failed;
                c.stats.total_emissions += emissions;
                c.add_timing(elapsed_ms);
            }
            BatchTally::Failed { elapsed_ms } => {
                c.stats.batches_failed += 1;
                c.add_timing(elapsed_ms);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_states() {
        let mut stats = SchedulerStats::default();
        assert_eq!(HealthStatus::from_stats(&stats, false, 0).status, HealthState::Stopped);
        assert_eq!(HealthStatus::from_stats(&stats, true, 0).status, HealthState::Healthy);

        stats.consecutive_poll_failures = DEGRADED_AFTER_POLL_FAILURES;
        assert_eq!(HealthStatus::from_stats(&stats, true, 0).status, HealthState::Degraded);
    }

    #[test]
    fn test_successful_poll_clears_failures() {
        let recorder = StatsRecorder::default();
        for i in 0..3 {
            recorder.record_poll_failure(i, i + 10);
        }
        assert_eq!(recorder.snapshot(0).consecutive_poll_failures, 3);

        recorder.record_poll(100, 130, 2);
        let stats = recorder.snapshot(1);
        assert_eq!(stats.consecutive_poll_failures, 0);
        assert_eq!(stats.pending_batches, 2);
        assert_eq!(stats.workers_active, 1);
        assert_eq!(stats.next_polling_time, Some(130));
    }

    #[test]
    fn test_batch_tally_and_average_time() {
        let recorder = StatsRecorder::default();
        recorder.record_batch(BatchTally::Completed {
            successful: 9,
            failed: 1,
            emissions: 18.0,
            elapsed_ms: 100,
        });
        recorder.record_batch(BatchTally::Failed { elapsed_ms: 300 });

        let stats = recorder.snapshot(0);
        assert_eq!(stats.batches_processed, 1);
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.total_activities, 10);
        assert_eq!(stats.failed_activities, 1);
        assert_eq!(stats.total_emissions, 18.0);
        assert_eq!(stats.average_processing_time_ms, 200);
    }
}
