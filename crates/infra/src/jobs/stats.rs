//! Process-local processor statistics.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default number of processing durations kept for latency reporting.
pub const DEFAULT_LATENCY_WINDOW: usize = 100;

/// Counters and latency window of one Processor Worker.
///
/// Not persisted; reset on process start.
#[derive(Debug, Clone)]
pub struct ProcessorStats {
    start_time: DateTime<Utc>,
    total_jobs_processed: u64,
    successful_jobs: u64,
    failed_jobs: u64,
    total_errors: u64,
    consecutive_errors: u32,
    max_consecutive_errors: u32,
    processing_times: VecDeque<Duration>,
    window: usize,
}

impl Default for ProcessorStats {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

impl ProcessorStats {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            start_time: Utc::now(),
            total_jobs_processed: 0,
            successful_jobs: 0,
            failed_jobs: 0,
            total_errors: 0,
            consecutive_errors: 0,
            max_consecutive_errors: 0,
            processing_times: VecDeque::with_capacity(window),
            window,
        }
    }

    pub fn record_success(&mut self, elapsed: Duration) {
        self.total_jobs_processed += 1;
        self.successful_jobs += 1;
        self.consecutive_errors = 0;
        if self.processing_times.len() == self.window {
            self.processing_times.pop_front();
        }
        self.processing_times.push_back(elapsed);
    }

    pub fn record_failure(&mut self) {
        self.total_jobs_processed += 1;
        self.failed_jobs += 1;
        self.total_errors += 1;
        self.consecutive_errors += 1;
        self.max_consecutive_errors = self.max_consecutive_errors.max(self.consecutive_errors);
    }

    /// Store error outside any job outcome (claim or sweep failure).
    pub fn record_store_error(&mut self) {
        self.total_errors += 1;
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn max_consecutive_errors(&self) -> u32 {
        self.max_consecutive_errors
    }

    pub fn processing_times(&self) -> impl Iterator<Item = Duration> + '_ {
        self.processing_times.iter().copied()
    }

    pub fn average_processing_time(&self) -> Option<Duration> {
        if self.processing_times.is_empty() {
            return None;
        }
        let total: Duration = self.processing_times.iter().sum();
        Some(total / self.processing_times.len() as u32)
    }

    /// Nearest-rank percentile over the latency window (`p` in 0..=100).
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        if self.processing_times.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.processing_times.iter().copied().collect();
        sorted.sort();
        let rank = (p.clamp(0.0, 100.0) * sorted.len() as f64 / 100.0).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Utc::now();
        StatsSnapshot {
            start_time: self.start_time,
            uptime_secs: (now - self.start_time).num_seconds().max(0) as u64,
            total_jobs_processed: self.total_jobs_processed,
            successful_jobs: self.successful_jobs,
            failed_jobs: self.failed_jobs,
            total_errors: self.total_errors,
            consecutive_errors: self.consecutive_errors,
            max_consecutive_errors: self.max_consecutive_errors,
            samples: self.processing_times.len(),
            avg_processing_ms: self.average_processing_time().map(|d| d.as_millis() as u64),
            p95_processing_ms: self.percentile(95.0).map(|d| d.as_millis() as u64),
        }
    }
}

/// Serializable view of `ProcessorStats` for the stats endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub start_time: DateTime<Utc>,
    pub uptime_secs: u64,
    pub total_jobs_processed: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub total_errors: u64,
    pub consecutive_errors: u32,
    pub max_consecutive_errors: u32,
    pub samples: usize,
    pub avg_processing_ms: Option<u64>,
    pub p95_processing_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn success_resets_consecutive_errors() {
        let mut stats = ProcessorStats::default();
        stats.record_failure();
        stats.record_failure();
        assert_eq!(stats.consecutive_errors(), 2);

        stats.record_success(Duration::from_millis(5));
        assert_eq!(stats.consecutive_errors(), 0);
        assert_eq!(stats.max_consecutive_errors(), 2);

        let snap = stats.snapshot();
        assert_eq!(snap.total_jobs_processed, 3);
        assert_eq!(snap.successful_jobs, 1);
        assert_eq!(snap.failed_jobs, 2);
        assert_eq!(snap.total_errors, 2);
    }

    #[test]
    fn latency_window_drops_oldest() {
        let mut stats = ProcessorStats::new(3);
        for ms in [10, 20, 30, 40] {
            stats.record_success(Duration::from_millis(ms));
        }
        let kept: Vec<_> = stats.processing_times().map(|d| d.as_millis()).collect();
        assert_eq!(kept, vec![20, 30, 40]);
        assert_eq!(stats.average_processing_time(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let mut stats = ProcessorStats::new(100);
        for ms in 1..=100 {
            stats.record_success(Duration::from_millis(ms));
        }
        assert_eq!(stats.percentile(95.0), Some(Duration::from_millis(95)));
        assert_eq!(stats.percentile(100.0), Some(Duration::from_millis(100)));
        assert_eq!(stats.percentile(0.0), Some(Duration::from_millis(1)));
        assert_eq!(ProcessorStats::default().percentile(50.0), None);
    }

    #[test]
    fn store_errors_do_not_touch_the_streak() {
        let mut stats = ProcessorStats::default();
        stats.record_failure();
        stats.record_store_error();
        assert_eq!(stats.consecutive_errors(), 1);
        assert_eq!(stats.snapshot().total_errors, 2);
        assert_eq!(stats.snapshot().total_jobs_processed, 1);
    }

    proptest! {
        /// Property: the streak resets on success, grows by one on failure, and
        /// the high-water mark is its running maximum.
        #[test]
        fn consecutive_errors_track_the_outcome_stream(outcomes in prop::collection::vec(any::<bool>(), 0..200)) {
            let mut stats = ProcessorStats::new(16);
            let mut expected_streak = 0u32;
            let mut expected_max = 0u32;

            for ok in outcomes {
                let before = stats.consecutive_errors();
                if ok {
                    stats.record_success(Duration::from_millis(1));
                    expected_streak = 0;
                    prop_assert_eq!(stats.consecutive_errors(), 0);
                } else {
                    stats.record_failure();
                    expected_streak += 1;
                    prop_assert_eq!(stats.consecutive_errors(), before + 1);
                }
                expected_max = expected_max.max(expected_streak);
                prop_assert_eq!(stats.max_consecutive_errors(), expected_max);
                prop_assert!(stats.processing_times().count() <= 16);
            }
        }
    }
}
