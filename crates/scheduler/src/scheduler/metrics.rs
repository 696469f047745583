use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler operational metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Configured bound on concurrent worker loops.
    pub max_degree_of_parallelism: usize,
    /// Units handed to `submit`.
    pub units_submitted: u64,
    /// Units executed by a worker loop after leaving the queue.
    pub units_executed: u64,
    /// Units executed through `try_inline`.
    pub units_inlined: u64,
    /// Executed units that returned an error or panicked.
    pub units_failed: u64,
    /// Units removed from the queue by `try_dequeue`.
    pub units_dequeued: u64,
    /// Queue entries a worker popped after the unit had already run elsewhere.
    pub units_skipped: u64,
    /// Worker loops requested from the substrate.
    pub workers_launched: u64,
    /// Worker loops the substrate rejected or dropped before they started.
    pub worker_launch_failures: u64,
    /// Worker loops alive right now.
    pub active_workers: usize,
    /// Highest number of simultaneously alive worker loops.
    pub peak_active_workers: usize,
    /// Units waiting in the pending queue.
    pub queue_depth: usize,
    /// Rolling mean execution time across all units.
    pub avg_unit_duration: Duration,
    /// When the scheduler last returned to idle.
    pub last_idle_at: Option<DateTime<Utc>>,
}

impl SchedulerMetrics {
    pub(crate) fn new(max_degree_of_parallelism: usize) -> Self {
        Self {
            max_degree_of_parallelism,
            ..Self::default()
        }
    }

    /// Record a unit execution.
    pub fn record_execution(&mut self, duration: Duration, inline: bool, failed: bool) {
        if inline {
            self.units_inlined += 1;
        } else {
            self.units_executed += 1;
        }
        if failed {
            self.units_failed += 1;
        }

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let count = self.units_executed + self.units_inlined;
        self.avg_unit_duration = if count == 1 {
            duration
        } else {
            let prev_nanos = self.avg_unit_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }

    /// Total units that actually ran, queued or inlined.
    pub fn total_executed(&self) -> u64 {
        self.units_executed + self.units_inlined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = SchedulerMetrics::new(4);
        m.record_execution(Duration::from_millis(100), false, false);

        assert_eq!(m.units_executed, 1);
        assert_eq!(m.units_inlined, 0);
        assert_eq!(m.avg_unit_duration, Duration::from_millis(100));
        assert_eq!(m.max_degree_of_parallelism, 4);
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut m = SchedulerMetrics::default();
        m.record_execution(Duration::from_millis(100), false, false);
        m.record_execution(Duration::from_millis(200), true, true);

        assert_eq!(m.total_executed(), 2);
        assert_eq!(m.units_inlined, 1);
        assert_eq!(m.units_failed, 1);
        // Average of 100ms and 200ms = 150ms
        let avg = m.avg_unit_duration.as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn default_metrics() {
        let m = SchedulerMetrics::default();
        assert_eq!(m.total_executed(), 0);
        assert_eq!(m.active_workers, 0);
        assert!(m.last_idle_at.is_none());
    }
}
