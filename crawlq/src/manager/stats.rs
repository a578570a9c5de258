use serde::Serialize;
use std::time::Duration;

/// Counters owned by one worker. Processes aggregate by collecting these.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub total_execution_time: Duration,
    pub tasks_processed: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub tasks_retried: usize,
    pub cache_hits: usize,
    pub robots_skips: usize,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_execution_time(&mut self, duration: Duration) {
        self.total_execution_time += duration;
        self.tasks_processed += 1;
    }

    pub fn record_success(&mut self) {
        self.tasks_succeeded += 1;
    }

    pub fn record_failure(&mut self) {
        self.tasks_failed += 1;
    }

    pub fn record_retry(&mut self) {
        self.tasks_retried += 1;
    }

    pub fn record_cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub fn record_robots_skip(&mut self) {
        self.robots_skips += 1;
    }

    pub fn average_execution_time(&self) -> Duration {
        if self.tasks_processed == 0 {
            return Duration::ZERO;
        }
        self.total_execution_time / self.tasks_processed as u32
    }

    /// Sum of several workers' counters.
    pub fn merge<'a>(stats: impl IntoIterator<Item = &'a WorkerStats>) -> WorkerStats {
        stats.into_iter().fold(WorkerStats::new(), |mut total, s| {
            total.total_execution_time += s.total_execution_time;
            total.tasks_processed += s.tasks_processed;
            total.tasks_succeeded += s.tasks_succeeded;
            total.tasks_failed += s.tasks_failed;
            total.tasks_retried += s.tasks_retried;
            total.cache_hits += s.cache_hits;
            total.robots_skips += s.robots_skips;
            total
        })
    }
}
