use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of latency samples
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    samples: Arc<Mutex<VecDeque<Duration>>>,
    window_size: usize,
}

impl PercentileTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size: window_size.max(1),
        }
    }

    pub fn record(&self, sample: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.window_size {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Percentile `p` in `[0,1]` of the window, in milliseconds
    pub fn percentile_ms(&self, p: f64) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<Duration> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx.min(sorted.len() - 1)].as_nanos() as f64 / 1_000_000.0
    }

    pub fn mean_ms(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 0.0;
        }
        let total: Duration = samples.iter().sum();
        total.as_nanos() as f64 / 1_000_000.0 / samples.len() as f64
    }

    pub fn count(&self) -> usize {
        self.samples.lock().len()
    }
}

/// Per-stage counters, shared between the executor and result reporting
#[derive(Debug, Clone)]
pub struct StageMetrics {
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    retries: Arc<AtomicU64>,
    latency: PercentileTracker,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            retries: Arc::new(AtomicU64::new(0)),
            latency: PercentileTracker::new(1000),
        }
    }

    pub fn record_processed(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.latency.record(elapsed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn total_retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn latency(&self) -> &PercentileTracker {
        &self.latency
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Run-level counters for one pipeline execution
#[derive(Debug)]
pub struct RunMetrics {
    started: Instant,
    emitted: AtomicU64,
    failed_items: AtomicU64,
    backpressure_events: AtomicU64,
    latency: PercentileTracker,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            emitted: AtomicU64::new(0),
            failed_items: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            latency: PercentileTracker::new(1000),
        }
    }

    /// An item reached the end of the pipeline
    pub fn record_emitted(&self, since_last: Duration) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        self.latency.record(since_last);
    }

    pub fn record_failed_item(&self) {
        self.failed_items.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn failed_items(&self) -> u64 {
        self.failed_items.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> PipelineMetrics {
        let elapsed = self.elapsed().as_secs_f64();
        let emitted = self.emitted();
        let failed = self.failed_items();
        let attempted = emitted + failed;
        PipelineMetrics {
            throughput: if elapsed > 0.0 {
                emitted as f64 / elapsed
            } else {
                0.0
            },
            latency_ms: self.latency.mean_ms(),
            latency_p99_ms: self.latency.percentile_ms(0.99),
            error_rate: if attempted > 0 {
                failed as f64 / attempted as f64
            } else {
                0.0
            },
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
        }
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal metrics summary of a pipeline run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineMetrics {
    /// Items emitted per second
    pub throughput: f64,
    /// Mean time between emitted items, in milliseconds
    pub latency_ms: f64,
    pub latency_p99_ms: f64,
    /// Failed items over attempted items
    pub error_rate: f64,
    pub backpressure_events: u64,
}

impl PipelineMetrics {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Throughput: {:.2} items/s, Latency mean: {:.3}ms, P99: {:.3}ms, \
             Error rate: {:.2}%, Backpressure events: {}",
            self.throughput,
            self.latency_ms,
            self.latency_p99_ms,
            self.error_rate * 100.0,
            self.backpressure_events
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_tracker() {
        let tracker = PercentileTracker::new(10);
        for i in 1..=10 {
            tracker.record(Duration::from_millis(i));
        }
        assert_eq!(tracker.percentile_ms(0.5), 5.0);
        assert_eq!(tracker.percentile_ms(0.99), 10.0);
        assert!((tracker.mean_ms() - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_tracker_window_evicts_oldest() {
        let tracker = PercentileTracker::new(3);
        for i in 1..=5 {
            tracker.record(Duration::from_millis(i));
        }
        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.percentile_ms(0.0), 3.0);
    }

    #[test]
    fn test_stage_metrics() {
        let metrics = StageMetrics::new();
        for _ in 0..100 {
            metrics.record_processed(Duration::from_micros(10));
        }
        metrics.record_failed();
        metrics.record_retry();
        assert_eq!(metrics.total_processed(), 100);
        assert_eq!(metrics.total_failed(), 1);
        assert_eq!(metrics.total_retries(), 1);
    }

    #[test]
    fn test_run_metrics_error_rate() {
        let run = RunMetrics::new();
        for _ in 0..3 {
            run.record_emitted(Duration::from_millis(1));
        }
        run.record_failed_item();
        run.record_backpressure();
        let snapshot = run.snapshot();
        assert!((snapshot.error_rate - 0.25).abs() < 1e-9);
        assert_eq!(snapshot.backpressure_events, 1);
        assert!(snapshot.format().contains("Backpressure events: 1"));
    }
}
