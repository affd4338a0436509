use crate::error::ConfigError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Watermark-based pause/resume/drain primitive.
///
/// Producers report their buffer level as a fraction of capacity. When the
/// level reaches the high watermark the controller pauses; it resumes once
/// the level falls to the low watermark or below. Consumers of the signal
/// call [`drain`](Self::drain) to wait for a resume.
///
/// The level reading is best-effort: concurrent reporters may interleave, which
/// only shifts when the signal flips.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    high_watermark: f64,
    low_watermark: f64,
    max_pause: Duration,
    level_bits: AtomicU64,
    pause_events: AtomicU64,
    paused: watch::Sender<bool>,
}

impl BackpressureController {
    /// Default: high=0.8, low=0.4, drain waits at most 100ms
    pub fn new() -> Self {
        Self::build(0.8, 0.4, Duration::from_millis(100))
    }

    /// Pause at `threshold`, resume at half of it
    pub fn with_threshold(threshold: f64) -> Result<Self, ConfigError> {
        Self::with_watermarks(threshold, threshold / 2.0)
    }

    /// Explicit watermarks as fractions in `[0,1]`, `low <= high`
    pub fn with_watermarks(high: f64, low: f64) -> Result<Self, ConfigError> {
        for (field, value) in [("high_watermark", high), ("low_watermark", low)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange {
                    field,
                    value: value.to_string(),
                });
            }
        }
        if low > high {
            return Err(ConfigError::Invalid(format!(
                "low watermark {low} above high watermark {high}"
            )));
        }
        Ok(Self::build(high, low, Duration::from_millis(100)))
    }

    /// Upper bound on a single [`drain`](Self::drain) wait
    pub fn with_max_pause(self, max_pause: Duration) -> Self {
        Self::build(
            self.inner.high_watermark,
            self.inner.low_watermark,
            max_pause,
        )
    }

    fn build(high: f64, low: f64, max_pause: Duration) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                high_watermark: high,
                low_watermark: low,
                max_pause,
                level_bits: AtomicU64::new(0f64.to_bits()),
                pause_events: AtomicU64::new(0),
                paused,
            }),
        }
    }

    pub fn high_watermark(&self) -> f64 {
        self.inner.high_watermark
    }

    pub fn low_watermark(&self) -> f64 {
        self.inner.low_watermark
    }

    /// Record the current buffer level and update the pause state.
    /// Returns true if backpressure is now active.
    pub fn report_level(&self, level: f64) -> bool {
        let level = level.clamp(0.0, 1.0);
        self.inner.level_bits.store(level.to_bits(), Ordering::Relaxed);

        let was_paused = self.is_paused();
        let now_paused = if was_paused {
            level > self.inner.low_watermark
        } else {
            level >= self.inner.high_watermark
        };

        if now_paused && !was_paused {
            self.pause();
        } else if !now_paused && was_paused {
            self.resume();
        }
        now_paused
    }

    /// Last reported buffer level
    pub fn level(&self) -> f64 {
        f64::from_bits(self.inner.level_bits.load(Ordering::Relaxed))
    }

    pub fn pause(&self) {
        let was_paused = self.inner.paused.send_replace(true);
        if !was_paused {
            self.inner.pause_events.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(level = self.level(), "backpressure engaged");
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.send_replace(false) {
            tracing::debug!(level = self.level(), "backpressure released");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Wait until the controller is resumed, at most `max_pause`.
    /// Returns true if the wait ended by a resume.
    pub async fn drain(&self) -> bool {
        let mut rx = self.inner.paused.subscribe();
        if !*rx.borrow_and_update() {
            return true;
        }
        let resumed = matches!(
            tokio::time::timeout(self.inner.max_pause, rx.wait_for(|paused| !*paused)).await,
            Ok(Ok(_))
        );
        resumed
    }

    /// Number of times the controller transitioned into the paused state
    pub fn pause_events(&self) -> u64 {
        self.inner.pause_events.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.inner.level_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.inner.paused.send_replace(false);
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_activation() {
        let controller = BackpressureController::with_watermarks(0.8, 0.4).unwrap();
        assert!(!controller.report_level(0.5));
        assert!(controller.report_level(0.85));
        assert!(controller.is_paused());
        assert_eq!(controller.pause_events(), 1);
    }

    #[test]
    fn test_backpressure_hysteresis() {
        let controller = BackpressureController::with_watermarks(0.8, 0.4).unwrap();
        assert!(controller.report_level(0.9));
        // Between watermarks: stays paused
        assert!(controller.report_level(0.6));
        assert!(!controller.report_level(0.3));
        assert!(!controller.is_paused());
    }

    #[test]
    fn test_invalid_watermarks() {
        assert!(BackpressureController::with_watermarks(1.2, 0.4).is_err());
        assert!(BackpressureController::with_watermarks(0.4, 0.8).is_err());
        let controller = BackpressureController::with_threshold(0.5).unwrap();
        assert_eq!(controller.high_watermark(), 0.5);
        assert_eq!(controller.low_watermark(), 0.25);
    }

    #[tokio::test]
    async fn test_drain_returns_immediately_when_running() {
        let controller = BackpressureController::new();
        assert!(controller.drain().await);
    }

    #[tokio::test]
    async fn test_drain_waits_for_resume() {
        let controller = BackpressureController::new().with_max_pause(Duration::from_secs(5));
        controller.pause();

        let resumer = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resumer.resume();
        });

        assert!(controller.drain().await);
        assert!(!controller.is_paused());
    }

    #[tokio::test]
    async fn test_drain_is_bounded() {
        let controller = BackpressureController::new().with_max_pause(Duration::from_millis(10));
        controller.pause();
        assert!(!controller.drain().await);
        assert!(controller.is_paused());
    }
}
