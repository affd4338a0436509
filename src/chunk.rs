//! Chunk-level processing with memory accounting and admission control
//!
//! A [`ChunkProcessor`] applies a transformation to a batch of items, keeps
//! the results in a bounded output buffer and re-emits them in `chunk_size`
//! groups. The buffer's estimated memory footprint drives backpressure: once
//! it crosses `max_buffer_size * backpressure_threshold` the attached
//! [`BackpressureController`] is paused and the next call waits on `drain()`
//! before doing more work.
//!
//! Failures are tolerated up to `error_tolerance` (failed chunks over total
//! chunks). Below that rate a failing chunk is handed to the error handler,
//! whose replacement (or nothing) keeps the stream alive.

use crate::backpressure::BackpressureController;
use crate::config::ChunkProcessingConfig;
use crate::error::{ChunkError, ConfigError, StageError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fixed bookkeeping cost added to every buffered item
pub const ITEM_OVERHEAD_BYTES: usize = 16;

/// Rough in-memory size of a value
pub trait MemoryFootprint {
    fn estimated_bytes(&self) -> usize;
}

/// Bytes needed for the magnitude of an integer, never less than a machine word
fn magnitude_bytes(bits: u32) -> usize {
    (bits as usize).div_ceil(8).max(8)
}

/// Strings of digits are treated as big integers and sized by magnitude
fn digit_string_bytes(s: &str) -> Option<usize> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.len() > 19 && digits.bytes().all(|b| b.is_ascii_digit()) {
        // log2(10) bits per decimal digit
        let bits = (digits.len() as f64 * std::f64::consts::LOG2_10).ceil() as u32;
        Some(magnitude_bytes(bits))
    } else {
        None
    }
}

impl MemoryFootprint for Value {
    fn estimated_bytes(&self) -> usize {
        match self {
            Value::Null | Value::Bool(_) => 8,
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    magnitude_bytes(u64::BITS - u.leading_zeros())
                } else {
                    8
                }
            }
            Value::String(s) => digit_string_bytes(s).unwrap_or(s.len()),
            Value::Array(items) => 24 + items.iter().map(|v| v.estimated_bytes()).sum::<usize>(),
            Value::Object(map) => {
                24 + map
                    .iter()
                    .map(|(k, v)| k.len() + v.estimated_bytes())
                    .sum::<usize>()
            }
        }
    }
}

impl MemoryFootprint for String {
    fn estimated_bytes(&self) -> usize {
        digit_string_bytes(self).unwrap_or(self.len())
    }
}

impl MemoryFootprint for u128 {
    fn estimated_bytes(&self) -> usize {
        magnitude_bytes(u128::BITS - self.leading_zeros())
    }
}

impl MemoryFootprint for i128 {
    fn estimated_bytes(&self) -> usize {
        self.unsigned_abs().estimated_bytes()
    }
}

macro_rules! fixed_footprint {
    ($($t:ty),*) => {
        $(impl MemoryFootprint for $t {
            fn estimated_bytes(&self) -> usize {
                std::mem::size_of::<$t>()
            }
        })*
    };
}

fixed_footprint!(bool, u8, i8, u16, i16, u32, i32, u64, i64, usize, isize, f32, f64);

impl<T: MemoryFootprint> MemoryFootprint for Vec<T> {
    fn estimated_bytes(&self) -> usize {
        24 + self.iter().map(|v| v.estimated_bytes()).sum::<usize>()
    }
}

/// Per-chunk metadata handed to the transformation
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub index: usize,
    pub total_chunks: Option<usize>,
    pub metadata: HashMap<String, Value>,
    pub start_time: Instant,
    pub processing_time: Duration,
    pub memory_used_bytes: usize,
}

impl ProcessingContext {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            total_chunks: None,
            metadata: HashMap::new(),
            start_time: Instant::now(),
            processing_time: Duration::ZERO,
            memory_used_bytes: 0,
        }
    }

    pub fn with_total(mut self, total_chunks: usize) -> Self {
        self.total_chunks = Some(total_chunks);
        self
    }
}

pub type ChunkTransform<T> =
    Arc<dyn Fn(Vec<T>, &mut ProcessingContext) -> Result<Vec<T>, StageError> + Send + Sync>;

pub type ChunkErrorHandler<T> = Arc<dyn Fn(&StageError, &[T]) -> Option<Vec<T>> + Send + Sync>;

/// Counters exposed by [`ChunkProcessor::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub total_chunks: u64,
    pub failed_chunks: u64,
    pub backpressure_events: u64,
    pub buffered_items: usize,
}

#[derive(Default)]
struct OutputBuffer<T> {
    items: VecDeque<T>,
    bytes: usize,
}

/// Applies a chunk transformation with buffering, backpressure and error tolerance
pub struct ChunkProcessor<T> {
    config: ChunkProcessingConfig,
    transform: ChunkTransform<T>,
    error_handler: Option<ChunkErrorHandler<T>>,
    controller: Option<BackpressureController>,
    buffer: Mutex<OutputBuffer<T>>,
    total_chunks: AtomicU64,
    failed_chunks: AtomicU64,
    backpressure_events: AtomicU64,
}

impl<T> ChunkProcessor<T>
where
    T: MemoryFootprint + Clone + Send + 'static,
{
    pub fn new<F>(config: ChunkProcessingConfig, transform: F) -> Result<Self, ConfigError>
    where
        F: Fn(Vec<T>, &mut ProcessingContext) -> Result<Vec<T>, StageError> + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self {
            config,
            transform: Arc::new(transform),
            error_handler: None,
            controller: None,
            buffer: Mutex::new(OutputBuffer {
                items: VecDeque::new(),
                bytes: 0,
            }),
            total_chunks: AtomicU64::new(0),
            failed_chunks: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
        })
    }

    /// Attach a pause/resume controller consulted before each chunk
    pub fn with_backpressure(mut self, controller: BackpressureController) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Replace the default error handler, which drops the failing chunk
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&StageError, &[T]) -> Option<Vec<T>> + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn config(&self) -> &ChunkProcessingConfig {
        &self.config
    }

    pub fn controller(&self) -> Option<&BackpressureController> {
        self.controller.as_ref()
    }

    /// Transform one chunk and return every complete `chunk_size` group now
    /// available in the output buffer. Leftovers stay buffered until the next
    /// call or [`flush`](Self::flush).
    pub async fn process_chunk(
        &self,
        items: Vec<T>,
        context: &mut ProcessingContext,
    ) -> Result<Vec<T>, ChunkError> {
        let total = self.total_chunks.fetch_add(1, Ordering::Relaxed) + 1;

        if self.config.enable_backpressure && self.should_apply_backpressure() {
            if let Some(controller) = &self.controller {
                self.backpressure_events.fetch_add(1, Ordering::Relaxed);
                controller.pause();
                if !controller.drain().await {
                    debug!(
                        chunk = context.index,
                        bytes = self.get_memory_usage(),
                        "backpressure drain timed out, continuing"
                    );
                }
            }
        }

        context.start_time = Instant::now();
        let outcome = self.run_with_retries(items, context).await;
        context.processing_time = context.start_time.elapsed();

        let produced = match outcome {
            Ok(produced) => produced,
            Err((err, chunk)) => {
                let failed = self.failed_chunks.fetch_add(1, Ordering::Relaxed) + 1;
                let rate = failed as f64 / total as f64;
                if rate > self.config.error_tolerance {
                    return Err(ChunkError::ToleranceExceeded {
                        failed,
                        total,
                        tolerance: self.config.error_tolerance,
                        source: err,
                    });
                }
                warn!(
                    chunk = context.index,
                    error = %err,
                    rate,
                    "chunk failed within tolerance"
                );
                self.handle_processing_error(&err, &chunk).unwrap_or_default()
            }
        };

        let ready = {
            let mut buffer = self.buffer.lock();
            for item in produced {
                buffer.bytes += item.estimated_bytes() + ITEM_OVERHEAD_BYTES;
                buffer.items.push_back(item);
            }
            let complete = (buffer.items.len() / self.config.chunk_size) * self.config.chunk_size;
            let ready: Vec<T> = buffer.items.drain(..complete).collect();
            for item in &ready {
                buffer.bytes = buffer
                    .bytes
                    .saturating_sub(item.estimated_bytes() + ITEM_OVERHEAD_BYTES);
            }
            context.memory_used_bytes = buffer.bytes;
            ready
        };
        self.report_level();
        Ok(ready)
    }

    async fn run_with_retries(
        &self,
        items: Vec<T>,
        context: &mut ProcessingContext,
    ) -> Result<Vec<T>, (StageError, Vec<T>)> {
        let attempts = self.config.retry_attempts + 1;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match (self.transform)(items.clone(), context) {
                Ok(out) => return Ok(out),
                Err(err) => {
                    debug!(chunk = context.index, attempt, error = %err, "chunk attempt failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }
        let err = last_error.unwrap_or_else(|| StageError::msg("chunk transform failed"));
        Err((err, items))
    }

    /// Replacement for a failed chunk; `None` drops it
    pub fn handle_processing_error(&self, err: &StageError, chunk: &[T]) -> Option<Vec<T>> {
        match &self.error_handler {
            Some(handler) => handler(err, chunk),
            None => None,
        }
    }

    /// Return and clear everything still buffered
    pub fn flush(&self) -> Vec<T> {
        let drained: Vec<T> = {
            let mut buffer = self.buffer.lock();
            buffer.bytes = 0;
            buffer.items.drain(..).collect()
        };
        self.report_level();
        drained
    }

    /// Estimated bytes held in the output buffer
    pub fn get_memory_usage(&self) -> usize {
        self.buffer.lock().bytes
    }

    pub fn should_apply_backpressure(&self) -> bool {
        self.get_memory_usage() > self.config.backpressure_limit()
    }

    pub fn stats(&self) -> ChunkStats {
        ChunkStats {
            total_chunks: self.total_chunks.load(Ordering::Relaxed),
            failed_chunks: self.failed_chunks.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            buffered_items: self.buffer.lock().items.len(),
        }
    }

    fn report_level(&self) {
        if let Some(controller) = &self.controller {
            let level = self.get_memory_usage() as f64 / self.config.max_buffer_size as f64;
            controller.report_level(level);
        }
    }
}

/// Object-safe view of a chunk processor, as used by the `chunked` pipeline stage
#[async_trait]
pub trait ChunkStage<T: Send + 'static>: Send + Sync {
    fn chunk_size(&self) -> usize;

    async fn process(
        &self,
        items: Vec<T>,
        context: &mut ProcessingContext,
    ) -> Result<Vec<T>, ChunkError>;

    fn flush(&self) -> Vec<T>;
}

#[async_trait]
impl<T> ChunkStage<T> for ChunkProcessor<T>
where
    T: MemoryFootprint + Clone + Send + Sync + 'static,
{
    fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    async fn process(
        &self,
        items: Vec<T>,
        context: &mut ProcessingContext,
    ) -> Result<Vec<T>, ChunkError> {
        self.process_chunk(items, context).await
    }

    fn flush(&self) -> Vec<T> {
        ChunkProcessor::flush(self)
    }
}

#[async_trait]
impl<T, C> ChunkStage<T> for Arc<C>
where
    T: Send + 'static,
    C: ChunkStage<T> + ?Sized,
{
    fn chunk_size(&self) -> usize {
        (**self).chunk_size()
    }

    async fn process(
        &self,
        items: Vec<T>,
        context: &mut ProcessingContext,
    ) -> Result<Vec<T>, ChunkError> {
        (**self).process(items, context).await
    }

    fn flush(&self) -> Vec<T> {
        (**self).flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(chunk_size: usize) -> ChunkProcessingConfig {
        ChunkProcessingConfig {
            chunk_size,
            retry_attempts: 0,
            retry_delay_ms: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_value_footprint() {
        assert_eq!(json!(1).estimated_bytes(), 8);
        assert_eq!(json!("hello").estimated_bytes(), 5);
        assert_eq!(json!([1, 2]).estimated_bytes(), 24 + 16);
        assert_eq!(json!({"ab": 1}).estimated_bytes(), 24 + 2 + 8);
        // 40 decimal digits need 133 bits, 17 bytes
        let big = "1".repeat(40);
        assert_eq!(Value::String(big).estimated_bytes(), 17);
        assert_eq!(u128::MAX.estimated_bytes(), 16);
        assert_eq!(1u128.estimated_bytes(), 8);
    }

    #[tokio::test]
    async fn test_regroups_into_chunks() {
        let processor =
            ChunkProcessor::new(config(2), |items: Vec<i64>, _ctx: &mut ProcessingContext| {
                Ok(items.into_iter().map(|x| x * 10).collect())
            })
            .unwrap();

        let mut ctx = ProcessingContext::new(0);
        let out = processor.process_chunk(vec![1, 2, 3], &mut ctx).await.unwrap();
        assert_eq!(out, vec![10, 20]);
        assert_eq!(processor.stats().buffered_items, 1);
        assert!(ctx.memory_used_bytes > 0);

        assert_eq!(processor.flush(), vec![30]);
        assert!(processor.flush().is_empty());
        assert_eq!(processor.get_memory_usage(), 0);
    }

    #[tokio::test]
    async fn test_failure_within_tolerance_uses_handler() {
        let cfg = ChunkProcessingConfig {
            error_tolerance: 0.5,
            ..config(1)
        };
        let processor = ChunkProcessor::new(cfg, |items: Vec<i64>, ctx: &mut ProcessingContext| {
            if ctx.index == 1 {
                Err(StageError::msg("bad chunk"))
            } else {
                Ok(items)
            }
        })
        .unwrap()
        .with_error_handler(|_err, chunk| Some(vec![-(chunk.len() as i64)]));

        let mut ctx = ProcessingContext::new(0);
        assert_eq!(processor.process_chunk(vec![7], &mut ctx).await.unwrap(), vec![7]);
        let mut ctx = ProcessingContext::new(1);
        assert_eq!(processor.process_chunk(vec![8, 9], &mut ctx).await.unwrap(), vec![-2]);
        assert_eq!(processor.stats().failed_chunks, 1);
    }

    #[tokio::test]
    async fn test_failure_beyond_tolerance_propagates() {
        let processor = ChunkProcessor::new(config(1), |_items: Vec<i64>, _ctx: &mut ProcessingContext| {
            Err(StageError::msg("always"))
        })
        .unwrap();

        let mut ctx = ProcessingContext::new(0);
        let err = processor.process_chunk(vec![1], &mut ctx).await.unwrap_err();
        assert!(matches!(err, ChunkError::ToleranceExceeded { failed: 1, total: 1, .. }));
    }

    #[tokio::test]
    async fn test_retries_before_failing() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let cfg = ChunkProcessingConfig {
            retry_attempts: 3,
            ..config(1)
        };
        let processor = ChunkProcessor::new(cfg, move |items: Vec<i64>, _ctx: &mut ProcessingContext| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StageError::msg("flaky"))
            } else {
                Ok(items)
            }
        })
        .unwrap();

        let mut ctx = ProcessingContext::new(0);
        assert_eq!(processor.process_chunk(vec![5], &mut ctx).await.unwrap(), vec![5]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backpressure_engages_over_budget() {
        let cfg = ChunkProcessingConfig {
            chunk_size: 100,
            max_buffer_size: 100,
            backpressure_threshold: 0.5,
            ..config(100)
        };
        let controller = BackpressureController::new().with_max_pause(Duration::from_millis(5));
        let processor = ChunkProcessor::new(cfg, |items: Vec<String>, _ctx: &mut ProcessingContext| Ok(items))
            .unwrap()
            .with_backpressure(controller.clone());

        let mut ctx = ProcessingContext::new(0);
        processor
            .process_chunk(vec!["x".repeat(80)], &mut ctx)
            .await
            .unwrap();
        assert!(processor.should_apply_backpressure());
        assert!(controller.is_paused());

        let mut ctx = ProcessingContext::new(1);
        processor.process_chunk(vec![], &mut ctx).await.unwrap();
        assert_eq!(processor.stats().backpressure_events, 1);

        processor.flush();
        assert!(!controller.is_paused());
    }
}
