//! Declarative stream pipelines
//!
//! A [`StreamPipeline`] is built by chaining stage methods onto a source and
//! is run by one of the terminal operations: [`collect`](StreamPipeline::collect),
//! [`reduce`](StreamPipeline::reduce), [`sink`](StreamPipeline::sink) or
//! [`execute`](StreamPipeline::execute). Execution is lazy and pull-based;
//! items flow only as fast as the terminal consumes them.
//!
//! `retry`, `timeout` and `catch` do not process items themselves. They set
//! the failure policy of the closest preceding stage:
//!
//! ```ignore
//! let out = StreamPipeline::new()
//!     .source(vec![1, 2, 3])
//!     .transform(|x| if x == 2 { Err("bad".into()) } else { Ok(x * 2) })
//!     .retry(2, Duration::from_millis(10))
//!     .catch(|_err, _item| Some(0))
//!     .collect()
//!     .await?;
//! assert_eq!(out, vec![2, 0, 6]);
//! ```

use crate::backpressure::BackpressureController;
use crate::chunk::ChunkStage;
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError, Result, StageError};
use crate::executor::{self, Hooks, ItemStream, RunContext};
pub use crate::executor::{ErrorHook, Progress, ProgressHook, RunState, StageFailure, StageReport};
use crate::logging::{Logger, PerformanceMonitor, TracingLogger};
use crate::metrics::PipelineMetrics;
use crate::offload::Offload;
use crate::pool::WorkerPool;
use crate::stage::{self, SourceSeq, Stage};
use futures::future::FutureExt;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Outcome of a run driven to completion
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// The run reached the end of its source without aborting
    pub success: bool,
    pub items_processed: u64,
    pub execution_time_ms: u64,
    /// Every item failure that exhausted its retries, caught or not
    pub errors: Vec<StageFailure>,
    pub warnings: Vec<String>,
    pub metrics: PipelineMetrics,
    pub stages: Vec<StageReport>,
}

impl PipelineResult {
    fn rejected(err: &PipelineError) -> Self {
        Self {
            errors: vec![StageFailure::from_pipeline_error(err)],
            ..Default::default()
        }
    }
}

/// Composable pipeline over items of type `T`
///
/// Stage methods consume the pipeline and return it with the stage appended.
/// Clones share the source, so only one of them can be run.
pub struct StreamPipeline<T: Send + 'static> {
    config: PipelineConfig,
    stages: Vec<Stage<T>>,
    hooks: Hooks,
}

impl<T: Send + 'static> Clone for StreamPipeline<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            stages: self.stages.clone(),
            hooks: self.hooks.clone(),
        }
    }
}

impl<T> Default for StreamPipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StreamPipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Pipeline with default configuration
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            stages: Vec::new(),
            hooks: Hooks {
                logger: Arc::new(TracingLogger),
                monitor: None,
                on_error: None,
                on_progress: None,
                controller: None,
            },
        }
    }

    pub fn with_config(config: PipelineConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let mut pipeline = Self::new();
        pipeline.config = config;
        Ok(pipeline)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Declared stages, in order
    pub fn stages(&self) -> &[Stage<T>] {
        &self.stages
    }

    /// Append an already-built stage
    pub fn stage(mut self, stage: Stage<T>) -> Self {
        self.stages.push(stage);
        self
    }

    fn source_seq(self, items: stream::BoxStream<'static, T>, total_known: Option<usize>) -> Self {
        let shared = Arc::new(Mutex::new(Some(SourceSeq { items, total_known })));
        self.stage(Stage::Source(shared))
    }

    /// Use an iterator as the source. An exact size hint is reported as
    /// `total_known` in progress updates.
    pub fn source<I>(self, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let iter = items.into_iter();
        let total_known = match iter.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(upper),
            _ => None,
        };
        self.source_seq(stream::iter(iter).boxed(), total_known)
    }

    /// Use an async stream as the source
    pub fn source_stream<S>(self, items: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        self.source_seq(items.boxed(), None)
    }

    /// Apply a fallible function to every item
    pub fn transform<F>(self, f: F) -> Self
    where
        F: Fn(T) -> std::result::Result<T, StageError> + Send + Sync + 'static,
    {
        self.stage(Stage::Transform(Arc::new(f)))
    }

    /// Apply an infallible function to every item
    pub fn map<F>(self, f: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        self.transform(move |item| Ok(f(item)))
    }

    /// Await an async function for every item, one at a time
    pub fn async_transform<F, Fut>(self, f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, StageError>> + Send + 'static,
    {
        self.stage(Stage::AsyncTransform(Arc::new(move |item| f(item).boxed())))
    }

    /// Keep items matching the predicate
    pub fn filter<P>(self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.try_filter(move |item| Ok(predicate(item)))
    }

    /// Keep items matching a fallible predicate; an error is a stage failure
    pub fn try_filter<P>(self, predicate: P) -> Self
    where
        P: Fn(&T) -> std::result::Result<bool, StageError> + Send + Sync + 'static,
    {
        self.stage(Stage::Filter(Arc::new(predicate)))
    }

    /// Group items into batches of `size`; the final batch may be smaller
    pub fn batch(self, size: usize) -> Self
    where
        T: From<Vec<T>>,
    {
        self.batch_with(size, |items| T::from(items))
    }

    /// Group items into batches of `size`, combining each with `assemble`
    pub fn batch_with<F>(self, size: usize, assemble: F) -> Self
    where
        F: Fn(Vec<T>) -> T + Send + Sync + 'static,
    {
        self.stage(Stage::Batch {
            size,
            assemble: Arc::new(assemble),
        })
    }

    /// Run up to `concurrency` items through `f` at once, keeping input
    /// order. Zero uses the configured `max_concurrency`.
    pub fn parallel<F, Fut>(self, concurrency: usize, f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, StageError>> + Send + 'static,
    {
        self.stage(Stage::Parallel {
            concurrency,
            work: Arc::new(move |item| f(item).boxed()),
        })
    }

    /// `parallel` stage that runs costly items on the worker pool
    pub fn parallel_offload(self, concurrency: usize, pool: WorkerPool, offload: Offload<T>) -> Self
    where
        T: Serialize + DeserializeOwned,
    {
        let offload = Arc::new(offload);
        self.parallel(concurrency, move |item| {
            let offload = Arc::clone(&offload);
            let pool = pool.clone();
            async move { offload.run(&pool, item).await }
        })
    }

    /// Spread items over `lanes` by `partition(item) % lanes`. Items in the
    /// same lane are processed in order; lanes run concurrently.
    pub fn distribute<P, F, Fut>(self, lanes: usize, partition: P, f: F) -> Self
    where
        P: Fn(&T) -> usize + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, StageError>> + Send + 'static,
    {
        self.stage(Stage::Distribute {
            lanes,
            partition: Arc::new(partition),
            work: Arc::new(move |item| f(item).boxed()),
        })
    }

    /// Feed the stream through a chunk processor in `chunk_size` windows
    pub fn chunked<C>(self, processor: C) -> Self
    where
        C: ChunkStage<T> + 'static,
    {
        self.stage(Stage::Chunked(Arc::new(processor)))
    }

    /// Recover from failures of the preceding stage. Returning `None` drops
    /// the item.
    pub fn catch<H>(self, handler: H) -> Self
    where
        H: Fn(&StageError, T) -> Option<T> + Send + Sync + 'static,
    {
        self.stage(Stage::Catch(Arc::new(handler)))
    }

    /// Re-attempt failures of the preceding stage up to `attempts` times
    pub fn retry(self, attempts: u32, delay: Duration) -> Self {
        self.stage(Stage::Retry { attempts, delay })
    }

    /// Fail attempts of the preceding stage that take longer than `limit`
    pub fn timeout(self, limit: Duration) -> Self {
        self.stage(Stage::Timeout(limit))
    }

    /// Terminal consumer as a stage, so `retry`/`timeout`/`catch` can follow
    /// it. Run with [`run`](Self::run).
    pub fn to_sink<F, Fut>(self, consume: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), StageError>> + Send + 'static,
    {
        self.stage(Stage::Sink(Arc::new(move |item| consume(item).boxed())))
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StageFailure) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    pub fn on_progress<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.hooks.on_progress = Some(Arc::new(hook));
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.hooks.logger = logger;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn PerformanceMonitor>) -> Self {
        self.hooks.monitor = Some(monitor);
        self
    }

    /// Buffering stages wait while `controller` is paused
    pub fn with_backpressure(mut self, controller: BackpressureController) -> Self {
        self.hooks.controller = Some(controller);
        self
    }

    /// Start a run and return its lazy output
    pub fn execute(self) -> Result<PipelineStream<T>> {
        self.config.validate()?;
        let plan = stage::compile(&self.stages, &self.config)?;
        let source = plan
            .source
            .lock()
            .take()
            .ok_or(PipelineError::SourceConsumed)?;

        let ctx = Arc::new(RunContext::new(
            self.config.id.clone(),
            self.hooks,
            &plan.steps,
            source.total_known,
            plan.warnings,
        ));
        ctx.start();
        let inner = executor::assemble(source.items.map(Ok).boxed(), plan.steps, &ctx);
        Ok(PipelineStream {
            inner,
            ctx,
            done: false,
        })
    }

    /// Run to completion and gather the output
    pub async fn collect(self) -> Result<Vec<T>> {
        self.fold_outputs(Vec::new(), |mut items, item| {
            items.push(item);
            items
        })
        .await
    }

    /// Run to completion, folding the output into one value
    pub async fn reduce<A, F>(self, f: F, initial: A) -> Result<A>
    where
        F: FnMut(A, T) -> A,
    {
        self.fold_outputs(initial, f).await
    }

    async fn fold_outputs<A, F>(self, initial: A, mut f: F) -> Result<A>
    where
        F: FnMut(A, T) -> A,
    {
        let mut output = self.execute()?;
        output.ctx.log_start().await;
        let mut acc = initial;
        let mut failure = None;
        while let Some(next) = output.next().await {
            match next {
                Ok(item) => acc = f(acc, item),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        output.ctx.log_finish().await;
        match failure {
            Some(err) => Err(err),
            None => Ok(acc),
        }
    }

    /// Consume every item with `consume`. Never fails: problems are reported
    /// in the result.
    pub async fn sink<F, Fut>(self, consume: F) -> PipelineResult
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), StageError>> + Send + 'static,
    {
        self.to_sink(consume).run().await
    }

    /// Drive the pipeline to completion, discarding any output
    pub async fn run(self) -> PipelineResult {
        let logger = Arc::clone(&self.hooks.logger);
        let mut output = match self.execute() {
            Ok(output) => output,
            Err(err) => {
                let result = PipelineResult::rejected(&err);
                let data = serde_json::to_value(&result.errors).ok();
                logger.error("pipeline could not start", data.as_ref()).await;
                return result;
            }
        };
        output.ctx.log_start().await;
        while let Some(next) = output.next().await {
            if next.is_err() {
                break;
            }
        }
        output.ctx.log_finish().await;
        output.report()
    }
}

/// Lazy output of a running pipeline
///
/// Yields items until the source is exhausted or a stage aborts; an abort is
/// yielded once as an `Err` and ends the stream.
pub struct PipelineStream<T> {
    inner: ItemStream<T>,
    ctx: Arc<RunContext>,
    done: bool,
}

impl<T> PipelineStream<T> {
    pub fn state(&self) -> RunState {
        self.ctx.state()
    }

    /// Report of the run so far
    pub fn report(&self) -> PipelineResult {
        self.ctx.report()
    }
}

impl<T> Stream for PipelineStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(item))) => {
                self.ctx.record_output();
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Some(Err(err))) => {
                self.done = true;
                self.ctx.finish(RunState::Failed);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.done = true;
                self.ctx.finish(RunState::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for PipelineStream<T> {
    fn drop(&mut self) {
        self.ctx.close_monitor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullLogger;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn quiet<T: Clone + Send + Sync + 'static>() -> StreamPipeline<T> {
        StreamPipeline::new().with_logger(Arc::new(NullLogger))
    }

    #[tokio::test]
    async fn test_filter_then_transform() {
        let out = quiet::<i32>()
            .source(vec![1, 2, 3, 4, 5])
            .filter(|x| x % 2 == 0)
            .map(|x| x * 10)
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![20, 40]);
    }

    #[tokio::test]
    async fn test_reduce() {
        let sum = quiet::<i64>()
            .source(1..=100)
            .reduce(|acc, x| acc + x, 0)
            .await
            .unwrap();
        assert_eq!(sum, 5050);
    }

    #[tokio::test]
    async fn test_batch_values() {
        let out = quiet::<Value>()
            .source((1..=5).map(|i| json!(i)))
            .batch(2)
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![json!([1, 2]), json!([3, 4]), json!([5])]);
    }

    #[tokio::test]
    async fn test_catch_replaces_failed_item() {
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        let out = quiet::<i32>()
            .source(vec![1, 2, 3])
            .transform(|x| if x == 2 { Err("two".into()) } else { Ok(x * 2) })
            .catch(|_, _| Some(0))
            .on_error(move |failure| {
                assert_eq!(failure.stage_index, 1);
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![2, 0, 6]);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_carries_stage() {
        let err = quiet::<i32>()
            .source(vec![1, 2, 3])
            .map(|x| x + 1)
            .transform(|x| if x == 3 { Err("boom".into()) } else { Ok(x) })
            .collect()
            .await
            .unwrap_err();
        match err {
            PipelineError::Abort {
                stage_name,
                stage_index,
                message,
            } => {
                assert_eq!(stage_name, "transform");
                assert_eq!(stage_index, 2);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let out = quiet::<i32>()
            .source(vec![7])
            .transform(move |x| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("flaky".into())
                } else {
                    Ok(x)
                }
            })
            .retry(3, Duration::from_millis(1))
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![7]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_source_consumed_once() {
        let pipeline = quiet::<i32>().source(vec![1, 2]).map(|x| x);
        let again = pipeline.clone();
        assert_eq!(pipeline.collect().await.unwrap(), vec![1, 2]);
        assert!(matches!(
            again.collect().await,
            Err(PipelineError::SourceConsumed)
        ));
    }

    #[tokio::test]
    async fn test_no_source() {
        let result = quiet::<i32>().map(|x| x).collect().await;
        assert!(matches!(result, Err(PipelineError::NoSource)));

        let report = quiet::<i32>().sink(|_| async { Ok(()) }).await;
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_states() {
        let mut output = quiet::<i32>().source(vec![1, 2]).execute().unwrap();
        assert_eq!(output.state(), RunState::Executing);
        assert_eq!(output.next().await.unwrap().unwrap(), 1);
        assert_eq!(output.next().await.unwrap().unwrap(), 2);
        assert!(output.next().await.is_none());
        assert_eq!(output.state(), RunState::Completed);
        assert_eq!(output.report().items_processed, 2);
    }

    #[tokio::test]
    async fn test_progress_reports_known_total() {
        let last = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&last);
        quiet::<i32>()
            .source(vec![1, 2, 3, 4])
            .on_progress(move |p| *sink.lock() = Some(*p))
            .collect()
            .await
            .unwrap();
        let progress = last.lock().unwrap();
        assert_eq!(progress.processed, 4);
        assert_eq!(progress.total_known, Some(4));
        assert_eq!(progress.percentage, Some(100.0));
    }

    #[test]
    fn test_invalid_config() {
        let config = PipelineConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        assert!(StreamPipeline::<i32>::with_config(config).is_err());
    }
}
