//! Pull-based execution of a compiled plan
//!
//! Each step wraps the stream produced by the previous one, so nothing runs
//! until the terminal consumer polls. Per-item stages go through
//! [`run_item`], which applies the step's retry, timeout and catch policy and
//! records every exhausted failure exactly once.

use crate::backpressure::BackpressureController;
use crate::chunk::{ChunkStage, ProcessingContext};
use crate::error::{PipelineError, Result, StageError};
use crate::logging::{Logger, PerformanceMonitor};
use crate::metrics::{RunMetrics, StageMetrics};
use crate::pipeline::PipelineResult;
use crate::stage::{AssembleFn, Op, PartitionFn, Step};
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub(crate) type ItemStream<T> = BoxStream<'static, Result<T>>;

/// Called once for every item failure that exhausted its retries
pub type ErrorHook = Arc<dyn Fn(&StageFailure) + Send + Sync>;

/// Called after every item that reaches the end of the pipeline
pub type ProgressHook = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Lifecycle of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Built,
    Executing,
    Completed,
    Failed,
}

/// A stage failure that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageFailure {
    #[serde(rename = "error")]
    pub message: String,
    pub stage_name: String,
    pub stage_index: usize,
    /// Attempts made, including the first
    pub attempts: u32,
    pub timed_out: bool,
}

impl StageFailure {
    fn new(stage_index: usize, stage_name: &str, err: &StageError, attempts: u32) -> Self {
        Self {
            message: err.to_string(),
            stage_name: stage_name.to_string(),
            stage_index,
            attempts,
            timed_out: err.is_timeout(),
        }
    }

    /// Failure of the run as a whole, before any stage ran
    pub(crate) fn from_pipeline_error(err: &PipelineError) -> Self {
        let (stage_index, stage_name) = err.stage().unwrap_or((0, "pipeline"));
        Self {
            message: err.to_string(),
            stage_name: stage_name.to_string(),
            stage_index,
            attempts: 0,
            timed_out: false,
        }
    }

    fn to_abort(&self) -> PipelineError {
        PipelineError::Abort {
            stage_name: self.stage_name.clone(),
            stage_index: self.stage_index,
            message: self.message.clone(),
        }
    }
}

/// Progress snapshot passed to the progress hook
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub processed: u64,
    pub total_known: Option<usize>,
    pub percentage: Option<f64>,
}

impl Progress {
    fn new(processed: u64, total_known: Option<usize>) -> Self {
        let percentage = total_known
            .filter(|&total| total > 0)
            .map(|total| (processed as f64 / total as f64 * 100.0).min(100.0));
        Self {
            processed,
            total_known,
            percentage,
        }
    }
}

/// Per-stage counters in a run report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub index: usize,
    pub name: String,
    pub processed: u64,
    pub failed: u64,
    pub retries: u64,
    pub latency_p99_ms: f64,
}

/// Collaborators shared by every run of a pipeline
#[derive(Clone)]
pub(crate) struct Hooks {
    pub logger: Arc<dyn Logger>,
    pub monitor: Option<Arc<dyn PerformanceMonitor>>,
    pub on_error: Option<ErrorHook>,
    pub on_progress: Option<ProgressHook>,
    pub controller: Option<BackpressureController>,
}

/// State of one run, shared by all of its stages
pub(crate) struct RunContext {
    pipeline_id: String,
    hooks: Hooks,
    metrics: RunMetrics,
    stages: Vec<(usize, &'static str, StageMetrics)>,
    total_known: Option<usize>,
    failures: Mutex<Vec<StageFailure>>,
    warnings: Vec<String>,
    state: Mutex<RunState>,
    last_output: Mutex<Instant>,
    monitor_open: AtomicBool,
    aborted: AtomicBool,
}

impl RunContext {
    pub fn new<T: Send + 'static>(
        pipeline_id: String,
        hooks: Hooks,
        steps: &[Step<T>],
        total_known: Option<usize>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            pipeline_id,
            hooks,
            metrics: RunMetrics::new(),
            stages: steps
                .iter()
                .map(|s| (s.index, s.name, StageMetrics::new()))
                .collect(),
            total_known,
            failures: Mutex::new(Vec::new()),
            warnings,
            state: Mutex::new(RunState::Built),
            last_output: Mutex::new(Instant::now()),
            monitor_open: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        *self.state.lock() = RunState::Executing;
        *self.last_output.lock() = Instant::now();
        if let Some(monitor) = &self.hooks.monitor {
            monitor.record_operation_start(&self.pipeline_id);
            self.monitor_open.store(true, Ordering::Release);
        }
        for warning in &self.warnings {
            warn!(pipeline = %self.pipeline_id, "{warning}");
        }
        debug!(pipeline = %self.pipeline_id, stages = self.stages.len(), "pipeline run started");
    }

    /// Move out of `Executing`; later calls are no-ops
    pub fn finish(&self, outcome: RunState) {
        {
            let mut state = self.state.lock();
            if *state != RunState::Executing {
                return;
            }
            *state = outcome;
        }
        self.close_monitor();
        let metrics = self.metrics.snapshot();
        info!(
            pipeline = %self.pipeline_id,
            state = ?outcome,
            items = self.metrics.emitted(),
            errors = self.failures.lock().len(),
            elapsed_ms = self.metrics.elapsed().as_millis() as u64,
            "pipeline run finished: {}",
            metrics.format()
        );
    }

    pub fn close_monitor(&self) {
        if self.monitor_open.swap(false, Ordering::AcqRel) {
            if let Some(monitor) = &self.hooks.monitor {
                monitor.record_operation_end(&self.pipeline_id);
            }
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn logger(&self) -> &dyn Logger {
        self.hooks.logger.as_ref()
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Claim the run's single abort. False if another item got there first.
    fn claim_abort(&self) -> bool {
        !self.aborted.swap(true, Ordering::AcqRel)
    }

    fn stage_metrics(&self, index: usize) -> StageMetrics {
        self.stages
            .iter()
            .find(|(i, _, _)| *i == index)
            .map(|(_, _, m)| m.clone())
            .unwrap_or_default()
    }

    /// An item reached the end of the pipeline
    pub fn record_output(&self) {
        let since_last = {
            let mut last = self.last_output.lock();
            let now = Instant::now();
            let since = now.duration_since(*last);
            *last = now;
            since
        };
        self.metrics.record_emitted(since_last);
        if let Some(hook) = &self.hooks.on_progress {
            hook(&Progress::new(self.metrics.emitted(), self.total_known));
        }
    }

    async fn record_failure(&self, failure: &StageFailure, recovered: bool) {
        self.metrics.record_failed_item();
        if let Some(hook) = &self.hooks.on_error {
            hook(failure);
        }
        let data = serde_json::to_value(failure).ok();
        if recovered {
            self.logger()
                .warn("stage failure handled by catch", data.as_ref())
                .await;
        } else {
            self.logger()
                .error("stage failure aborted the pipeline", data.as_ref())
                .await;
        }
        self.failures.lock().push(failure.clone());
    }

    pub async fn log_start(&self) {
        let data = json!({ "pipeline": self.pipeline_id, "stages": self.stages.len() });
        self.logger().info("pipeline started", Some(&data)).await;
    }

    pub async fn log_finish(&self) {
        let report = self.report();
        let data = json!({
            "pipeline": self.pipeline_id,
            "itemsProcessed": report.items_processed,
            "executionTimeMs": report.execution_time_ms,
            "errors": report.errors.len(),
        });
        if report.success {
            self.logger().info("pipeline completed", Some(&data)).await;
        } else {
            self.logger().error("pipeline failed", Some(&data)).await;
        }
    }

    pub fn report(&self) -> PipelineResult {
        PipelineResult {
            success: self.state() == RunState::Completed,
            items_processed: self.metrics.emitted(),
            execution_time_ms: self.metrics.elapsed().as_millis() as u64,
            errors: self.failures.lock().clone(),
            warnings: self.warnings.clone(),
            metrics: self.metrics.snapshot(),
            stages: self
                .stages
                .iter()
                .map(|(index, name, m)| StageReport {
                    index: *index,
                    name: name.to_string(),
                    processed: m.total_processed(),
                    failed: m.total_failed(),
                    retries: m.total_retries(),
                    latency_p99_ms: m.latency().percentile_ms(0.99),
                })
                .collect(),
        }
    }
}

/// Result of pushing one item through a policy-wrapped step
enum Outcome<T> {
    Emit(T),
    Skip,
    Abort(PipelineError),
}

impl<T> Outcome<T> {
    fn into_item(self) -> Option<Result<T>> {
        match self {
            Outcome::Emit(item) => Some(Ok(item)),
            Outcome::Skip => None,
            Outcome::Abort(err) => Some(Err(err)),
        }
    }
}

/// Chain every step onto the source stream
pub(crate) fn assemble<T>(source: ItemStream<T>, steps: Vec<Step<T>>, ctx: &Arc<RunContext>) -> ItemStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    steps.into_iter().fold(source, |input, step| {
        let step = Arc::new(step);
        match &step.op {
            Op::Batch { size, assemble } => {
                batch(input, *size, Arc::clone(assemble), &step, ctx)
            }
            Op::Parallel { concurrency, .. } => parallel(input, *concurrency, step.clone(), ctx),
            Op::Distribute {
                lanes, partition, ..
            } => distribute(input, *lanes, Arc::clone(partition), step.clone(), ctx),
            Op::Chunked(processor) => chunked(input, Arc::clone(processor), &step, ctx),
            Op::Transform(_) | Op::AsyncTransform(_) | Op::Filter(_) | Op::Sink(_) => {
                sequential(input, step.clone(), ctx)
            }
        }
    })
}

/// One attempt of the step's function on one item. `Ok(None)` means the item
/// is not passed on (filtered out or consumed by a sink).
fn attempt<T>(step: &Step<T>, item: T) -> BoxFuture<'static, std::result::Result<Option<T>, StageError>>
where
    T: Send + Sync + 'static,
{
    let offload_sync = step.policy.timeout.is_some();
    match &step.op {
        Op::Transform(f) => {
            let f = Arc::clone(f);
            if offload_sync {
                // Runs off the async threads so the timeout can fire
                async move {
                    tokio::task::spawn_blocking(move || f(item))
                        .await
                        .map_err(|e| StageError::msg(format!("stage function panicked: {e}")))?
                        .map(Some)
                }
                .boxed()
            } else {
                future::ready(f(item).map(Some)).boxed()
            }
        }
        Op::Filter(predicate) => {
            let predicate = Arc::clone(predicate);
            if offload_sync {
                async move {
                    tokio::task::spawn_blocking(move || {
                        predicate(&item).map(|keep| keep.then_some(item))
                    })
                    .await
                    .map_err(|e| StageError::msg(format!("stage function panicked: {e}")))?
                }
                .boxed()
            } else {
                future::ready(predicate(&item).map(|keep| keep.then_some(item))).boxed()
            }
        }
        Op::AsyncTransform(work) | Op::Parallel { work, .. } | Op::Distribute { work, .. } => {
            work(item).map(|r| r.map(Some)).boxed()
        }
        Op::Sink(consume) => consume(item).map(|r| r.map(|()| None)).boxed(),
        Op::Batch { .. } | Op::Chunked(_) => future::ready(Ok(Some(item))).boxed(),
    }
}

/// Apply the step to one item under its retry, timeout and catch policy
async fn run_item<T>(step: Arc<Step<T>>, ctx: Arc<RunContext>, item: T) -> Outcome<T>
where
    T: Clone + Send + Sync + 'static,
{
    let metrics = ctx.stage_metrics(step.index);
    let policy = &step.policy;
    let is_sink = matches!(step.op, Op::Sink(_));
    let mut attempts = 0u32;
    if ctx.is_aborted() {
        return Outcome::Skip;
    }

    let error = loop {
        attempts += 1;
        let started = Instant::now();
        let call = attempt(&step, item.clone());
        let result = match policy.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(StageError::Timeout(limit))),
            None => call.await,
        };
        match result {
            Ok(output) => {
                metrics.record_processed(started.elapsed());
                if is_sink {
                    ctx.record_output();
                }
                return match output {
                    Some(next) => Outcome::Emit(next),
                    None => Outcome::Skip,
                };
            }
            Err(err) if attempts <= policy.retries => {
                metrics.record_retry();
                let data = json!({
                    "stage": step.name,
                    "stageIndex": step.index,
                    "attempt": attempts,
                    "error": err.to_string(),
                });
                ctx.logger().debug("retrying stage", Some(&data)).await;
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => break err,
        }
    };

    metrics.record_failed();
    // Items still in flight when the run aborted are not reported
    if ctx.is_aborted() {
        return Outcome::Skip;
    }
    let failure = StageFailure::new(step.index, step.name, &error, attempts);
    match &policy.catch {
        Some(handler) => {
            ctx.record_failure(&failure, true).await;
            match handler(&error, item) {
                Some(replacement) if !is_sink => Outcome::Emit(replacement),
                _ => Outcome::Skip,
            }
        }
        None if ctx.claim_abort() => {
            ctx.record_failure(&failure, false).await;
            Outcome::Abort(failure.to_abort())
        }
        None => Outcome::Skip,
    }
}

fn sequential<T>(input: ItemStream<T>, step: Arc<Step<T>>, ctx: &Arc<RunContext>) -> ItemStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    let ctx = Arc::clone(ctx);
    input
        .then(move |next| {
            let step = Arc::clone(&step);
            let ctx = Arc::clone(&ctx);
            async move {
                match next {
                    Ok(item) => run_item(step, ctx, item).await.into_item(),
                    Err(err) => Some(Err(err)),
                }
            }
        })
        .filter_map(future::ready)
        .boxed()
}

/// End the stream right after its first error, so windowing stages do not
/// pull upstream work past an abort
fn until_abort<T>(input: ItemStream<T>) -> ItemStream<T>
where
    T: Send + 'static,
{
    input
        .scan(false, |aborted, next| {
            if *aborted {
                return future::ready(None);
            }
            *aborted = next.is_err();
            future::ready(Some(next))
        })
        .boxed()
}

/// Input of a buffering stage: cut at the first error, and wait out a paused
/// controller before handing on the next item
fn gate<T>(input: ItemStream<T>, ctx: &Arc<RunContext>) -> ItemStream<T>
where
    T: Send + 'static,
{
    let input = until_abort(input);
    let Some(controller) = ctx.hooks.controller.clone() else {
        return input;
    };
    let ctx = Arc::clone(ctx);
    input
        .then(move |next| {
            let controller = controller.clone();
            let ctx = Arc::clone(&ctx);
            async move {
                if controller.is_paused() {
                    ctx.metrics.record_backpressure();
                    if !controller.drain().await {
                        debug!(pipeline = %ctx.pipeline_id, "backpressure pause expired");
                    }
                }
                next
            }
        })
        .boxed()
}

/// Split a window at its first error
fn split_window<T>(window: Vec<Result<T>>) -> (Vec<T>, Option<PipelineError>) {
    let mut items = Vec::with_capacity(window.len());
    for next in window {
        match next {
            Ok(item) => items.push(item),
            Err(err) => return (items, Some(err)),
        }
    }
    (items, None)
}

fn batch<T>(
    input: ItemStream<T>,
    size: usize,
    assemble: AssembleFn<T>,
    step: &Step<T>,
    ctx: &Arc<RunContext>,
) -> ItemStream<T>
where
    T: Send + 'static,
{
    let metrics = ctx.stage_metrics(step.index);
    gate(input, ctx)
        .chunks(size)
        .flat_map(move |window| {
            let started = Instant::now();
            let (items, failure) = split_window(window);
            let mut out = Vec::with_capacity(2);
            if !items.is_empty() {
                out.push(Ok(assemble(items)));
                metrics.record_processed(started.elapsed());
            }
            out.extend(failure.map(Err));
            stream::iter(out)
        })
        .boxed()
}

fn parallel<T>(
    input: ItemStream<T>,
    concurrency: usize,
    step: Arc<Step<T>>,
    ctx: &Arc<RunContext>,
) -> ItemStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    let run_ctx = Arc::clone(ctx);
    gate(input, ctx)
        .map(move |next| {
            let step = Arc::clone(&step);
            let ctx = Arc::clone(&run_ctx);
            async move {
                match next {
                    Ok(item) => run_item(step, ctx, item).await,
                    Err(err) => Outcome::Abort(err),
                }
            }
        })
        .buffered(concurrency)
        .filter_map(|outcome| future::ready(outcome.into_item()))
        .boxed()
}

/// Windows of `lanes` items run concurrently across lanes; items sharing a
/// lane run in arrival order. Output keeps input order.
fn distribute<T>(
    input: ItemStream<T>,
    lanes: usize,
    partition: PartitionFn<T>,
    step: Arc<Step<T>>,
    ctx: &Arc<RunContext>,
) -> ItemStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    let run_ctx = Arc::clone(ctx);
    gate(input, ctx)
        .chunks(lanes)
        .then(move |window| {
            let step = Arc::clone(&step);
            let ctx = Arc::clone(&run_ctx);
            let partition = Arc::clone(&partition);
            async move {
                let mut slots: Vec<Option<Outcome<T>>> = Vec::with_capacity(window.len());
                let mut queues: Vec<Vec<(usize, T)>> = (0..lanes).map(|_| Vec::new()).collect();
                for (pos, next) in window.into_iter().enumerate() {
                    match next {
                        Ok(item) => {
                            queues[partition(&item) % lanes].push((pos, item));
                            slots.push(None);
                        }
                        Err(err) => slots.push(Some(Outcome::Abort(err))),
                    }
                }

                let lane_runs = queues.into_iter().filter(|q| !q.is_empty()).map(|queue| {
                    let step = Arc::clone(&step);
                    let ctx = Arc::clone(&ctx);
                    async move {
                        let mut done = Vec::with_capacity(queue.len());
                        for (pos, item) in queue {
                            done.push((pos, run_item(Arc::clone(&step), Arc::clone(&ctx), item).await));
                        }
                        done
                    }
                });
                for (pos, outcome) in future::join_all(lane_runs).await.into_iter().flatten() {
                    slots[pos] = Some(outcome);
                }

                stream::iter(slots.into_iter().flatten().filter_map(Outcome::into_item))
            }
        })
        .flatten()
        .boxed()
}

fn chunked<T>(
    input: ItemStream<T>,
    processor: Arc<dyn ChunkStage<T>>,
    step: &Step<T>,
    ctx: &Arc<RunContext>,
) -> ItemStream<T>
where
    T: Send + 'static,
{
    let size = processor.chunk_size();
    let metrics = ctx.stage_metrics(step.index);
    let (index, name) = (step.index, step.name);
    let run_ctx = Arc::clone(ctx);
    let tail = Arc::clone(&processor);

    let body = gate(input, ctx)
        .chunks(size)
        .enumerate()
        .then(move |(chunk_index, window)| {
            let processor = Arc::clone(&processor);
            let ctx = Arc::clone(&run_ctx);
            let metrics = metrics.clone();
            async move {
                let (items, failure) = split_window(window);
                let mut out = Vec::new();
                if !items.is_empty() {
                    let mut context = ProcessingContext::new(chunk_index);
                    match processor.process(items, &mut context).await {
                        Ok(ready) => {
                            metrics.record_processed(context.processing_time);
                            out.extend(ready.into_iter().map(Ok));
                        }
                        Err(err) if ctx.claim_abort() => {
                            metrics.record_failed();
                            let failure = StageFailure::new(
                                index,
                                name,
                                &StageError::msg(&err),
                                1,
                            );
                            ctx.record_failure(&failure, false).await;
                            out.push(Err(failure.to_abort()));
                        }
                        Err(_) => metrics.record_failed(),
                    }
                }
                out.extend(failure.map(Err));
                stream::iter(out)
            }
        })
        .flatten();

    let flushed = stream::once(async move { stream::iter(tail.flush().into_iter().map(Ok)) })
        .flatten();

    body.chain(flushed).boxed()
}
