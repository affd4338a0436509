//! Stage declarations and execution plans
//!
//! A pipeline is declared as an ordered list of [`Stage`]s. Before a run the
//! list is compiled into a [`Plan`]: the source is split off, and the policy
//! decorators (`retry`, `timeout`, `catch`) are folded into the closest
//! preceding executable stage. Stages without an explicit policy inherit the
//! pipeline defaults from [`PipelineConfig`].

use crate::chunk::ChunkStage;
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError, StageError};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Synchronous one-to-one transformation
pub type TransformFn<T> = Arc<dyn Fn(T) -> Result<T, StageError> + Send + Sync>;

/// Asynchronous one-to-one transformation
pub type AsyncTransformFn<T> =
    Arc<dyn Fn(T) -> BoxFuture<'static, Result<T, StageError>> + Send + Sync>;

/// Keep-or-drop decision; an error counts as a stage failure
pub type Predicate<T> = Arc<dyn Fn(&T) -> Result<bool, StageError> + Send + Sync>;

/// Recovery for an item whose stage failed; `None` skips the item
pub type CatchFn<T> = Arc<dyn Fn(&StageError, T) -> Option<T> + Send + Sync>;

/// Lane selector for `distribute`
pub type PartitionFn<T> = Arc<dyn Fn(&T) -> usize + Send + Sync>;

/// Builds one item out of a full (or final partial) batch
pub type AssembleFn<T> = Arc<dyn Fn(Vec<T>) -> T + Send + Sync>;

/// Terminal consumer
pub type SinkFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), StageError>> + Send + Sync>;

/// Source sequence shared by every view of a pipeline; taken by the first run
pub type SharedSource<T> = Arc<Mutex<Option<SourceSeq<T>>>>;

pub struct SourceSeq<T> {
    pub(crate) items: BoxStream<'static, T>,
    pub(crate) total_known: Option<usize>,
}

/// One declared pipeline stage
pub enum Stage<T: Send + 'static> {
    Source(SharedSource<T>),
    Transform(TransformFn<T>),
    AsyncTransform(AsyncTransformFn<T>),
    Filter(Predicate<T>),
    Batch { size: usize, assemble: AssembleFn<T> },
    Parallel { concurrency: usize, work: AsyncTransformFn<T> },
    Distribute {
        lanes: usize,
        partition: PartitionFn<T>,
        work: AsyncTransformFn<T>,
    },
    Chunked(Arc<dyn ChunkStage<T>>),
    Catch(CatchFn<T>),
    Retry { attempts: u32, delay: Duration },
    Timeout(Duration),
    Sink(SinkFn<T>),
}

impl<T: Send + 'static> Clone for Stage<T> {
    fn clone(&self) -> Self {
        match self {
            Stage::Source(s) => Stage::Source(Arc::clone(s)),
            Stage::Transform(f) => Stage::Transform(Arc::clone(f)),
            Stage::AsyncTransform(f) => Stage::AsyncTransform(Arc::clone(f)),
            Stage::Filter(p) => Stage::Filter(Arc::clone(p)),
            Stage::Batch { size, assemble } => Stage::Batch {
                size: *size,
                assemble: Arc::clone(assemble),
            },
            Stage::Parallel { concurrency, work } => Stage::Parallel {
                concurrency: *concurrency,
                work: Arc::clone(work),
            },
            Stage::Distribute {
                lanes,
                partition,
                work,
            } => Stage::Distribute {
                lanes: *lanes,
                partition: Arc::clone(partition),
                work: Arc::clone(work),
            },
            Stage::Chunked(p) => Stage::Chunked(Arc::clone(p)),
            Stage::Catch(h) => Stage::Catch(Arc::clone(h)),
            Stage::Retry { attempts, delay } => Stage::Retry {
                attempts: *attempts,
                delay: *delay,
            },
            Stage::Timeout(d) => Stage::Timeout(*d),
            Stage::Sink(f) => Stage::Sink(Arc::clone(f)),
        }
    }
}

impl<T: Send + 'static> Stage<T> {
    /// Stage name used in errors, logs and reports
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Source(_) => "source",
            Stage::Transform(_) => "transform",
            Stage::AsyncTransform(_) => "asyncTransform",
            Stage::Filter(_) => "filter",
            Stage::Batch { .. } => "batch",
            Stage::Parallel { .. } => "parallel",
            Stage::Distribute { .. } => "distribute",
            Stage::Chunked(_) => "chunked",
            Stage::Catch(_) => "catch",
            Stage::Retry { .. } => "retry",
            Stage::Timeout(_) => "timeout",
            Stage::Sink(_) => "sink",
        }
    }

    /// Whether `retry`, `timeout` and `catch` can attach to this stage
    pub fn accepts_policy(&self) -> bool {
        matches!(
            self,
            Stage::Transform(_)
                | Stage::AsyncTransform(_)
                | Stage::Filter(_)
                | Stage::Parallel { .. }
                | Stage::Distribute { .. }
                | Stage::Sink(_)
        )
    }

    fn is_decorator(&self) -> bool {
        matches!(self, Stage::Catch(_) | Stage::Retry { .. } | Stage::Timeout(_))
    }
}

impl<T: Send + 'static> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Batch { size, .. } => write!(f, "batch({size})"),
            Stage::Parallel { concurrency, .. } => write!(f, "parallel({concurrency})"),
            Stage::Distribute { lanes, .. } => write!(f, "distribute({lanes})"),
            Stage::Retry { attempts, delay } => {
                write!(f, "retry({attempts}, {}ms)", delay.as_millis())
            }
            Stage::Timeout(d) => write!(f, "timeout({}ms)", d.as_millis()),
            other => f.write_str(other.name()),
        }
    }
}

/// Failure handling applied to every item passing through a step
pub(crate) struct Policy<T> {
    /// Re-attempts after the first failure
    pub retries: u32,
    pub delay: Duration,
    pub timeout: Option<Duration>,
    pub catch: Option<CatchFn<T>>,
}

impl<T> Policy<T> {
    fn from_config(config: &PipelineConfig) -> Self {
        Self {
            retries: config.retry_attempts,
            delay: config.retry_delay(),
            timeout: config.timeout(),
            catch: None,
        }
    }
}

/// Work performed by a compiled step
pub(crate) enum Op<T: Send + 'static> {
    Transform(TransformFn<T>),
    AsyncTransform(AsyncTransformFn<T>),
    Filter(Predicate<T>),
    Batch { size: usize, assemble: AssembleFn<T> },
    Parallel { concurrency: usize, work: AsyncTransformFn<T> },
    Distribute {
        lanes: usize,
        partition: PartitionFn<T>,
        work: AsyncTransformFn<T>,
    },
    Chunked(Arc<dyn ChunkStage<T>>),
    Sink(SinkFn<T>),
}

pub(crate) struct Step<T: Send + 'static> {
    /// Position of the stage in the declared list
    pub index: usize,
    pub name: &'static str,
    pub op: Op<T>,
    pub policy: Policy<T>,
}

pub(crate) struct Plan<T: Send + 'static> {
    pub source: SharedSource<T>,
    pub steps: Vec<Step<T>>,
    pub warnings: Vec<String>,
}

/// Fold the declared stage list into executable steps
pub(crate) fn compile<T: Send + 'static>(
    stages: &[Stage<T>],
    config: &PipelineConfig,
) -> Result<Plan<T>, PipelineError> {
    let mut source = None;
    let mut steps: Vec<Step<T>> = Vec::new();
    let mut warnings = Vec::new();
    // Whether the most recent non-decorator stage accepts decorators
    let mut attachable = false;

    for (index, stage) in stages.iter().enumerate() {
        if stage.is_decorator() {
            let target = steps.last_mut().filter(|_| attachable);
            let Some(target) = target else {
                warnings.push(format!(
                    "stage {index} ({}) has no preceding stage it can apply to and was ignored",
                    stage.name()
                ));
                continue;
            };
            match stage {
                Stage::Retry { attempts, delay } => {
                    target.policy.retries = *attempts;
                    target.policy.delay = *delay;
                }
                Stage::Timeout(limit) => target.policy.timeout = Some(*limit),
                Stage::Catch(handler) => target.policy.catch = Some(Arc::clone(handler)),
                _ => {}
            }
            continue;
        }

        attachable = stage.accepts_policy();
        let op = match stage {
            Stage::Source(shared) => {
                if source.is_some() {
                    return Err(ConfigError::Invalid(format!(
                        "stage {index} declares a second source"
                    ))
                    .into());
                }
                if !steps.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "source must precede processing stages (found at stage {index})"
                    ))
                    .into());
                }
                source = Some(Arc::clone(shared));
                continue;
            }
            Stage::Transform(f) => Op::Transform(Arc::clone(f)),
            Stage::AsyncTransform(f) => Op::AsyncTransform(Arc::clone(f)),
            Stage::Filter(p) => Op::Filter(Arc::clone(p)),
            Stage::Batch { size: 0, .. } => {
                return Err(ConfigError::OutOfRange {
                    field: "batch_size",
                    value: "0".into(),
                }
                .into());
            }
            Stage::Batch { size, assemble } => Op::Batch {
                size: *size,
                assemble: Arc::clone(assemble),
            },
            Stage::Parallel { concurrency, work } => Op::Parallel {
                concurrency: or_default(*concurrency, config),
                work: Arc::clone(work),
            },
            Stage::Distribute {
                lanes,
                partition,
                work,
            } => Op::Distribute {
                lanes: or_default(*lanes, config),
                partition: Arc::clone(partition),
                work: Arc::clone(work),
            },
            Stage::Chunked(p) => Op::Chunked(Arc::clone(p)),
            Stage::Sink(f) => Op::Sink(Arc::clone(f)),
            Stage::Catch(_) | Stage::Retry { .. } | Stage::Timeout(_) => continue,
        };
        if steps.last().is_some_and(|s| matches!(s.op, Op::Sink(_))) {
            return Err(ConfigError::Invalid(format!(
                "stage {index} ({}) follows a sink",
                stage.name()
            ))
            .into());
        }
        steps.push(Step {
            index,
            name: stage.name(),
            op,
            policy: Policy::from_config(config),
        });
    }

    let source = source.ok_or(PipelineError::NoSource)?;
    Ok(Plan {
        source,
        steps,
        warnings,
    })
}

/// Zero concurrency means the pipeline default
fn or_default(concurrency: usize, config: &PipelineConfig) -> usize {
    if concurrency == 0 {
        config.max_concurrency
    } else {
        concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn source() -> Stage<i32> {
        Stage::Source(Arc::new(Mutex::new(Some(SourceSeq {
            items: Box::pin(stream::iter(vec![1, 2, 3])),
            total_known: Some(3),
        }))))
    }

    fn double() -> Stage<i32> {
        Stage::Transform(Arc::new(|x: i32| Ok::<_, StageError>(x * 2)))
    }

    #[test]
    fn test_decorators_attach_to_preceding_stage() {
        let stages = vec![
            source(),
            double(),
            Stage::Retry {
                attempts: 3,
                delay: Duration::from_millis(5),
            },
            Stage::Timeout(Duration::from_millis(50)),
            Stage::Catch(Arc::new(|_: &StageError, _: i32| Some(0))),
            double(),
        ];
        let plan = compile(&stages, &PipelineConfig::default()).unwrap();
        assert_eq!(plan.steps.len(), 2);

        let first = &plan.steps[0];
        assert_eq!(first.index, 1);
        assert_eq!(first.policy.retries, 3);
        assert_eq!(first.policy.timeout, Some(Duration::from_millis(50)));
        assert!(first.policy.catch.is_some());

        let second = &plan.steps[1];
        assert_eq!(second.index, 5);
        assert_eq!(second.policy.retries, 0);
        assert!(second.policy.catch.is_none());
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_config_defaults_apply() {
        let config = PipelineConfig {
            retry_attempts: 2,
            timeout_ms: Some(100),
            ..Default::default()
        };
        let plan = compile(&[source(), double()], &config).unwrap();
        assert_eq!(plan.steps[0].policy.retries, 2);
        assert_eq!(
            plan.steps[0].policy.timeout,
            Some(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_decorator_after_batch_is_ignored() {
        let stages = vec![
            source(),
            Stage::Batch {
                size: 2,
                assemble: Arc::new(|v: Vec<i32>| v.iter().sum::<i32>()),
            },
            Stage::Retry {
                attempts: 1,
                delay: Duration::ZERO,
            },
        ];
        let plan = compile(&stages, &PipelineConfig::default()).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("retry"));
    }

    #[test]
    fn test_zero_sizes() {
        let work: AsyncTransformFn<i32> =
            Arc::new(|x: i32| -> BoxFuture<'static, Result<i32, StageError>> {
                Box::pin(async move { Ok(x) })
            });
        let stages = vec![
            source(),
            Stage::Parallel {
                concurrency: 0,
                work,
            },
        ];
        let plan = compile(&stages, &PipelineConfig::default()).unwrap();
        assert!(matches!(plan.steps[0].op, Op::Parallel { concurrency: 4, .. }));

        let stages = vec![
            source(),
            Stage::Batch {
                size: 0,
                assemble: Arc::new(|v: Vec<i32>| v.len() as i32),
            },
        ];
        assert!(matches!(
            compile(&stages, &PipelineConfig::default()),
            Err(PipelineError::Config(ConfigError::OutOfRange { field: "batch_size", .. }))
        ));
    }

    #[test]
    fn test_missing_source() {
        let result = compile(&[double()], &PipelineConfig::default());
        assert!(matches!(result, Err(PipelineError::NoSource)));
    }

    #[test]
    fn test_second_source_rejected() {
        let result = compile(&[source(), source()], &PipelineConfig::default());
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_stage_after_sink_rejected() {
        let stages = vec![
            source(),
            Stage::Sink(Arc::new(|_: i32| -> BoxFuture<'static, Result<(), StageError>> {
                Box::pin(async { Ok(()) })
            })),
            double(),
        ];
        let result = compile(&stages, &PipelineConfig::default());
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(double().name(), "transform");
        assert_eq!(
            format!("{:?}", Stage::<i32>::Timeout(Duration::from_millis(7))),
            "timeout(7ms)"
        );
    }
}
