//! An async stream processing engine with a CPU worker pool.
//!
//! This crate provides declarative, pull-based pipelines over async streams,
//! with per-stage retry, timeout and error recovery, plus a bounded pool of
//! OS-thread workers for CPU-heavy work.
//!
//! # Features
//!
//! - Chainable stages: transform, filter, batch, parallel, distribute, chunked
//! - Per-stage failure policy via `retry`, `timeout` and `catch`
//! - Worker pool with admission control, crash recovery, task timeouts and
//!   idle eviction
//! - Chunk processing with memory accounting and error tolerance
//! - Watermark-based backpressure with bounded pauses
//! - Run metrics: throughput, latency percentiles, error rate
//!
//! # Example
//!
//! ```ignore
//! use stream_engine::StreamPipeline;
//!
//! let evens = StreamPipeline::new()
//!     .source(1..=5)
//!     .filter(|x| x % 2 == 0)
//!     .map(|x| x * 10)
//!     .collect()
//!     .await?;
//! assert_eq!(evens, vec![20, 40]);
//! ```

pub mod backpressure;
pub mod chunk;
pub mod config;
pub mod error;
mod executor;
pub mod factorize;
pub mod logging;
pub mod metrics;
pub mod offload;
pub mod pipeline;
pub mod pool;
pub mod stage;

// Re-exports for convenience
pub use backpressure::BackpressureController;
pub use chunk::{ChunkProcessor, ChunkStage, ChunkStats, MemoryFootprint, ProcessingContext};
pub use config::{ChunkProcessingConfig, EngineConfig, PipelineConfig, WorkerPoolConfig};
pub use error::{ChunkError, ConfigError, PipelineError, PoolError, Result, StageError};
pub use factorize::{AdaptiveFactorizer, Factor, Factorizer, TrialDivision};
pub use logging::{init_tracing, Logger, NullLogger, PerformanceMonitor, SystemMetrics, TracingLogger};
pub use metrics::{PipelineMetrics, StageMetrics};
pub use offload::Offload;
pub use pipeline::{
    PipelineResult, PipelineStream, Progress, RunState, StageFailure, StageReport, StreamPipeline,
};
pub use pool::{HandlerRegistry, PoolStats, TaskHandle, TaskKind, WorkerPool, WorkerResult, WorkerTask};
pub use stage::Stage;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
