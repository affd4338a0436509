//! Engine configuration
//!
//! Every component takes a plain config struct with documented defaults.
//! Configs deserialize from TOML with missing fields falling back to the
//! defaults, and are validated when the owning component is constructed, so a
//! bad fraction or an empty pool is reported before any data flows.
//!
//! ```toml
//! [pipeline]
//! id = "ingest"
//! retry_attempts = 2
//!
//! [chunk]
//! chunk_size = 512
//! backpressure_threshold = 0.75
//!
//! [pool]
//! min_workers = 2
//! max_workers = 8
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Defaults applied to pipeline stages that do not declare their own policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Identifier used in logs and results
    pub id: String,
    /// Default concurrency for `parallel`/`distribute` stages
    pub max_concurrency: usize,
    /// Default re-attempts for stages without an explicit `retry`
    pub retry_attempts: u32,
    /// Default delay between retry attempts
    pub retry_delay_ms: u64,
    /// Default per-item timeout for stages without an explicit `timeout`
    pub timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            id: "pipeline".to_string(),
            max_concurrency: 4,
            retry_attempts: 0,
            retry_delay_ms: 1000,
            timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_concurrency",
                value: "0".into(),
            });
        }
        if self.timeout_ms == Some(0) {
            return Err(ConfigError::OutOfRange {
                field: "timeout_ms",
                value: "0".into(),
            });
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Chunk-level buffering, backpressure and error tolerance settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkProcessingConfig {
    /// Items per emitted chunk
    pub chunk_size: usize,
    /// Buffer budget in estimated bytes
    pub max_buffer_size: usize,
    /// Whether the processor consults its backpressure controller
    pub enable_backpressure: bool,
    /// Fraction of `max_buffer_size` at which backpressure applies
    pub backpressure_threshold: f64,
    /// Fraction of failed chunks tolerated before errors propagate
    pub error_tolerance: f64,
    /// Re-attempts after a chunk's first failure before it counts as failed
    pub retry_attempts: u32,
    /// Delay between chunk attempts
    pub retry_delay_ms: u64,
}

impl Default for ChunkProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            max_buffer_size: 8192,
            enable_backpressure: true,
            backpressure_threshold: 0.8,
            error_tolerance: 0.05,
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl ChunkProcessingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_fraction("backpressure_threshold", self.backpressure_threshold)?;
        check_fraction("error_tolerance", self.error_tolerance)?;
        if self.chunk_size == 0 {
            return Err(ConfigError::OutOfRange {
                field: "chunk_size",
                value: "0".into(),
            });
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_buffer_size",
                value: "0".into(),
            });
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Estimated byte level at which backpressure applies
    pub fn backpressure_limit(&self) -> usize {
        (self.max_buffer_size as f64 * self.backpressure_threshold) as usize
    }
}

/// Worker pool sizing, timeouts and admission control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Workers spawned at construction and kept alive through idle periods
    pub min_workers: usize,
    /// Upper bound on concurrently live workers
    pub max_workers: usize,
    /// Idle time after which workers above `min_workers` are evicted
    pub idle_timeout_ms: u64,
    /// Per-task deadline; the worker is abandoned and replaced when exceeded
    pub task_timeout_ms: Option<u64>,
    /// Pending tasks at which new submissions are rejected
    pub queue_high_water_mark: usize,
    /// Period of the idle-eviction sweep
    pub scavenge_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            min_workers: 1,
            max_workers: cores,
            idle_timeout_ms: 30_000,
            task_timeout_ms: Some(30_000),
            queue_high_water_mark: 1024,
            scavenge_interval_ms: 10_000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_workers",
                value: "0".into(),
            });
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::Invalid(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.queue_high_water_mark == 0 {
            return Err(ConfigError::OutOfRange {
                field: "queue_high_water_mark",
                value: "0".into(),
            });
        }
        if self.task_timeout_ms == Some(0) {
            return Err(ConfigError::OutOfRange {
                field: "task_timeout_ms",
                value: "0".into(),
            });
        }
        if self.scavenge_interval_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "scavenge_interval_ms",
                value: "0".into(),
            });
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn scavenge_interval(&self) -> Duration {
        Duration::from_millis(self.scavenge_interval_ms)
    }
}

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pipeline: PipelineConfig,
    pub chunk: ChunkProcessingConfig,
    pub pool: WorkerPoolConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;
        self.chunk.validate()?;
        self.pool.validate()
    }
}

fn check_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
        })
    }
}
