use std::time::Duration;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type for worker pool operations
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors raised by a user-supplied stage function
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    /// The function reported a failure
    #[error("{0}")]
    Failed(String),

    /// The function did not finish within its stage timeout
    #[error("Stage timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl StageError {
    /// Build a failure from any displayable message
    pub fn msg(message: impl std::fmt::Display) -> Self {
        StageError::Failed(message.to_string())
    }

    /// Whether this error came from a stage timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, StageError::Timeout(_))
    }
}

impl From<String> for StageError {
    fn from(message: String) -> Self {
        StageError::Failed(message)
    }
}

impl From<&str> for StageError {
    fn from(message: &str) -> Self {
        StageError::Failed(message.to_string())
    }
}

impl From<PoolError> for StageError {
    fn from(err: PoolError) -> Self {
        StageError::Failed(err.to_string())
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        StageError::Failed(format!("payload conversion failed: {err}"))
    }
}

/// Errors that can occur during pipeline execution
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage failed after exhausting retries with no catch handler
    #[error("Pipeline aborted at stage {stage_index} ({stage_name}): {message}")]
    Abort {
        stage_name: String,
        stage_index: usize,
        message: String,
    },

    /// No source stage was declared
    #[error("Cannot execute pipeline without a source")]
    NoSource,

    /// The source sequence was already consumed by an earlier run
    #[error("Pipeline source has already been consumed")]
    SourceConsumed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker pool error surfaced outside a stage
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
}

impl PipelineError {
    /// Stage attribution for abort errors
    pub fn stage(&self) -> Option<(usize, &str)> {
        match self {
            PipelineError::Abort {
                stage_index,
                stage_name,
                ..
            } => Some((*stage_index, stage_name.as_str())),
            _ => None,
        }
    }
}

/// Errors reported by the worker pool to the caller awaiting a task
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    /// Admission rejected because the pending queue reached its high-water mark
    #[error("Worker pool queue full ({queued} pending, high-water mark {high_water_mark})")]
    QueueFull {
        queued: usize,
        high_water_mark: usize,
    },

    /// The worker running the task died before posting a result
    #[error("Worker {worker_id} crashed while running task {task_id}: {reason}")]
    WorkerCrash {
        worker_id: usize,
        task_id: String,
        reason: String,
    },

    /// The worker did not respond within the task timeout
    #[error("Task {task_id} timed out after {}ms", .timeout.as_millis())]
    TaskTimeout { task_id: String, timeout: Duration },

    /// The pool is shutting down and no longer accepts or runs tasks
    #[error("Worker pool is shutting down")]
    ShuttingDown,

    /// An OS thread for a worker could not be created
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),

    /// The pool configuration failed validation
    #[error("Invalid worker pool configuration: {0}")]
    Config(String),

    /// The pool was constructed outside a tokio runtime
    #[error("Worker pool requires a running tokio runtime")]
    NoRuntime,
}

/// Errors raised by the chunk processor
#[derive(Error, Debug)]
pub enum ChunkError {
    /// The running failure rate exceeded the configured tolerance
    #[error(
        "Chunk error rate {failed}/{total} exceeds tolerance {tolerance}: {source}"
    )]
    ToleranceExceeded {
        failed: u64,
        total: u64,
        tolerance: f64,
        source: StageError,
    },
}

/// Configuration errors, raised at construction time
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A numeric field is outside its allowed range
    #[error("{field} is out of range: {value}")]
    OutOfRange { field: &'static str, value: String },

    /// A combination of fields is inconsistent
    #[error("{0}")]
    Invalid(String),

    /// TOML parsing failed
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config file could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
}
