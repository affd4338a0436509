use crate::error::StageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// What a worker should do with a task payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Transform,
    Process,
    Factorize,
    Custom,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Transform => "transform",
            TaskKind::Process => "process",
            TaskKind::Factorize => "factorize",
            TaskKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// A unit of work for the pool. Immutable once submitted.
///
/// Serializes to the worker message shape
/// `{ id, kind, data, functionCode? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub id: String,
    pub kind: TaskKind,
    #[serde(rename = "data")]
    pub payload: Value,
    /// Name of a registered handler function, overriding the kind's default
    #[serde(
        rename = "functionCode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub function: Option<String>,
}

impl WorkerTask {
    /// New task with a time-ordered unique id
    pub fn new(kind: TaskKind, payload: Value) -> Self {
        Self::with_id(Uuid::now_v7().to_string(), kind, payload)
    }

    pub fn with_id(id: impl Into<String>, kind: TaskKind, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            payload,
            function: None,
        }
    }

    /// Task dispatched to a named handler function
    pub fn custom(function: impl Into<String>, payload: Value) -> Self {
        Self::new(TaskKind::Custom, payload).with_function(function)
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }
}

/// Outcome of one task. Correlates 1:1 with a [`WorkerTask`] by `id`.
///
/// Serializes to `{ id, success, result?, error?, executionTimeMs }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub id: String,
    #[serde(rename = "success")]
    pub ok: bool,
    #[serde(rename = "result", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub execution_time_ms: f64,
}

impl WorkerResult {
    pub fn success(id: impl Into<String>, value: Value, elapsed: Duration) -> Self {
        Self {
            id: id.into(),
            ok: true,
            value: Some(value),
            error_message: None,
            execution_time_ms: elapsed.as_nanos() as f64 / 1_000_000.0,
        }
    }

    pub fn failure(id: impl Into<String>, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            id: id.into(),
            ok: false,
            value: None,
            error_message: Some(message.into()),
            execution_time_ms: elapsed.as_nanos() as f64 / 1_000_000.0,
        }
    }

    /// The produced value, or the handler's failure as a stage error
    pub fn into_value(self) -> Result<Value, StageError> {
        if self.ok {
            Ok(self.value.unwrap_or(Value::Null))
        } else {
            Err(StageError::Failed(self.error_message.unwrap_or_else(|| {
                format!("task {} failed", self.id)
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_wire_shape() {
        let task = WorkerTask::with_id("t-1", TaskKind::Custom, json!([1, 2])).with_function("sum");
        let wire = serde_json::to_value(&task).unwrap();
        assert_eq!(
            wire,
            json!({"id": "t-1", "kind": "custom", "data": [1, 2], "functionCode": "sum"})
        );
        let back: WorkerTask = serde_json::from_value(wire).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_result_wire_shape() {
        let result = WorkerResult::failure("t-2", "boom", Duration::from_millis(2));
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["success"], json!(false));
        assert_eq!(wire["error"], json!("boom"));
        assert!(wire.get("result").is_none());
        assert_eq!(wire["executionTimeMs"], json!(2.0));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = WorkerTask::new(TaskKind::Process, Value::Null);
        let b = WorkerTask::new(TaskKind::Process, Value::Null);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_into_value() {
        let ok = WorkerResult::success("a", json!(3), Duration::ZERO);
        assert_eq!(ok.into_value().unwrap(), json!(3));
        let failed = WorkerResult::failure("b", "nope", Duration::ZERO);
        assert_eq!(failed.into_value().unwrap_err(), StageError::msg("nope"));
    }
}
