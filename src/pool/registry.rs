use super::task::{TaskKind, WorkerTask};
use crate::factorize::{Factorizer, TrialDivision};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Function executed on a worker thread. A returned `Err` is a task failure;
/// a panic is a worker crash.
pub type TaskHandler = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Handlers available to workers, by task kind and by function name
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_kind: HashMap<TaskKind, TaskHandler>,
    functions: HashMap<String, TaskHandler>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// `transform` and `process` echo their payload; `factorize` runs trial
    /// division on an integer payload (number or decimal string)
    pub fn with_defaults() -> Self {
        Self::new()
            .register_kind(TaskKind::Transform, |payload| Ok(payload.clone()))
            .register_kind(TaskKind::Process, |payload| Ok(payload.clone()))
            .register_kind(TaskKind::Factorize, factorize_payload)
    }

    pub fn register_kind<F>(mut self, kind: TaskKind, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.by_kind.insert(kind, Arc::new(handler));
        self
    }

    pub fn register_function<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(handler));
        self
    }

    /// Handler for a task: its named function if any, else its kind's default
    pub fn resolve(&self, task: &WorkerTask) -> Result<TaskHandler, String> {
        match &task.function {
            Some(name) => self
                .functions
                .get(name)
                .cloned()
                .ok_or_else(|| format!("unknown function '{name}'")),
            None if task.kind == TaskKind::Custom => {
                Err("custom task without a function reference".to_string())
            }
            None => self
                .by_kind
                .get(&task.kind)
                .cloned()
                .ok_or_else(|| format!("no handler registered for {} tasks", task.kind)),
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub(crate) fn parse_integer(payload: &Value) -> Result<u64, String> {
    match payload {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| format!("{n} is not a non-negative integer")),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("cannot parse '{s}' as integer: {e}")),
        other => Err(format!("expected integer payload, got {other}")),
    }
}

fn factorize_payload(payload: &Value) -> Result<Value, String> {
    let n = parse_integer(payload)?;
    let factors = TrialDivision.factor(n);
    serde_json::to_value(factors).map_err(|e| e.to_string())
}
