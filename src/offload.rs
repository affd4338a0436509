//! Routing pipeline items to the worker pool
//!
//! An [`Offload`] decides per item whether to run a local function inline or
//! to serialize the item into a [`WorkerTask`] for the pool. Items cross the
//! boundary as JSON, so the pool handler must produce a value that
//! deserializes back into the item type.

use crate::error::StageError;
use crate::pool::{TaskKind, WorkerPool, WorkerTask};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

type CostFn<T> = Arc<dyn Fn(&T) -> u64 + Send + Sync>;
type LocalFn<T> = Arc<dyn Fn(T) -> Result<T, StageError> + Send + Sync>;

/// Inline-or-pool routing for a `parallel_offload` stage
pub struct Offload<T> {
    kind: TaskKind,
    function: Option<String>,
    local: LocalFn<T>,
    cost: Option<(CostFn<T>, u64)>,
}

impl<T> Clone for Offload<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            function: self.function.clone(),
            local: Arc::clone(&self.local),
            cost: self.cost.as_ref().map(|(f, t)| (Arc::clone(f), *t)),
        }
    }
}

impl<T> Offload<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Offload to the pool's default handler for `kind`
    pub fn kind<F>(kind: TaskKind, local: F) -> Self
    where
        F: Fn(T) -> Result<T, StageError> + Send + Sync + 'static,
    {
        Self {
            kind,
            function: None,
            local: Arc::new(local),
            cost: None,
        }
    }

    /// Offload to a handler function registered under `name`
    pub fn function<F>(name: impl Into<String>, local: F) -> Self
    where
        F: Fn(T) -> Result<T, StageError> + Send + Sync + 'static,
    {
        Self {
            kind: TaskKind::Custom,
            function: Some(name.into()),
            local: Arc::new(local),
            cost: None,
        }
    }

    /// Only items whose cost reaches `threshold` go to the pool; the rest run
    /// the local function. Without this every item is offloaded.
    pub fn when_costly<C>(mut self, cost: C, threshold: u64) -> Self
    where
        C: Fn(&T) -> u64 + Send + Sync + 'static,
    {
        self.cost = Some((Arc::new(cost), threshold));
        self
    }

    pub fn should_offload(&self, item: &T) -> bool {
        match &self.cost {
            Some((cost, threshold)) => cost(item) >= *threshold,
            None => true,
        }
    }

    fn task_for(&self, item: &T) -> Result<WorkerTask, StageError> {
        let task = WorkerTask::new(self.kind, serde_json::to_value(item)?);
        Ok(match &self.function {
            Some(name) => task.with_function(name.clone()),
            None => task,
        })
    }

    /// Process one item, inline or on the pool
    pub async fn run(&self, pool: &WorkerPool, item: T) -> Result<T, StageError> {
        if !self.should_offload(&item) {
            return (self.local)(item);
        }
        let task = self.task_for(&item)?;
        let value = pool.execute(task).await?.into_value()?;
        Ok(serde_json::from_value(value)?)
    }
}
