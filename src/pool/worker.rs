//! Worker threads
//!
//! Each worker is a dedicated OS thread with its own mailbox. It receives one
//! [`Assignment`] at a time, runs the resolved handler and reports exactly one
//! outcome back to the pool. A handler panic is caught at the thread boundary
//! and reported as a crash, after which the thread exits; the pool decides
//! whether to respawn.
//!
//! Dropping the mailbox sender is the termination signal. A worker abandoned
//! mid-task (task timeout) keeps running until its handler returns, then finds
//! its mailbox closed and exits; its late result is ignored by the pool.

use super::registry::HandlerRegistry;
use super::task::{WorkerResult, WorkerTask};
use super::PoolShared;
use crossbeam::channel::{self, Receiver, Sender};
use std::any::Any;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, trace};

/// A task handed to a specific worker. `seq` distinguishes successive
/// assignments so stale completions and timers can be told apart.
#[derive(Debug)]
pub(crate) struct Assignment {
    pub seq: u64,
    pub task: WorkerTask,
}

/// Pool-side handle to a live worker thread
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    id: usize,
    mailbox: Sender<Assignment>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Hand an assignment to the worker; gives it back if the thread is gone
    pub fn send(&self, assignment: Assignment) -> Result<(), Assignment> {
        self.mailbox.send(assignment).map_err(|e| e.into_inner())
    }

    /// Close the mailbox and hand back the thread for joining
    pub fn terminate(mut self) -> Option<JoinHandle<()>> {
        trace!(worker_id = self.id, "closing worker mailbox");
        self.thread.take()
    }
}

pub(crate) fn spawn(
    id: usize,
    registry: Arc<HandlerRegistry>,
    pool: Weak<PoolShared>,
) -> io::Result<WorkerHandle> {
    let (mailbox, inbox) = channel::unbounded();
    let thread = thread::Builder::new()
        .name(format!("pool-worker-{id}"))
        .spawn(move || run(id, inbox, registry, pool))?;
    debug!(worker_id = id, "worker spawned");
    Ok(WorkerHandle {
        id,
        mailbox,
        thread: Some(thread),
    })
}

fn run(
    id: usize,
    inbox: Receiver<Assignment>,
    registry: Arc<HandlerRegistry>,
    pool: Weak<PoolShared>,
) {
    while let Ok(Assignment { seq, task }) = inbox.recv() {
        trace!(worker_id = id, task_id = %task.id, "task received");
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| execute(&registry, &task, started)));

        let Some(pool) = pool.upgrade() else {
            break;
        };
        match outcome {
            Ok(result) => pool.on_complete(id, seq, result),
            Err(payload) => {
                pool.on_crash(id, seq, panic_message(payload.as_ref()));
                break;
            }
        }
    }
    trace!(worker_id = id, "worker exiting");
}

fn execute(registry: &HandlerRegistry, task: &WorkerTask, started: Instant) -> WorkerResult {
    let outcome = registry
        .resolve(task)
        .and_then(|handler| handler(&task.payload));
    match outcome {
        Ok(value) => WorkerResult::success(task.id.clone(), value, started.elapsed()),
        Err(message) => WorkerResult::failure(task.id.clone(), message, started.elapsed()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
