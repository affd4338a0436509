//! Bounded pool of OS-thread workers
//!
//! The pool accepts [`WorkerTask`]s and resolves each with exactly one
//! [`WorkerResult`] or [`PoolError`]. All admission, assignment and
//! bookkeeping happen under a single mutex; workers run in parallel outside
//! it and re-enter only to report completion or a crash.
//!
//! Lifecycle:
//!
//! - `min_workers` threads start at construction; more are spawned on demand
//!   up to `max_workers`.
//! - A task arriving while every worker is busy and the pool is full is queued
//!   (FIFO). Once `queue_high_water_mark` tasks are pending, new submissions
//!   are rejected immediately with [`PoolError::QueueFull`].
//! - A panicking handler fails only the task it was running. The worker is
//!   replaced when the pool would fall below `min_workers` or when queued work
//!   has no worker to run on.
//! - A task exceeding `task_timeout_ms` is failed with
//!   [`PoolError::TaskTimeout`] and its worker is abandoned and replaced.
//!   Threads cannot be killed, so the abandoned thread exits as soon as its
//!   handler returns.
//! - A periodic sweep evicts workers idle longer than `idle_timeout_ms`, never
//!   going below `min_workers`.
//!
//! The pool needs a tokio runtime for its timers; construct it from within
//! one. Handles are cheap to clone and share the same pool.

mod registry;
mod task;
mod worker;

pub use registry::{HandlerRegistry, TaskHandler};
pub use task::{TaskKind, WorkerResult, WorkerTask};

use crate::config::WorkerPoolConfig;
use crate::error::{PoolError, PoolResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};
use worker::{Assignment, WorkerHandle};

type Reply = oneshot::Sender<PoolResult<WorkerResult>>;

/// Pool-internal view of one worker
#[derive(Debug)]
struct WorkerState {
    worker_id: usize,
    busy: bool,
    current_task_id: Option<String>,
    last_activity: Instant,
    completed: u64,
    failed: u64,
}

struct Running {
    seq: u64,
    task_id: String,
    reply: Reply,
}

struct WorkerSlot {
    state: WorkerState,
    handle: WorkerHandle,
    running: Option<Running>,
}

struct Pending {
    task: WorkerTask,
    reply: Reply,
}

#[derive(Default)]
struct Counters {
    completed: u64,
    failed: u64,
    results: u64,
    total_execution_ms: f64,
    spawned: u64,
    crashed: u64,
    timed_out: u64,
    evicted: u64,
}

#[derive(Default)]
struct PoolState {
    workers: BTreeMap<usize, WorkerSlot>,
    queue: VecDeque<Pending>,
    next_worker_id: usize,
    next_seq: u64,
    shutting_down: bool,
    counters: Counters,
}

impl PoolState {
    fn idle_worker(&self) -> Option<usize> {
        self.workers
            .values()
            .find(|slot| !slot.state.busy)
            .map(|slot| slot.state.worker_id)
    }

    fn busy_count(&self) -> usize {
        self.workers.values().filter(|slot| slot.state.busy).count()
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub total_workers: usize,
    pub active: usize,
    pub idle: usize,
    pub queued: usize,
    /// Tasks whose handler succeeded
    pub completed: u64,
    /// Tasks that failed, crashed or timed out
    pub failed: u64,
    /// Mean handler time over delivered results, in milliseconds
    pub avg_execution_time_ms: f64,
    pub spawned: u64,
    pub crashed: u64,
    pub timed_out: u64,
    pub evicted: u64,
}

pub(crate) struct PoolShared {
    config: WorkerPoolConfig,
    registry: Arc<HandlerRegistry>,
    runtime: Handle,
    state: Mutex<PoolState>,
    worker_released: Notify,
    this: Weak<PoolShared>,
}

/// Handle to a worker pool
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Start a pool with `min_workers` threads. Must be called inside a tokio runtime.
    pub fn new(config: WorkerPoolConfig, registry: HandlerRegistry) -> PoolResult<Self> {
        config
            .validate()
            .map_err(|e| PoolError::Config(e.to_string()))?;
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;

        let shared = Arc::new_cyclic(|this| PoolShared {
            config,
            registry: Arc::new(registry),
            runtime,
            state: Mutex::new(PoolState::default()),
            worker_released: Notify::new(),
            this: this.clone(),
        });

        {
            let mut state = shared.state.lock();
            for _ in 0..shared.config.min_workers {
                shared.spawn_worker(&mut state)?;
            }
        }
        shared.start_scavenger();

        info!(
            min_workers = shared.config.min_workers,
            max_workers = shared.config.max_workers,
            "worker pool started"
        );
        Ok(Self { shared })
    }

    /// Pool with the default handlers for each task kind
    pub fn with_defaults(config: WorkerPoolConfig) -> PoolResult<Self> {
        Self::new(config, HandlerRegistry::with_defaults())
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    /// Admit a task. Rejection (queue full, shutting down) is reported here,
    /// before anything is awaited.
    pub fn submit(&self, task: WorkerTask) -> PoolResult<TaskHandle> {
        let task_id = task.id.clone();
        let (reply, receiver) = oneshot::channel();
        self.shared.admit(task, reply)?;
        Ok(TaskHandle { task_id, receiver })
    }

    /// Run one task to completion
    pub async fn execute(&self, task: WorkerTask) -> PoolResult<WorkerResult> {
        self.submit(task)?.await
    }

    /// Run several tasks concurrently; results come back in submission order.
    /// Fails with the first error, in which case tasks already admitted still run.
    pub async fn execute_many(&self, tasks: Vec<WorkerTask>) -> PoolResult<Vec<WorkerResult>> {
        let handles = tasks
            .into_iter()
            .map(|task| self.submit(task))
            .collect::<PoolResult<Vec<_>>>()?;
        futures::future::try_join_all(handles).await
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let total = state.workers.len();
        let active = state.busy_count();
        let c = &state.counters;
        PoolStats {
            total_workers: total,
            active,
            idle: total - active,
            queued: state.queue.len(),
            completed: c.completed,
            failed: c.failed,
            avg_execution_time_ms: if c.results > 0 {
                c.total_execution_ms / c.results as f64
            } else {
                0.0
            },
            spawned: c.spawned,
            crashed: c.crashed,
            timed_out: c.timed_out,
            evicted: c.evicted,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Stop admitting tasks, reject the queue, wait for running tasks to
    /// finish, then stop every worker.
    pub async fn shutdown(&self) {
        let rejected = {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
            let rejected: Vec<Pending> = state.queue.drain(..).collect();
            state.counters.failed += rejected.len() as u64;
            rejected
        };
        if !rejected.is_empty() {
            debug!(count = rejected.len(), "rejecting queued tasks on shutdown");
        }
        for pending in rejected {
            let _ = pending.reply.send(Err(PoolError::ShuttingDown));
        }

        loop {
            let released = self.shared.worker_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            let running: Vec<String> = self
                .shared
                .state
                .lock()
                .workers
                .values()
                .filter_map(|slot| slot.state.current_task_id.clone())
                .collect();
            if running.is_empty() {
                break;
            }
            debug!(tasks = ?running, "waiting for running tasks before shutdown");
            released.await;
        }

        let threads: Vec<_> = {
            let mut state = self.shared.state.lock();
            std::mem::take(&mut state.workers)
                .into_values()
                .filter_map(|slot| slot.handle.terminate())
                .collect()
        };
        let count = threads.len();
        let joined = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        })
        .await;
        if let Err(e) = joined {
            error!(error = %e, "failed to join worker threads");
        }
        info!(workers = count, "worker pool shut down");
    }
}

impl PoolShared {
    fn admit(&self, task: WorkerTask, reply: Reply) -> PoolResult<()> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(PoolError::ShuttingDown);
        }
        let high_water_mark = self.config.queue_high_water_mark;
        if state.queue.len() >= high_water_mark {
            warn!(queued = state.queue.len(), "rejecting task, queue full");
            return Err(PoolError::QueueFull {
                queued: state.queue.len(),
                high_water_mark,
            });
        }

        let worker_id = match state.idle_worker() {
            Some(id) => Some(id),
            None if state.workers.len() < self.config.max_workers => {
                Some(self.spawn_worker(&mut state)?)
            }
            None => None,
        };
        match worker_id {
            Some(worker_id) => self.assign(&mut state, worker_id, task, reply),
            None => {
                debug!(task_id = %task.id, queued = state.queue.len() + 1, "all workers busy, queueing");
                state.queue.push_back(Pending { task, reply });
            }
        }
        Ok(())
    }

    fn spawn_worker(&self, state: &mut PoolState) -> PoolResult<usize> {
        let id = state.next_worker_id;
        let handle = worker::spawn(id, Arc::clone(&self.registry), self.this.clone())
            .map_err(|e| PoolError::Spawn(e.to_string()))?;
        state.next_worker_id += 1;
        state.counters.spawned += 1;
        state.workers.insert(
            id,
            WorkerSlot {
                state: WorkerState {
                    worker_id: id,
                    busy: false,
                    current_task_id: None,
                    last_activity: Instant::now(),
                    completed: 0,
                    failed: 0,
                },
                handle,
                running: None,
            },
        );
        Ok(id)
    }

    fn assign(&self, state: &mut PoolState, worker_id: usize, task: WorkerTask, reply: Reply) {
        let seq = state.next_seq;
        state.next_seq += 1;

        let Some(slot) = state.workers.get_mut(&worker_id) else {
            state.queue.push_front(Pending { task, reply });
            return;
        };
        let task_id = task.id.clone();
        if let Err(Assignment { task, .. }) = slot.handle.send(Assignment { seq, task }) {
            // Thread already gone: drop the slot and put the task back
            warn!(worker_id, "worker mailbox closed, removing worker");
            state.workers.remove(&worker_id);
            state.queue.push_front(Pending { task, reply });
            self.replenish(state);
            return;
        }
        slot.state.busy = true;
        slot.state.current_task_id = Some(task_id.clone());
        slot.state.last_activity = Instant::now();
        slot.running = Some(Running {
            seq,
            task_id,
            reply,
        });

        if let Some(timeout) = self.config.task_timeout() {
            self.arm_timeout(worker_id, seq, timeout);
        }
    }

    fn arm_timeout(&self, worker_id: usize, seq: u64, timeout: Duration) {
        let pool = self.this.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(pool) = pool.upgrade() {
                pool.on_timeout(worker_id, seq, timeout);
            }
        });
    }

    /// Take the running task if `seq` still identifies it
    fn take_running(state: &mut PoolState, worker_id: usize, seq: u64) -> Option<Running> {
        let slot = state.workers.get_mut(&worker_id)?;
        match slot.running.take() {
            Some(running) if running.seq == seq => Some(running),
            other => {
                slot.running = other;
                None
            }
        }
    }

    pub(crate) fn on_complete(&self, worker_id: usize, seq: u64, result: WorkerResult) {
        let mut state = self.state.lock();
        let Some(running) = Self::take_running(&mut state, worker_id, seq) else {
            debug!(worker_id, task_id = %result.id, "discarding late result");
            return;
        };

        let c = &mut state.counters;
        c.results += 1;
        c.total_execution_ms += result.execution_time_ms;
        if result.ok {
            c.completed += 1;
        } else {
            c.failed += 1;
        }
        if let Some(slot) = state.workers.get_mut(&worker_id) {
            if result.ok {
                slot.state.completed += 1;
            } else {
                slot.state.failed += 1;
            }
            slot.state.busy = false;
            slot.state.current_task_id = None;
            slot.state.last_activity = Instant::now();
        }
        let _ = running.reply.send(Ok(result));

        if let Some(next) = state.queue.pop_front() {
            self.assign(&mut state, worker_id, next.task, next.reply);
        }
        drop(state);
        self.worker_released.notify_waiters();
    }

    pub(crate) fn on_crash(&self, worker_id: usize, seq: u64, reason: String) {
        let mut state = self.state.lock();
        let running = Self::take_running(&mut state, worker_id, seq);
        let Some(slot) = state.workers.remove(&worker_id) else {
            return;
        };
        drop(slot.handle.terminate());
        state.counters.crashed += 1;

        if let Some(running) = running {
            state.counters.failed += 1;
            error!(worker_id, task_id = %running.task_id, %reason, "worker crashed");
            let _ = running.reply.send(Err(PoolError::WorkerCrash {
                worker_id,
                task_id: running.task_id,
                reason,
            }));
        }
        self.replenish(&mut state);
        drop(state);
        self.worker_released.notify_waiters();
    }

    fn on_timeout(&self, worker_id: usize, seq: u64, timeout: Duration) {
        let mut state = self.state.lock();
        let Some(running) = Self::take_running(&mut state, worker_id, seq) else {
            return;
        };
        if let Some(slot) = state.workers.remove(&worker_id) {
            // Detach: the thread exits once its handler returns
            drop(slot.handle.terminate());
        }
        state.counters.timed_out += 1;
        state.counters.failed += 1;
        warn!(
            worker_id,
            task_id = %running.task_id,
            timeout_ms = timeout.as_millis() as u64,
            "task timed out, abandoning worker"
        );
        let _ = running.reply.send(Err(PoolError::TaskTimeout {
            task_id: running.task_id,
            timeout,
        }));
        self.replenish(&mut state);
        drop(state);
        self.worker_released.notify_waiters();
    }

    /// Restore `min_workers` and make sure queued tasks have somewhere to run
    fn replenish(&self, state: &mut PoolState) {
        if state.shutting_down {
            return;
        }
        while state.workers.len() < self.config.min_workers {
            if let Err(e) = self.spawn_worker(state) {
                error!(error = %e, "failed to respawn worker");
                break;
            }
        }
        while !state.queue.is_empty() {
            let worker_id = match state.idle_worker() {
                Some(id) => id,
                None if state.workers.len() < self.config.max_workers => {
                    match self.spawn_worker(state) {
                        Ok(id) => id,
                        Err(e) => {
                            error!(error = %e, "failed to spawn worker for queued task");
                            break;
                        }
                    }
                }
                None => break,
            };
            if let Some(next) = state.queue.pop_front() {
                self.assign(state, worker_id, next.task, next.reply);
            }
        }
    }

    fn evict_idle(&self) {
        let mut state = self.state.lock();
        let idle_timeout = self.config.idle_timeout();
        let mut candidates: Vec<(Instant, usize)> = state
            .workers
            .values()
            .filter(|slot| !slot.state.busy && slot.state.last_activity.elapsed() > idle_timeout)
            .map(|slot| (slot.state.last_activity, slot.state.worker_id))
            .collect();
        candidates.sort();

        for (_, worker_id) in candidates {
            if state.workers.len() <= self.config.min_workers {
                break;
            }
            if let Some(slot) = state.workers.remove(&worker_id) {
                debug!(
                    worker_id,
                    completed = slot.state.completed,
                    failed = slot.state.failed,
                    "evicting idle worker"
                );
                drop(slot.handle.terminate());
                state.counters.evicted += 1;
            }
        }
    }

    fn start_scavenger(&self) {
        let pool = self.this.clone();
        let period = self.config.scavenge_interval();
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if pool.state.lock().shutting_down {
                    break;
                }
                pool.evict_idle();
            }
        });
    }
}

/// Pending result of a submitted task
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    receiver: oneshot::Receiver<PoolResult<WorkerResult>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Future for TaskHandle {
    type Output = PoolResult<WorkerResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without a reply: the pool went away
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::ShuttingDown)),
            Poll::Pending => Poll::Pending,
        }
    }
}
