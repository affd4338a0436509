use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use stream_engine::{
    HandlerRegistry, PoolError, TaskKind, WorkerPool, WorkerPoolConfig, WorkerTask,
};

fn config(min: usize, max: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        min_workers: min,
        max_workers: max,
        ..Default::default()
    }
}

/// `sleep` waits `ms` then echoes `tag`; `panic` brings the worker down
fn registry() -> HandlerRegistry {
    HandlerRegistry::with_defaults()
        .register_function("sleep", |payload: &Value| {
            let ms = payload["ms"].as_u64().unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            Ok(payload["tag"].clone())
        })
        .register_function("panic", |_: &Value| -> Result<Value, String> {
            panic!("handler exploded")
        })
}

fn sleep_task(tag: impl Into<Value>, ms: u64) -> WorkerTask {
    WorkerTask::custom("sleep", json!({ "tag": tag.into(), "ms": ms }))
}

#[tokio::test]
async fn test_execute_many_one_result_per_task() {
    let pool = WorkerPool::new(config(2, 4), registry()).expect("Pool creation failed");
    let tasks: Vec<WorkerTask> = (0..20)
        .map(|i| WorkerTask::with_id(format!("task-{i}"), TaskKind::Transform, json!(i)))
        .collect();

    let results = pool.execute_many(tasks).await.expect("Batch failed");
    assert_eq!(results.len(), 20);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.id, format!("task-{i}"));
        assert!(result.ok);
        assert_eq!(result.value, Some(json!(i)));
    }
    let ids: HashSet<_> = results.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids.len(), 20);

    let stats = pool.stats();
    assert_eq!(stats.completed, 20);
    assert!(stats.total_workers <= 4);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_queue_is_fifo_with_one_worker() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let registry = HandlerRegistry::new().register_function("record", move |payload: &Value| {
        std::thread::sleep(Duration::from_millis(20));
        seen.lock().push(payload.as_u64().unwrap_or_default());
        Ok(payload.clone())
    });
    let pool = WorkerPool::new(config(1, 1), registry).expect("Pool creation failed");

    let handles: Vec<_> = (0..6u64)
        .map(|i| {
            pool.submit(WorkerTask::custom("record", json!(i)))
                .expect("Submit failed")
        })
        .collect();
    assert_eq!(pool.stats().queued, 5);

    for handle in handles {
        assert!(handle.await.expect("Task failed").ok);
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_rejects_at_high_water_mark() {
    let pool = WorkerPool::new(
        WorkerPoolConfig {
            queue_high_water_mark: 2,
            ..config(1, 1)
        },
        registry(),
    )
    .expect("Pool creation failed");

    let running = pool.submit(sleep_task("a", 100)).expect("Submit failed");
    let queued: Vec<_> = ["b", "c"]
        .into_iter()
        .map(|tag| pool.submit(sleep_task(tag, 1)).expect("Submit failed"))
        .collect();

    let err = pool.submit(sleep_task("d", 1)).expect_err("Queue should be full");
    assert_eq!(
        err,
        PoolError::QueueFull {
            queued: 2,
            high_water_mark: 2
        }
    );

    assert_eq!(running.await.expect("Task failed").value, Some(json!("a")));
    for handle in queued {
        assert!(handle.await.expect("Task failed").ok);
    }
    pool.shutdown().await;
}

#[tokio::test]
async fn test_crash_fails_only_its_task() {
    let pool = WorkerPool::new(config(1, 1), registry()).expect("Pool creation failed");

    let crash = pool
        .submit(WorkerTask::with_id("bad", TaskKind::Custom, json!(null)).with_function("panic"))
        .expect("Submit failed");
    let after: Vec<_> = (0..3)
        .map(|i| pool.submit(sleep_task(i, 1)).expect("Submit failed"))
        .collect();

    match crash.await {
        Err(PoolError::WorkerCrash {
            task_id, reason, ..
        }) => {
            assert_eq!(task_id, "bad");
            assert!(reason.contains("handler exploded"));
        }
        other => panic!("expected a crash, got {other:?}"),
    }
    for (i, handle) in after.into_iter().enumerate() {
        let result = handle.await.expect("Queued task lost");
        assert_eq!(result.value, Some(json!(i)));
    }

    let stats = pool.stats();
    assert_eq!(stats.crashed, 1);
    assert_eq!(stats.total_workers, 1);
    assert_eq!(stats.spawned, 2);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_task_timeout_replaces_worker() {
    let pool = WorkerPool::new(
        WorkerPoolConfig {
            task_timeout_ms: Some(50),
            ..config(1, 1)
        },
        registry(),
    )
    .expect("Pool creation failed");

    let slow = WorkerTask::with_id("slow", TaskKind::Custom, json!({ "tag": "slow", "ms": 400 }))
        .with_function("sleep");
    let err = pool
        .execute(slow)
        .await
        .expect_err("Task should time out");
    assert_eq!(
        err,
        PoolError::TaskTimeout {
            task_id: "slow".into(),
            timeout: Duration::from_millis(50)
        }
    );

    // A fresh worker serves the next task
    let next = pool.execute(sleep_task("fast", 1)).await.expect("Task failed");
    assert_eq!(next.value, Some(json!("fast")));

    let stats = pool.stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_idle_workers_evicted_to_min() {
    let pool = WorkerPool::new(
        WorkerPoolConfig {
            idle_timeout_ms: 50,
            scavenge_interval_ms: 20,
            ..config(1, 3)
        },
        registry(),
    )
    .expect("Pool creation failed");

    let tasks = (0..3).map(|i| sleep_task(i, 30)).collect();
    pool.execute_many(tasks).await.expect("Batch failed");
    assert_eq!(pool.stats().total_workers, 3);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = pool.stats();
    assert_eq!(stats.total_workers, 1);
    assert_eq!(stats.evicted, 2);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_rejects_queue_and_finishes_running() {
    let pool = WorkerPool::new(config(1, 1), registry()).expect("Pool creation failed");

    let running = pool.submit(sleep_task("running", 80)).expect("Submit failed");
    let queued = pool.submit(sleep_task("queued", 1)).expect("Submit failed");

    pool.shutdown().await;

    assert_eq!(
        running.await.expect("Running task lost").value,
        Some(json!("running"))
    );
    assert_eq!(queued.await.expect_err("Queued task ran"), PoolError::ShuttingDown);
    assert!(pool.is_shutting_down());
    assert_eq!(
        pool.execute(sleep_task("late", 1)).await.expect_err("Admitted after shutdown"),
        PoolError::ShuttingDown
    );
}

#[tokio::test]
async fn test_default_factorize_handler() {
    let pool = WorkerPool::with_defaults(config(1, 2)).expect("Pool creation failed");
    let result = pool
        .execute(WorkerTask::new(TaskKind::Factorize, json!("600851475143")))
        .await
        .expect("Task failed");
    assert_eq!(
        result.value,
        Some(json!([
            { "prime": 71, "exponent": 1 },
            { "prime": 839, "exponent": 1 },
            { "prime": 1471, "exponent": 1 },
            { "prime": 6857, "exponent": 1 }
        ]))
    );
    assert!(pool.stats().avg_execution_time_ms >= 0.0);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_wire_shapes() {
    let task = WorkerTask::with_id("t1", TaskKind::Process, json!([1, 2])).with_function("sum");
    assert_eq!(
        serde_json::to_value(&task).expect("Serialize failed"),
        json!({ "id": "t1", "kind": "process", "data": [1, 2], "functionCode": "sum" })
    );

    let pool = WorkerPool::new(config(1, 1), registry()).expect("Pool creation failed");
    let result = pool.execute(sleep_task("x", 0)).await.expect("Task failed");
    let wire = serde_json::to_value(&result).expect("Serialize failed");
    assert_eq!(wire["success"], json!(true));
    assert_eq!(wire["result"], json!("x"));
    assert!(wire["executionTimeMs"].is_number());
    pool.shutdown().await;
}
