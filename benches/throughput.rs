use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use stream_engine::{
    NullLogger, StreamPipeline, TaskKind, WorkerPool, WorkerPoolConfig, WorkerTask,
};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Runtime build failed")
}

fn quiet() -> StreamPipeline<u64> {
    StreamPipeline::new().with_logger(Arc::new(NullLogger))
}

fn benchmark_single_stage_throughput(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("single_stage_1000_items", |b| {
        b.iter(|| {
            rt.block_on(async {
                quiet()
                    .source(0..1000u64)
                    .map(|x| black_box(x + 1))
                    .collect()
                    .await
                    .expect("Run failed")
            })
        });
    });
}

fn benchmark_three_stage_throughput(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("three_stage_1000_items", |b| {
        b.iter(|| {
            rt.block_on(async {
                quiet()
                    .source(0..1000u64)
                    .map(|x| x * 3)
                    .filter(|x| x % 2 == 0)
                    .batch_with(10, |items| items.into_iter().sum())
                    .reduce(|acc: u64, x: u64| acc + black_box(x), 0)
                    .await
                    .expect("Run failed")
            })
        });
    });
}

fn benchmark_parallel_throughput(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("parallel_8_10000_items", |b| {
        b.iter(|| {
            rt.block_on(async {
                quiet()
                    .source(0..10_000u64)
                    .parallel(8, |x| async move { Ok(black_box(x) ^ 0x5a5a) })
                    .sink(|_| async { Ok(()) })
                    .await
            })
        });
    });
}

fn benchmark_pool_round_trip(c: &mut Criterion) {
    let rt = runtime();
    let pool = rt.block_on(async {
        WorkerPool::with_defaults(WorkerPoolConfig {
            min_workers: 4,
            max_workers: 4,
            ..Default::default()
        })
        .expect("Pool creation failed")
    });

    c.bench_function("pool_execute_many_100_tasks", |b| {
        b.iter(|| {
            rt.block_on(async {
                let tasks = (0..100u64)
                    .map(|i| WorkerTask::new(TaskKind::Factorize, json!(1_000_003 * (i + 2))))
                    .collect();
                let results: Vec<Value> = pool
                    .execute_many(tasks)
                    .await
                    .expect("Batch failed")
                    .into_iter()
                    .filter_map(|r| r.value)
                    .collect();
                black_box(results)
            })
        });
    });

    rt.block_on(pool.shutdown());
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(50);
    targets = benchmark_single_stage_throughput, benchmark_three_stage_throughput,
        benchmark_parallel_throughput, benchmark_pool_round_trip
);
criterion_main!(benches);
