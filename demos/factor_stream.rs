//! Factorization stream with size-based offloading
//!
//! Small numbers are factored inline; numbers of 40 bits or more go to the
//! worker pool. Results are printed as they arrive, in input order.
//!
//! Usage: cargo run --example factor_stream --release

use std::time::Duration;
use stream_engine::{
    init_tracing, AdaptiveFactorizer, Factor, StreamPipeline, WorkerPool, WorkerPoolConfig,
};

#[derive(Debug, Clone)]
struct Job {
    n: u64,
    factors: Vec<Factor>,
}

fn render(factors: &[Factor]) -> String {
    factors
        .iter()
        .map(|f| match f.exponent {
            1 => f.prime.to_string(),
            e => format!("{}^{}", f.prime, e),
        })
        .collect::<Vec<_>>()
        .join(" * ")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");

    let pool = WorkerPool::with_defaults(WorkerPoolConfig {
        min_workers: 2,
        max_workers: 4,
        ..Default::default()
    })?;
    let factorizer = AdaptiveFactorizer::new(pool.clone(), 40);

    let inputs: Vec<u64> = vec![
        360,
        97,
        1 << 20,
        600_851_475_143,
        999_999_000_001,
        2_147_483_647,
        1_000_000_007 * 1_000_003,
        4_294_967_291 * 65_521,
    ];

    let result = StreamPipeline::new()
        .source(inputs.into_iter().map(|n| Job { n, factors: Vec::new() }))
        .parallel(4, move |job: Job| {
            let factorizer = factorizer.clone();
            async move {
                let factors = factorizer.factor(job.n).await?;
                Ok(Job { factors, ..job })
            }
        })
        .timeout(Duration::from_secs(30))
        .retry(1, Duration::from_millis(50))
        .on_error(|failure| eprintln!("failed: {}", failure.message))
        .sink(|job| async move {
            println!("{:>22} = {}", job.n, render(&job.factors));
            Ok(())
        })
        .await;

    let stats = pool.stats();
    println!(
        "\n{} numbers in {}ms; pool completed {} tasks on {} workers",
        result.items_processed, result.execution_time_ms, stats.completed, stats.total_workers
    );
    pool.shutdown().await;

    Ok(())
}
