//! Integer factorization with size-based offloading
//!
//! [`AdaptiveFactorizer`] keeps small inputs on the calling task and routes
//! inputs whose bit length reaches a threshold to the [`WorkerPool`], where
//! the registered `factorize` handler does the CPU-bound work.

use crate::error::StageError;
use crate::pool::{TaskKind, WorkerPool, WorkerTask};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One prime power `prime^exponent`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Factor {
    pub prime: u64,
    pub exponent: u32,
}

/// Prime factorization function
pub trait Factorizer: Send + Sync {
    /// Prime powers of `n` in ascending prime order; empty for 0 and 1
    fn factor(&self, n: u64) -> Vec<Factor>;
}

/// Plain trial division, adequate for 64-bit inputs with small factors
#[derive(Debug, Default, Clone, Copy)]
pub struct TrialDivision;

impl Factorizer for TrialDivision {
    fn factor(&self, mut n: u64) -> Vec<Factor> {
        let mut factors = Vec::new();
        if n < 2 {
            return factors;
        }
        let mut push = |prime: u64, n: &mut u64| {
            let mut exponent = 0;
            while *n % prime == 0 {
                *n /= prime;
                exponent += 1;
            }
            if exponent > 0 {
                factors.push(Factor { prime, exponent });
            }
        };
        push(2, &mut n);
        let mut p = 3u64;
        while p.saturating_mul(p) <= n {
            push(p, &mut n);
            p += 2;
        }
        if n > 1 {
            factors.push(Factor {
                prime: n,
                exponent: 1,
            });
        }
        factors
    }
}

/// Bit length of `n`, the cost measure used for routing
pub fn bit_length(n: u64) -> u32 {
    u64::BITS - n.leading_zeros()
}

/// Factorizes inline below `threshold_bits`, on the worker pool at or above it
#[derive(Clone)]
pub struct AdaptiveFactorizer {
    pool: WorkerPool,
    local: Arc<dyn Factorizer>,
    threshold_bits: u32,
}

impl AdaptiveFactorizer {
    pub fn new(pool: WorkerPool, threshold_bits: u32) -> Self {
        Self {
            pool,
            local: Arc::new(TrialDivision),
            threshold_bits,
        }
    }

    /// Use a different inline factorizer
    pub fn with_local(mut self, local: Arc<dyn Factorizer>) -> Self {
        self.local = local;
        self
    }

    pub fn should_offload(&self, n: u64) -> bool {
        bit_length(n) >= self.threshold_bits
    }

    pub async fn factor(&self, n: u64) -> Result<Vec<Factor>, StageError> {
        if !self.should_offload(n) {
            return Ok(self.local.factor(n));
        }
        let result = self
            .pool
            .execute(WorkerTask::new(TaskKind::Factorize, serde_json::json!(n)))
            .await?;
        Ok(serde_json::from_value(result.into_value()?)?)
    }
}
