use indexmap::IndexMap;
use itertools::Itertools;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::Serialize;
use tracing::trace;

use crate::fuzzers::FuzzerKind;

/// Lower bound for the adaptive threshold. Keeps the halving/doubling walk
/// reversible; the threshold must never reach zero.
pub const THRESHOLD_FLOOR: f64 = 1e-6;

/// Beta-Bernoulli state for one fuzzer.
///
/// `sample` draws from `Beta(S + 1, F + 1)`: a fuzzer with few observations
/// has a wide posterior and keeps getting explored, a consistently productive
/// one gets exploited without starving the rest.
#[derive(Debug, Clone, Serialize)]
pub struct BanditArm {
    successes: u64,
    failures: u64,
    threshold: f64,
    total_runtime: f64,
    difficulty: f64,
}

impl BanditArm {
    pub fn new(threshold: f64, difficulty: f64) -> Self {
        Self {
            successes: 0,
            failures: 0,
            threshold: threshold.max(THRESHOLD_FLOOR),
            total_runtime: 0.0,
            difficulty,
        }
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn total_runtime(&self) -> f64 {
        self.total_runtime
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let alpha = (self.successes + 1) as f64;
        let beta = (self.failures + 1) as f64;
        Beta::new(alpha, beta)
            .expect("shape parameters are at least one")
            .sample(rng)
    }

    /// Count one observation and adapt the threshold: double on success,
    /// halve on failure (floored).
    pub fn record(&mut self, success: bool) {
        if success {
            self.successes += 1;
            self.threshold *= 2.0;
        } else {
            self.failures += 1;
            self.threshold = (self.threshold * 0.5).max(THRESHOLD_FLOOR);
        }
    }

    pub fn add_runtime(&mut self, seconds: f64) {
        self.total_runtime += seconds;
    }

    pub fn reset_threshold(&mut self, threshold: f64) {
        self.threshold = threshold.max(THRESHOLD_FLOOR);
    }
}

/// Thompson selection: draw once per arm and keep the top `⌈n/2⌉` draws.
/// The returned subset preserves the arms' insertion order.
pub fn select_fuzzers<R: Rng + ?Sized>(
    arms: &IndexMap<FuzzerKind, BanditArm>,
    rng: &mut R,
) -> Vec<FuzzerKind> {
    let draws: Vec<(FuzzerKind, f64)> = arms
        .iter()
        .map(|(fuzzer, arm)| (*fuzzer, arm.sample(rng)))
        .collect();
    for (fuzzer, draw) in &draws {
        trace!(fuzzer = %fuzzer, draw, "thompson draw");
    }
    let keep = draws.len().div_ceil(2);
    let chosen: Vec<FuzzerKind> = draws
        .iter()
        .sorted_by(|a, b| b.1.total_cmp(&a.1))
        .take(keep)
        .map(|(fuzzer, _)| *fuzzer)
        .collect();
    arms.keys()
        .copied()
        .filter(|fuzzer| chosen.contains(fuzzer))
        .collect()
}
