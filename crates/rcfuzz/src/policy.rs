use indexmap::IndexMap;
use itertools::Itertools;
use tracing::debug;

use crate::bitmap::Bitmap;
use crate::coverage::FuzzerInfo;
use crate::fuzzers::FuzzerKind;

/// Minimum per-fuzzer focus budget in seconds. Allocating less than this
/// thrashes on context switches, so such fuzzers are dropped from the round.
pub const EXPLOIT_TIME_THRESHOLD: f64 = 20.0;

/// CPU apportionment for one exploit round.
#[derive(Debug, Clone)]
pub struct CpuAssignment {
    /// Surviving fuzzers, sorted by assigned share descending.
    pub picked: Vec<FuzzerKind>,
    pub shares: IndexMap<FuzzerKind, f64>,
}

pub fn bitmap_intersection(fuzzers: &[FuzzerKind], info: &FuzzerInfo) -> Bitmap {
    fuzzers.iter().fold(Bitmap::full(), |acc, fuzzer| {
        acc.intersect(&info.per_fuzzer[fuzzer].bitmap)
    })
}

pub fn bitmap_union(fuzzers: &[FuzzerKind], info: &FuzzerInfo) -> Bitmap {
    fuzzers.iter().fold(Bitmap::empty(), |acc, fuzzer| {
        acc.union(&info.per_fuzzer[fuzzer].bitmap)
    })
}

/// Edges each fuzzer holds beyond the cohort consensus: `|bitmap[f] \ ∩|`.
pub fn intersection_contribution(
    fuzzers: &[FuzzerKind],
    info: &FuzzerInfo,
) -> IndexMap<FuzzerKind, usize> {
    let intersection = bitmap_intersection(fuzzers, info);
    fuzzers
        .iter()
        .map(|fuzzer| {
            let contribution = info.per_fuzzer[fuzzer].bitmap.diff(&intersection).count();
            (*fuzzer, contribution)
        })
        .collect()
}

/// Apportion `jobs` CPUs over `fuzzers` proportionally to their
/// intersection contribution.
///
/// A fuzzer whose tentative focus budget (`cpu · exploit_time · |F|`) would
/// fall below [`EXPLOIT_TIME_THRESHOLD`] seconds is dropped and the shares
/// are renormalized over the survivors. With no contribution anywhere the
/// assignment is uniform.
pub fn calculate_cpu(
    fuzzers: &[FuzzerKind],
    info: &FuzzerInfo,
    jobs: f64,
    exploit_time: f64,
) -> CpuAssignment {
    let contribution = intersection_contribution(fuzzers, info);
    debug!(?contribution, "intersection contribution");
    let total: usize = contribution.values().sum();

    if total == 0 {
        let share = jobs / fuzzers.len() as f64;
        return CpuAssignment {
            picked: fuzzers.to_vec(),
            shares: fuzzers.iter().map(|fuzzer| (*fuzzer, share)).collect(),
        };
    }

    let mut kept = Vec::new();
    let mut kept_total = 0usize;
    for fuzzer in fuzzers {
        let cpu = jobs * contribution[fuzzer] as f64 / total as f64;
        if cpu * exploit_time * fuzzers.len() as f64 > EXPLOIT_TIME_THRESHOLD {
            kept.push(*fuzzer);
            kept_total += contribution[fuzzer];
        }
    }

    let picked: Vec<FuzzerKind> = kept
        .iter()
        .copied()
        .sorted_by(|a, b| contribution[b].cmp(&contribution[a]))
        .collect();
    let shares: IndexMap<FuzzerKind, f64> = picked
        .iter()
        .map(|fuzzer| {
            let share = jobs * contribution[fuzzer] as f64 / kept_total as f64;
            (*fuzzer, share)
        })
        .collect();
    CpuAssignment { picked, shares }
}
