use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::debug;

use crate::bitmap::Bitmap;
use crate::context::{CancelToken, unix_time};
use crate::error::{Error, Result};
use crate::evaluator::{Evaluation, Evaluator, LineCoverage, UniqueBugs};
use crate::fuzzers::FuzzerKind;

/// Backoff between probe retries while a snapshot is unavailable.
const PROBE_BACKOFF: Duration = Duration::from_secs(10);

/// Cumulative backoff after which an unavailable snapshot becomes fatal.
const PROBE_BACKOFF_LIMIT: u64 = 600;

/// Coverage state of a single fuzzer at a point in time.
#[derive(Debug, Clone)]
pub struct PerFuzzerInfo {
    pub bitmap: Bitmap,
    pub coverage: LineCoverage,
    pub unique_bugs: UniqueBugs,
}

impl From<Evaluation> for PerFuzzerInfo {
    fn from(evaluation: Evaluation) -> Self {
        Self {
            bitmap: evaluation.bitmap,
            coverage: evaluation.coverage,
            unique_bugs: evaluation.unique_bugs,
        }
    }
}

/// Immutable snapshot of the whole cohort.
///
/// `global.bitmap` is the union of the evaluator's aggregate map and every
/// per-fuzzer map, so it is a superset of each fuzzer's bitmap.
#[derive(Debug, Clone)]
pub struct FuzzerInfo {
    pub per_fuzzer: IndexMap<FuzzerKind, PerFuzzerInfo>,
    pub global: PerFuzzerInfo,
    /// Unix seconds at snapshot time.
    pub timestamp: f64,
}

impl FuzzerInfo {
    pub fn global_edges(&self) -> usize {
        self.global.bitmap.count()
    }
}

/// Composes evaluator polls into [`FuzzerInfo`] snapshots.
#[derive(Clone)]
pub struct CoverageProbe {
    evaluator: Arc<dyn Evaluator>,
    fuzzers: Vec<FuzzerKind>,
}

impl std::fmt::Debug for CoverageProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageProbe")
            .field("fuzzers", &self.fuzzers)
            .finish_non_exhaustive()
    }
}

impl CoverageProbe {
    pub fn new(evaluator: Arc<dyn Evaluator>, fuzzers: Vec<FuzzerKind>) -> Self {
        Self { evaluator, fuzzers }
    }

    /// Take a snapshot, or `None` while any fuzzer (or the aggregate) has no
    /// coverage yet.
    pub fn try_snapshot(&self) -> Result<Option<FuzzerInfo>> {
        let mut per_fuzzer = IndexMap::with_capacity(self.fuzzers.len());
        for fuzzer in &self.fuzzers {
            match self.evaluator.poll_fuzzer(*fuzzer)? {
                Some(evaluation) => per_fuzzer.insert(*fuzzer, PerFuzzerInfo::from(evaluation)),
                None => {
                    debug!(fuzzer = %fuzzer, "no coverage yet");
                    return Ok(None);
                }
            };
        }
        let Some(global_eval) = self.evaluator.poll_global()? else {
            debug!("no global coverage yet");
            return Ok(None);
        };
        let mut global = PerFuzzerInfo::from(global_eval);
        for info in per_fuzzer.values() {
            global.bitmap = global.bitmap.union(&info.bitmap);
        }
        Ok(Some(FuzzerInfo {
            per_fuzzer,
            global,
            timestamp: unix_time(),
        }))
    }

    /// Take a snapshot, waiting out evaluator lag with a cancellable 10 s
    /// backoff. Escalates after 600 s of cumulative waiting.
    pub fn require_snapshot(&self, cancel: &CancelToken) -> Result<FuzzerInfo> {
        let mut waited_secs = 0u64;
        loop {
            if let Some(info) = self.try_snapshot()? {
                return Ok(info);
            }
            if cancel.is_end() {
                return Err(Error::Interrupted);
            }
            if waited_secs >= PROBE_BACKOFF_LIMIT {
                return Err(Error::ProbeUnavailable { waited_secs });
            }
            debug!(waited_secs, "snapshot unavailable, backing off");
            cancel.sleep(PROBE_BACKOFF);
            waited_secs += PROBE_BACKOFF.as_secs();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Evaluator fake returning pre-scripted evaluations.
    #[derive(Default)]
    struct ScriptedEvaluator {
        per_fuzzer: Mutex<IndexMap<FuzzerKind, Evaluation>>,
        global: Mutex<Option<Evaluation>>,
    }

    impl ScriptedEvaluator {
        fn put_fuzzer(&self, fuzzer: FuzzerKind, edges: &[usize]) {
            self.per_fuzzer
                .lock()
                .unwrap()
                .insert(fuzzer, evaluation(edges));
        }

        fn put_global(&self, edges: &[usize]) {
            *self.global.lock().unwrap() = Some(evaluation(edges));
        }
    }

    fn evaluation(edges: &[usize]) -> Evaluation {
        let mut bitmap = Bitmap::empty();
        for edge in edges {
            bitmap.set(*edge);
        }
        Evaluation {
            coverage: LineCoverage::default(),
            unique_bugs: UniqueBugs::default(),
            bitmap,
        }
    }

    impl Evaluator for ScriptedEvaluator {
        fn poll_fuzzer(&self, fuzzer: FuzzerKind) -> Result<Option<Evaluation>> {
            Ok(self.per_fuzzer.lock().unwrap().get(&fuzzer).cloned())
        }

        fn poll_global(&self) -> Result<Option<Evaluation>> {
            Ok(self.global.lock().unwrap().clone())
        }

        fn is_alive(&self) -> bool {
            true
        }

        fn seed_finished(&self) -> bool {
            true
        }

        fn request_resync(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn snapshot_is_none_until_every_fuzzer_reports() {
        let evaluator = Arc::new(ScriptedEvaluator::default());
        let probe = CoverageProbe::new(
            evaluator.clone(),
            vec![FuzzerKind::Afl, FuzzerKind::Mopt],
        );
        assert!(probe.try_snapshot().unwrap().is_none());

        evaluator.put_fuzzer(FuzzerKind::Afl, &[1]);
        evaluator.put_global(&[1]);
        assert!(probe.try_snapshot().unwrap().is_none());

        evaluator.put_fuzzer(FuzzerKind::Mopt, &[2]);
        assert!(probe.try_snapshot().unwrap().is_some());
    }

    #[test]
    fn global_bitmap_is_union_of_per_fuzzer_maps() {
        let evaluator = Arc::new(ScriptedEvaluator::default());
        evaluator.put_fuzzer(FuzzerKind::Afl, &[1, 2]);
        evaluator.put_fuzzer(FuzzerKind::Mopt, &[2, 3]);
        evaluator.put_global(&[1]);
        let probe = CoverageProbe::new(
            evaluator.clone(),
            vec![FuzzerKind::Afl, FuzzerKind::Mopt],
        );

        let info = probe.try_snapshot().unwrap().unwrap();
        let union = info.per_fuzzer[&FuzzerKind::Afl]
            .bitmap
            .union(&info.per_fuzzer[&FuzzerKind::Mopt].bitmap);
        assert_eq!(info.global.bitmap, union);
        for per in info.per_fuzzer.values() {
            assert!(info.global.bitmap.is_superset(&per.bitmap));
        }
    }

    #[test]
    fn global_bitmap_is_monotonic_across_snapshots() {
        let evaluator = Arc::new(ScriptedEvaluator::default());
        evaluator.put_fuzzer(FuzzerKind::Afl, &[1, 2]);
        evaluator.put_global(&[1, 2]);
        let probe = CoverageProbe::new(evaluator.clone(), vec![FuzzerKind::Afl]);
        let first = probe.try_snapshot().unwrap().unwrap();

        evaluator.put_fuzzer(FuzzerKind::Afl, &[1, 2, 3, 4]);
        evaluator.put_global(&[1, 2, 3, 4]);
        let second = probe.try_snapshot().unwrap().unwrap();

        assert!(second.global.bitmap.is_superset(&first.global.bitmap));
        assert!(second.global_edges() >= first.global_edges());
    }
}
