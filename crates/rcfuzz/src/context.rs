use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use rand::rngs::StdRng;

use crate::bandit::BanditArm;
use crate::config::{Settings, TargetConfig};
use crate::coverage::{CoverageProbe, FuzzerInfo};
use crate::cpu::CpuController;
use crate::error::Result;
use crate::evaluator::Evaluator;
use crate::fuzzers::FuzzerKind;
use crate::runlog::RunLog;
use crate::sync::SyncService;

/// Upper bound on one uninterruptible sleep; cancellation latency.
pub const SLEEP_GRANULARITY: Duration = Duration::from_secs(60);

/// Extra wall-clock past the fuzzing budget for final coverage to settle.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(300);

pub fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Cooperative cancellation: a hard wall-clock deadline plus interrupt and
/// fatal-abort flags. Every loop and every sleep checks it.
#[derive(Debug)]
pub struct CancelToken {
    deadline: Instant,
    interrupted: AtomicBool,
    failed: AtomicBool,
}

impl CancelToken {
    /// A token that ends `budget` from now.
    pub fn new(budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
            interrupted: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn is_end(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
            || self.failed.load(Ordering::Relaxed)
            || Instant::now() >= self.deadline
    }

    /// SIGINT/SIGTERM path: drain and exit cleanly.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    /// Fatal-abort path (e.g. evaluator death): skip the drain, exit 1.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Sleep up to `duration`, returning early once the run is over.
    pub fn sleep(&self, duration: Duration) {
        self.sleep_granular(duration, SLEEP_GRANULARITY);
    }

    /// Sleep in `granule`-sized slices, re-checking the deadline between
    /// slices. Cancellation latency is therefore at most one granule.
    pub fn sleep_granular(&self, duration: Duration, granule: Duration) {
        let mut remain = duration;
        while !remain.is_zero() {
            if self.is_end() {
                return;
            }
            let slice = remain.min(granule);
            thread::sleep(slice);
            remain -= slice;
        }
    }
}

/// Sub-slice durations of the scheduling loops. Tests shrink these; the
/// defaults match the deployed cadence.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Explore sub-round slice.
    pub explore_granule: f64,
    /// Exploit focus sub-slice.
    pub exploit_granule: f64,
    /// Focus-one round length.
    pub focus_granule: f64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            explore_granule: 30.0,
            exploit_granule: 60.0,
            focus_granule: 300.0,
        }
    }
}

/// Everything the scheduling loops touch, owned by the supervisor and passed
/// down by mutable reference.
pub struct SchedulerContext {
    pub settings: Settings,
    pub target: TargetConfig,
    pub timing: Timing,
    pub cancel: Arc<CancelToken>,
    pub evaluator: Arc<dyn Evaluator>,
    pub sync: Arc<dyn SyncService>,
    pub probe: CoverageProbe,
    pub cpu: CpuController,
    pub arms: IndexMap<FuzzerKind, BanditArm>,
    pub log: Arc<RunLog>,
    pub rng: StdRng,
}

impl std::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("settings", &self.settings)
            .field("arms", &self.arms)
            .finish_non_exhaustive()
    }
}

impl SchedulerContext {
    pub fn is_end(&self) -> bool {
        self.cancel.is_end()
    }

    pub fn sleep_secs(&self, seconds: f64) {
        self.cancel.sleep(Duration::from_secs_f64(seconds.max(0.0)));
    }

    /// Give `focus` the given share and everyone else zero.
    pub fn run_one(&mut self, focus: FuzzerKind, share: f64) -> Result<()> {
        let fuzzers = self.settings.fuzzers.clone();
        for fuzzer in fuzzers {
            let cpu = if fuzzer == focus { share } else { 0.0 };
            self.cpu.set_share(fuzzer, cpu)?;
        }
        Ok(())
    }

    /// Cross-pollinate corpora among `fuzzers`, then nudge the evaluator.
    /// Skipped (returning `false`) while any fuzzer has no coverage yet.
    pub fn do_sync(&self, fuzzers: &[FuzzerKind]) -> Result<bool> {
        if self.probe.try_snapshot()?.is_none() {
            return Ok(false);
        }
        self.sync
            .sync(&self.settings.target, fuzzers, &self.settings.output)?;
        self.evaluator.request_resync()?;
        Ok(true)
    }

    pub fn require_snapshot(&self) -> Result<FuzzerInfo> {
        self.probe.require_snapshot(&self.cancel)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn deadline_ends_token() {
        let token = CancelToken::new(Duration::from_millis(10));
        assert!(!token.is_end());
        thread::sleep(Duration::from_millis(20));
        assert!(token.is_end());
    }

    #[test]
    fn sleep_returns_within_one_granule_of_cancellation() {
        let token = Arc::new(CancelToken::new(Duration::from_secs(3600)));
        let sleeper = token.clone();
        let handle = thread::spawn(move || {
            let begin = Instant::now();
            sleeper.sleep_granular(Duration::from_secs(30), Duration::from_millis(20));
            begin.elapsed()
        });
        thread::sleep(Duration::from_millis(50));
        token.interrupt();
        let slept = handle.join().unwrap();
        // One in-flight granule plus the signal delay.
        assert!(slept < Duration::from_millis(500), "slept {slept:?}");
    }

    #[test]
    fn fatal_abort_ends_token() {
        let token = CancelToken::new(Duration::from_secs(3600));
        assert!(!token.is_end());
        token.fail();
        assert!(token.is_end());
        assert!(token.failed());
        assert!(!token.interrupted());
    }
}
