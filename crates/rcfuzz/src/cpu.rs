use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::cgroup::CpuCgroup;
use crate::driver::{DriverRequest, FuzzerDriver};
use crate::error::Result;
use crate::fuzzers::FuzzerKind;

/// Keep-alive quota (in cores) for a paused fuzzer: not zero, so the
/// processes stay inspectable.
pub const PAUSED_SHARE: f64 = 0.01;

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

/// Sole writer of per-fuzzer CPU shares.
///
/// Combines the OS quota (cgroup) with the driver's pause/resume/scale
/// controls. Callers serialize per fuzzer by construction: only the
/// scheduler loop holds the controller mutably.
pub struct CpuController {
    jobs: f64,
    cgroup: CpuCgroup,
    driver: Arc<dyn FuzzerDriver>,
    shares: IndexMap<FuzzerKind, f64>,
    requests: IndexMap<FuzzerKind, DriverRequest>,
}

impl std::fmt::Debug for CpuController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuController")
            .field("jobs", &self.jobs)
            .field("shares", &self.shares)
            .finish_non_exhaustive()
    }
}

impl CpuController {
    pub fn new(jobs: f64, cgroup: CpuCgroup, driver: Arc<dyn FuzzerDriver>) -> Self {
        Self {
            jobs,
            cgroup,
            driver,
            shares: IndexMap::new(),
            requests: IndexMap::new(),
        }
    }

    /// Put a fuzzer under CPU control, starting at share 0.
    pub fn register(&mut self, request: DriverRequest) {
        self.shares.insert(request.fuzzer, 0.0);
        self.requests.insert(request.fuzzer, request);
    }

    pub fn share(&self, fuzzer: FuzzerKind) -> Option<f64> {
        self.shares.get(&fuzzer).copied()
    }

    pub fn jobs(&self) -> f64 {
        self.jobs
    }

    /// The canonical driver handle shared with the supervisor.
    pub fn driver(&self) -> Arc<dyn FuzzerDriver> {
        self.driver.clone()
    }

    /// Assign `cpu ∈ [0, jobs]` cores to `fuzzer`.
    ///
    /// Idempotent within float tolerance. Dropping to 0 pauses the fuzzer and
    /// leaves it a keep-alive quota; leaving 0 resumes it. A positive share
    /// also rescales the fuzzer's worker count to `⌈cpu⌉`.
    pub fn set_share(&mut self, fuzzer: FuzzerKind, cpu: f64) -> Result<()> {
        let Some(current) = self.shares.get(&fuzzer).copied() else {
            return Ok(());
        };
        if approx_eq(current, cpu) {
            return Ok(());
        }
        debug!(fuzzer = %fuzzer, current, cpu, "updating cpu share");
        let request = &self.requests[&fuzzer];
        let pausing = approx_eq(cpu, 0.0);
        if pausing {
            self.driver.pause(request)?;
        } else if approx_eq(current, 0.0) {
            self.driver.resume(request)?;
        }
        self.shares[&fuzzer] = cpu;
        if pausing {
            self.cgroup.set_quota(fuzzer, PAUSED_SHARE)?;
        } else {
            self.cgroup.set_quota(fuzzer, cpu)?;
            let workers = (cpu.ceil() as u32).max(1);
            self.driver.scale(request, workers)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::testutil::RecordingDriver;

    fn request(fuzzer: FuzzerKind) -> DriverRequest {
        DriverRequest {
            fuzzer,
            seed_dir: None,
            output_dir: PathBuf::from("/tmp/out"),
            program: "demo".to_owned(),
            args: "@@".to_owned(),
            jobs: 1,
            cgroup_path: PathBuf::from("/tmp/cgroup"),
        }
    }

    fn controller(driver: Arc<RecordingDriver>, root: PathBuf) -> CpuController {
        let cgroup = CpuCgroup::with_root(root);
        cgroup.init(&[FuzzerKind::Afl], 1.0).unwrap();
        let mut cpu = CpuController::new(1.0, cgroup, driver);
        cpu.register(request(FuzzerKind::Afl));
        cpu
    }

    #[test]
    fn share_transitions_drive_pause_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(RecordingDriver::default());
        let mut cpu = controller(driver.clone(), dir.path().to_path_buf());

        cpu.set_share(FuzzerKind::Afl, 1.0).unwrap();
        cpu.set_share(FuzzerKind::Afl, 0.0).unwrap();
        cpu.set_share(FuzzerKind::Afl, 0.5).unwrap();

        assert_eq!(
            driver.calls(),
            vec![
                "resume afl",
                "scale afl 1",
                "pause afl",
                "resume afl",
                "scale afl 1",
            ]
        );
    }

    #[test]
    fn repeated_share_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(RecordingDriver::default());
        let mut cpu = controller(driver.clone(), dir.path().to_path_buf());

        cpu.set_share(FuzzerKind::Afl, 0.75).unwrap();
        let after_first = driver.calls().len();
        cpu.set_share(FuzzerKind::Afl, 0.75).unwrap();
        assert_eq!(driver.calls().len(), after_first);
    }

    #[test]
    fn unknown_fuzzer_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(RecordingDriver::default());
        let mut cpu = controller(driver.clone(), dir.path().to_path_buf());

        cpu.set_share(FuzzerKind::Qsym, 1.0).unwrap();
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn fractional_share_scales_up_to_one_worker() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(RecordingDriver::default());
        let mut cpu = controller(driver.clone(), dir.path().to_path_buf());

        cpu.set_share(FuzzerKind::Afl, 0.3).unwrap();
        assert!(driver.calls().contains(&"scale afl 1".to_owned()));
    }
}
