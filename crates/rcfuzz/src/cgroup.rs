use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::fuzzers::FuzzerKind;

/// Smallest quota the kernel accepts.
pub const MIN_QUOTA_US: u64 = 1000;

/// Kernel default CFS period, used when the hierarchy does not expose one.
const DEFAULT_PERIOD_US: u64 = 100_000;

/// The supervisor's slice of the cgroup-v1 CPU hierarchy.
///
/// The `rcfuzz` group itself is created out-of-band (the deployment's init
/// script) with delegation to the supervisor's user; one child group per
/// fuzzer lives underneath it.
#[derive(Debug, Clone)]
pub struct CpuCgroup {
    root: PathBuf,
}

impl CpuCgroup {
    /// Locate the `rcfuzz` group under the calling process's CPU hierarchy.
    pub fn discover() -> Result<Self> {
        let content = fs::read_to_string("/proc/self/cgroup")?;
        let cgroup_path = parse_cpu_cgroup(&content).ok_or_else(|| {
            Error::FatalStartup("no cpu controller found in /proc/self/cgroup".to_owned())
        })?;
        let root = Path::new("/sys/fs/cgroup/cpu")
            .join(cgroup_path.trim_start_matches('/'))
            .join("rcfuzz");
        if !root.is_dir() {
            return Err(Error::FatalStartup(format!(
                "cgroup {} does not exist; run the init script first",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Use an explicit hierarchy root instead of discovering one.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create the per-fuzzer child groups and hand each the full budget.
    pub fn init(&self, fuzzers: &[FuzzerKind], jobs: f64) -> Result<()> {
        for fuzzer in fuzzers {
            fs::create_dir_all(self.fuzzer_path(*fuzzer))?;
            self.set_quota(*fuzzer, jobs)?;
        }
        Ok(())
    }

    pub fn fuzzer_path(&self, fuzzer: FuzzerKind) -> PathBuf {
        self.root.join(fuzzer.to_string())
    }

    /// Set the fuzzer's CFS quota to `cpus` cores, clamped to the kernel
    /// minimum.
    pub fn set_quota(&self, fuzzer: FuzzerKind, cpus: f64) -> Result<()> {
        let period = self.period_us(fuzzer)?;
        let quota = ((period as f64 * cpus) as u64).max(MIN_QUOTA_US);
        debug!(fuzzer = %fuzzer, cpus, quota, "setting cpu quota");
        fs::write(
            self.fuzzer_path(fuzzer).join("cpu.cfs_quota_us"),
            quota.to_string(),
        )?;
        Ok(())
    }

    fn period_us(&self, fuzzer: FuzzerKind) -> Result<u64> {
        let path = self.fuzzer_path(fuzzer).join("cpu.cfs_period_us");
        if !path.is_file() {
            return Ok(DEFAULT_PERIOD_US);
        }
        let content = fs::read_to_string(&path)?;
        content.trim().parse().map_err(|err| {
            Error::FatalStartup(format!("malformed {}: {err}", path.display()))
        })
    }
}

fn parse_cpu_cgroup(proc_cgroup: &str) -> Option<&str> {
    // /proc/self/cgroup lines are `hierarchy-id:controllers:path`; the cpu
    // controller may share a hierarchy (e.g. `cpu,cpuacct`).
    proc_cgroup.lines().find_map(|line| {
        let mut fields = line.splitn(3, ':');
        let _id = fields.next()?;
        let controllers = fields.next()?;
        let path = fields.next()?;
        controllers
            .split(',')
            .any(|controller| controller == "cpu")
            .then_some(path)
    })
}
