use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use crate::coverage::FuzzerInfo;
use crate::error::Result;
use crate::evaluator::{LineCoverage, UniqueBugs};
use crate::fuzzers::FuzzerKind;

/// A snapshot compressed for logging: bitmaps reduced to their population
/// counts so a day-long run does not hold thousands of full edge maps.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub coverage: IndexMap<FuzzerKind, LineCoverage>,
    pub unique_bugs: IndexMap<FuzzerKind, UniqueBugs>,
    pub bitmap: IndexMap<FuzzerKind, usize>,
    pub global_coverage: LineCoverage,
    pub global_unique_bugs: UniqueBugs,
    pub global_bitmap: usize,
    pub timestamp: f64,
}

impl From<&FuzzerInfo> for SnapshotSummary {
    fn from(info: &FuzzerInfo) -> Self {
        Self {
            coverage: info
                .per_fuzzer
                .iter()
                .map(|(fuzzer, per)| (*fuzzer, per.coverage))
                .collect(),
            unique_bugs: info
                .per_fuzzer
                .iter()
                .map(|(fuzzer, per)| (*fuzzer, per.unique_bugs))
                .collect(),
            bitmap: info
                .per_fuzzer
                .iter()
                .map(|(fuzzer, per)| (*fuzzer, per.bitmap.count()))
                .collect(),
            global_coverage: info.global.coverage,
            global_unique_bugs: info.global.unique_bugs,
            global_bitmap: info.global.bitmap.count(),
            timestamp: info.timestamp,
        }
    }
}

/// One exploit (or focus) round as recorded in the run log.
#[derive(Debug, Clone, Serialize)]
pub struct RoundSummary {
    pub round: u32,
    pub picked: Vec<FuzzerKind>,
    pub cpu_assign: IndexMap<FuzzerKind, f64>,
    pub find_new: bool,
    pub fuzzer_info: SnapshotSummary,
}

#[derive(Debug, Serialize)]
struct RunLogInner {
    cmd: String,
    args: serde_json::Value,
    config: serde_json::Value,
    start_time: f64,
    end_time: Option<f64>,
    algorithm: Option<String>,
    log: Vec<SnapshotSummary>,
    round: Vec<RoundSummary>,
}

/// Append-only run log, flushed to `<output>/<target>_<datetime>.json`.
///
/// The scheduler appends; the log-flush background thread serializes. All
/// entries are monotonically timestamped because appends happen from the
/// single scheduler thread.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    inner: Mutex<RunLogInner>,
}

impl RunLog {
    pub fn new(
        path: PathBuf,
        cmd: String,
        args: serde_json::Value,
        config: serde_json::Value,
        start_time: f64,
    ) -> Self {
        Self {
            path,
            inner: Mutex::new(RunLogInner {
                cmd,
                args,
                config,
                start_time,
                end_time: None,
                algorithm: None,
                log: Vec::new(),
                round: Vec::new(),
            }),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_algorithm(&self, algorithm: String) {
        self.lock().algorithm = Some(algorithm);
    }

    pub fn append_snapshot(&self, snapshot: SnapshotSummary) {
        self.lock().log.push(snapshot);
    }

    pub fn append_round(&self, round: RoundSummary) {
        self.lock().round.push(round);
    }

    pub fn set_end_time(&self, end_time: f64) {
        self.lock().end_time = Some(end_time);
    }

    /// Serialize the whole log. Holding the lock across the file write keeps
    /// concurrent flushes from interleaving.
    pub fn write(&self) -> Result<()> {
        let inner = self.lock();
        let file = File::create(&self.path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &*inner)?;
        writer.flush()?;
        debug!(path = %self.path.display(), "run log written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log(path: PathBuf) -> RunLog {
        RunLog::new(
            path,
            "rcfuzz --output out".to_owned(),
            serde_json::json!({ "target": "demo" }),
            serde_json::json!({}),
            1000.0,
        )
    }

    fn summary() -> SnapshotSummary {
        SnapshotSummary {
            coverage: IndexMap::new(),
            unique_bugs: IndexMap::new(),
            bitmap: IndexMap::from([(FuzzerKind::Afl, 42usize)]),
            global_coverage: LineCoverage::default(),
            global_unique_bugs: UniqueBugs::default(),
            global_bitmap: 42,
            timestamp: 1001.0,
        }
    }

    #[test]
    fn written_log_has_expected_shape() {
        let dir = tempfile::tempdir().unwrap();
        let log = sample_log(dir.path().join("demo.json"));
        log.set_algorithm("rcfuzz".to_owned());
        log.append_snapshot(summary());
        log.append_round(RoundSummary {
            round: 1,
            picked: vec![FuzzerKind::Afl],
            cpu_assign: IndexMap::from([(FuzzerKind::Afl, 1.0)]),
            find_new: true,
            fuzzer_info: summary(),
        });
        log.set_end_time(2000.0);
        log.write().unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(log.path()).unwrap()).unwrap();
        assert_eq!(value["algorithm"], "rcfuzz");
        assert_eq!(value["start_time"], 1000.0);
        assert_eq!(value["end_time"], 2000.0);
        assert_eq!(value["round"].as_array().unwrap().len(), 1);
        assert_eq!(value["round"][0]["picked"][0], "afl");
        assert_eq!(value["log"][0]["bitmap"]["afl"], 42);
    }

    #[test]
    fn rewrites_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = sample_log(dir.path().join("demo.json"));
        log.write().unwrap();
        log.append_snapshot(summary());
        log.write().unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(log.path()).unwrap()).unwrap();
        assert_eq!(value["log"].as_array().unwrap().len(), 1);
    }
}
