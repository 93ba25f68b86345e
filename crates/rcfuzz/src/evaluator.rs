use std::fs::{self, File};
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;

use derive_new::new as New;
use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::error::Result;
use crate::fuzzers::FuzzerKind;

/// A heartbeat older than this means the evaluator service is dead.
pub const HEARTBEAT_STALE: Duration = Duration::from_secs(180);

/// Line coverage as reported by the evaluator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LineCoverage {
    pub line: u64,
    #[serde(default)]
    pub line_coverage: f64,
}

/// Deduplicated crash counts under the evaluator's dedup modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueBugs {
    #[serde(rename = "unique_bugs_ip")]
    pub ip: u64,
    #[serde(rename = "unique_bugs_trace")]
    pub trace: u64,
    #[serde(rename = "unique_bugs_trace3")]
    pub trace3: u64,
    /// The count under the configured dedup mode; what scheduling decisions
    /// consume.
    #[serde(rename = "unique_bugs")]
    pub total: u64,
}

/// One evaluator report, either for a single fuzzer or for the aggregate.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub coverage: LineCoverage,
    pub unique_bugs: UniqueBugs,
    pub bitmap: Bitmap,
}

/// The coverage evaluator service, polled by the probe.
///
/// Polls are idempotent and side-effect-free; `None` means the subject has
/// not produced any coverage yet (fresh start).
pub trait Evaluator: Send + Sync {
    fn poll_fuzzer(&self, fuzzer: FuzzerKind) -> Result<Option<Evaluation>>;

    fn poll_global(&self) -> Result<Option<Evaluation>>;

    fn is_alive(&self) -> bool;

    /// Whether the evaluator finished evaluating the initial seed corpus.
    fn seed_finished(&self) -> bool;

    /// Nudge the evaluator to pick up seeds moved by a corpus sync.
    fn request_resync(&self) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct EvalReport {
    coverage: LineCoverage,
    unique_bugs: UniqueBugs,
}

/// Production evaluator client: polls the report directory the evaluator
/// service maintains under `<output>/eval`.
///
/// Layout per subject (`<fuzzer>` or `global`): `report.json` with coverage
/// and bug counts, plus a raw `bitmap` edge map. Service liveness is a
/// `heartbeat` file the service touches; `seed-finished` marks the end of
/// seed evaluation.
#[derive(Debug, New)]
pub struct EvalDir {
    root: PathBuf,
}

impl EvalDir {
    fn load(&self, subject: &str) -> Result<Option<Evaluation>> {
        let dir = self.root.join(subject);
        let report_path = dir.join("report.json");
        let bitmap_path = dir.join("bitmap");
        if !report_path.is_file() || !bitmap_path.is_file() {
            return Ok(None);
        }
        let report: EvalReport = serde_json::from_reader(BufReader::new(File::open(report_path)?))?;
        let raw = fs::read(bitmap_path)?;
        Ok(Some(Evaluation {
            coverage: report.coverage,
            unique_bugs: report.unique_bugs,
            bitmap: Bitmap::from_raw(&raw)?,
        }))
    }
}

impl Evaluator for EvalDir {
    fn poll_fuzzer(&self, fuzzer: FuzzerKind) -> Result<Option<Evaluation>> {
        self.load(&fuzzer.to_string())
    }

    fn poll_global(&self) -> Result<Option<Evaluation>> {
        self.load("global")
    }

    fn is_alive(&self) -> bool {
        let heartbeat = self.root.join("heartbeat");
        match fs::metadata(&heartbeat).and_then(|meta| meta.modified()) {
            Ok(modified) => match modified.elapsed() {
                Ok(age) => age <= HEARTBEAT_STALE,
                // Heartbeat from the future: clock skew, not death.
                Err(_) => true,
            },
            // The service creates its directory and heartbeat first thing;
            // until the directory exists it is starting, not dead.
            Err(_) => !self.root.exists(),
        }
    }

    fn seed_finished(&self) -> bool {
        self.root.join("seed-finished").is_file()
    }

    fn request_resync(&self) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        fs::write(self.root.join("sync"), b"")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::bitmap::EDGE_MAP_SIZE;

    fn write_subject(root: &std::path::Path, subject: &str, edges: &[usize], bugs: u64) {
        let dir = root.join(subject);
        fs::create_dir_all(&dir).unwrap();
        let report = serde_json::json!({
            "coverage": { "line": 123, "line_coverage": 0.5 },
            "unique_bugs": {
                "unique_bugs_ip": bugs,
                "unique_bugs_trace": bugs,
                "unique_bugs_trace3": bugs,
                "unique_bugs": bugs,
            },
        });
        fs::write(dir.join("report.json"), report.to_string()).unwrap();
        let mut raw = vec![0u8; EDGE_MAP_SIZE];
        for edge in edges {
            raw[*edge] = 1;
        }
        fs::write(dir.join("bitmap"), raw).unwrap();
    }

    #[test]
    fn poll_returns_none_before_first_report() {
        let dir = tempfile::tempdir().unwrap();
        let eval = EvalDir::new(dir.path().to_path_buf());
        assert!(eval.poll_fuzzer(FuzzerKind::Afl).unwrap().is_none());
        assert!(eval.poll_global().unwrap().is_none());
    }

    #[test]
    fn poll_reads_report_and_bitmap() {
        let dir = tempfile::tempdir().unwrap();
        write_subject(dir.path(), "afl", &[1, 2, 3], 2);
        let eval = EvalDir::new(dir.path().to_path_buf());
        let evaluation = eval.poll_fuzzer(FuzzerKind::Afl).unwrap().unwrap();
        assert_eq!(evaluation.coverage.line, 123);
        assert_eq!(evaluation.unique_bugs.total, 2);
        assert_eq!(evaluation.bitmap.count(), 3);
    }

    #[test]
    fn liveness_follows_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let eval = EvalDir::new(dir.path().to_path_buf());
        assert!(!eval.is_alive());
        fs::write(dir.path().join("heartbeat"), b"").unwrap();
        assert!(eval.is_alive());
    }

    #[test]
    fn service_not_yet_started_counts_as_alive() {
        let dir = tempfile::tempdir().unwrap();
        let eval = EvalDir::new(dir.path().join("eval"));
        assert!(eval.is_alive());
        // No directory to nudge either.
        eval.request_resync().unwrap();
        assert!(!dir.path().join("eval").exists());
    }

    #[test]
    fn resync_touches_marker() {
        let dir = tempfile::tempdir().unwrap();
        let eval = EvalDir::new(dir.path().to_path_buf());
        eval.request_resync().unwrap();
        assert!(dir.path().join("sync").is_file());
    }
}
