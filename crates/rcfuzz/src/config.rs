use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use derive_more::Display;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::fuzzers::FuzzerKind;

pub const DEFAULT_EXPLORE_TIME: u64 = 600;
pub const DEFAULT_EXPLOIT_TIME: u64 = 600;
pub const DEFAULT_SYNC_TIME: u64 = 300;
pub const DEFAULT_THRESHOLD: u32 = 10;

/// Cadence at which the evaluator refreshes coverage, and therefore the
/// densest useful snapshot-logging interval.
pub const COVERAGE_UPDATE_TIME: u64 = 30;

/// Crash deduplication mode applied by the evaluator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lower")]
pub enum CrashMode {
    #[display("trace")]
    Trace,
    #[display("ip")]
    Ip,
}

/// Deployment configuration, overridable from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// External fuzzer-driver binary; resolved via `PATH` when relative.
    pub driver: PathBuf,
    /// Per-target settings keyed by target name.
    pub targets: IndexMap<String, TargetConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: PathBuf::from("rcfuzz-driver"),
            targets: IndexMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                info!(path = %path.display(), "loading config");
                let config = serde_json::from_reader(BufReader::new(File::open(path)?))?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Settings for `target`, falling back to a bare default entry for
    /// targets the config file does not mention.
    pub fn target_config(&self, target: &str) -> TargetConfig {
        self.targets
            .get(target)
            .cloned()
            .unwrap_or_else(|| TargetConfig::bare(target))
    }
}

/// How to fuzz one target program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// The instrumented binary handed to the fuzzers.
    pub fuzz_target: String,
    /// Default seed corpus, overridable with `--input`.
    #[serde(default)]
    pub seed: Option<PathBuf>,
    /// Target argument lines keyed by fuzzer name, with a `default` entry.
    #[serde(default)]
    pub args: IndexMap<String, String>,
    /// Fuzzers that cannot run this target.
    #[serde(default)]
    pub unsupported: Vec<FuzzerKind>,
}

impl TargetConfig {
    fn bare(target: &str) -> Self {
        Self {
            fuzz_target: target.to_owned(),
            seed: None,
            args: IndexMap::new(),
            unsupported: Vec::new(),
        }
    }

    pub fn args_for(&self, fuzzer: FuzzerKind) -> &str {
        self.args
            .get(&fuzzer.to_string())
            .or_else(|| self.args.get("default"))
            .map(String::as_str)
            .unwrap_or("@@")
    }
}

/// The resolved invocation: CLI arguments after fuzzer-set expansion and
/// config merging. Owned by the supervisor for the whole run.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub output: PathBuf,
    pub input: Option<PathBuf>,
    pub target: String,
    pub fuzzers: Vec<FuzzerKind>,
    pub explore_time: u64,
    pub exploit_time: u64,
    pub sync_time: u64,
    pub timeout_secs: u64,
    pub empty_seed: bool,
    pub crash_mode: CrashMode,
    pub focus_one: Option<FuzzerKind>,
    pub threshold: u32,
    pub diff: f64,
    pub tar: bool,
    pub jobs: u32,
    pub random_seed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_fall_back_to_default_entry() {
        let mut args = IndexMap::new();
        args.insert("default".to_owned(), "@@ -x".to_owned());
        args.insert("libfuzzer".to_owned(), "-runs=0".to_owned());
        let target = TargetConfig {
            fuzz_target: "demo".to_owned(),
            seed: None,
            args,
            unsupported: Vec::new(),
        };
        assert_eq!(target.args_for(FuzzerKind::LibFuzzer), "-runs=0");
        assert_eq!(target.args_for(FuzzerKind::Afl), "@@ -x");
    }

    #[test]
    fn unknown_target_gets_bare_entry() {
        let config = Config::default();
        let target = config.target_config("objdump");
        assert_eq!(target.fuzz_target, "objdump");
        assert_eq!(target.args_for(FuzzerKind::Afl), "@@");
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "driver": "/usr/local/bin/rcfuzz-driver",
                "targets": {
                    "exiv2": {
                        "fuzz_target": "exiv2",
                        "args": { "default": "@@" },
                        "unsupported": ["angora"]
                    }
                }
            })
            .to_string(),
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        let target = config.target_config("exiv2");
        assert_eq!(target.unsupported, vec![FuzzerKind::Angora]);
    }
}
