use std::path::PathBuf;
use std::process::{Command, Stdio};

use derive_new::new as New;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fuzzers::FuzzerKind;

/// Everything the external driver needs to address one fuzzer instance.
#[derive(Debug, Clone, Serialize)]
pub struct DriverRequest {
    pub fuzzer: FuzzerKind,
    pub seed_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// The instrumented target binary.
    pub program: String,
    /// Target argument line (`@@` is the input-file placeholder).
    pub args: String,
    pub jobs: u32,
    /// CPU cgroup the fuzzer's processes are confined to.
    pub cgroup_path: PathBuf,
}

/// Launching, stopping and resizing individual fuzzers is delegated to an
/// external per-fuzzer driver. One entry point per command; `stop` must be
/// idempotent. Readiness is signalled out-of-band via the fuzzer's `ready`
/// file.
pub trait FuzzerDriver: Send + Sync {
    fn start(&self, request: &DriverRequest) -> Result<()>;

    fn stop(&self, request: &DriverRequest) -> Result<()>;

    fn pause(&self, request: &DriverRequest) -> Result<()>;

    fn resume(&self, request: &DriverRequest) -> Result<()>;

    /// Set the fuzzer's worker count to `workers` (≥ 1).
    fn scale(&self, request: &DriverRequest, workers: u32) -> Result<()>;
}

/// Production driver: executes the configured driver binary with one
/// subcommand per trait entry point.
#[derive(Debug, New)]
pub struct CommandDriver {
    binary: PathBuf,
}

impl CommandDriver {
    fn run(&self, action: &'static str, request: &DriverRequest, extra: &[String]) -> Result<()> {
        debug!(fuzzer = %request.fuzzer, action, "dispatching driver command");
        let mut command = Command::new(&self.binary);
        command
            .arg(action)
            .arg("--fuzzer")
            .arg(request.fuzzer.to_string())
            .arg("--output")
            .arg(&request.output_dir)
            .arg("--program")
            .arg(&request.program)
            .arg("--argument")
            .arg(&request.args)
            .arg("--thread")
            .arg(request.jobs.to_string())
            .arg("--cgroup")
            .arg(&request.cgroup_path);
        if let Some(seed_dir) = &request.seed_dir {
            command.arg("--seed").arg(seed_dir);
        }
        command.args(extra);

        let output = command
            .stdin(Stdio::null())
            .output()
            .map_err(|err| Error::Driver {
                fuzzer: request.fuzzer,
                action,
                message: err.to_string(),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Driver {
                fuzzer: request.fuzzer,
                action,
                message: format!("exit status {}: {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

impl FuzzerDriver for CommandDriver {
    fn start(&self, request: &DriverRequest) -> Result<()> {
        self.run("start", request, &[])
    }

    fn stop(&self, request: &DriverRequest) -> Result<()> {
        self.run("stop", request, &[])
    }

    fn pause(&self, request: &DriverRequest) -> Result<()> {
        self.run("pause", request, &[])
    }

    fn resume(&self, request: &DriverRequest) -> Result<()> {
        self.run("resume", request, &[])
    }

    fn scale(&self, request: &DriverRequest, workers: u32) -> Result<()> {
        self.run(
            "scale",
            request,
            &["--scale-num".to_owned(), workers.to_string()],
        )
    }
}
