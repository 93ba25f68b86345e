use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use flate2::Compression;
use flate2::write::GzEncoder;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, error, info, warn};

use crate::bandit::BanditArm;
use crate::cgroup::CpuCgroup;
use crate::config::{COVERAGE_UPDATE_TIME, Config, Settings, TargetConfig};
use crate::context::{CancelToken, SHUTDOWN_GRACE, SchedulerContext, Timing, unix_time};
use crate::coverage::CoverageProbe;
use crate::cpu::CpuController;
use crate::driver::{CommandDriver, DriverRequest, FuzzerDriver};
use crate::error::{Error, Result};
use crate::evaluator::{EvalDir, Evaluator};
use crate::fuzzers::FuzzerKind;
use crate::runlog::{RunLog, SnapshotSummary};
use crate::scheduler::Scheduler;
use crate::sync::QueueSync;

/// How long a fuzzer may take to create its readiness file.
const READY_TIMEOUT: Duration = Duration::from_secs(180);
const READY_POLL: Duration = Duration::from_secs(2);

/// How long to wait for the evaluator to finish the initial seed corpus.
const SEED_WAIT_LIMIT: Duration = Duration::from_secs(600);

const FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Run the whole supervised lifecycle:
/// INIT → WARMUP → (scheduler) → DRAIN → EXIT.
///
/// Every fuzzer started during warmup is stopped on exit on all paths,
/// including panics, via the teardown guard.
pub fn run(settings: Settings, config: Config) -> Result<()> {
    let target = config.target_config(&settings.target);

    if settings.output.exists() {
        return Err(Error::FatalStartup(format!(
            "output directory {} already exists, remove it first",
            settings.output.display()
        )));
    }
    fs::create_dir_all(&settings.output)?;

    let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
    fs::write(settings.output.join("cmdline"), format!("{cmdline}\n"))?;
    let health_path = settings.output.join("health");
    touch(&health_path)?;

    let cancel = Arc::new(CancelToken::new(
        Duration::from_secs(settings.timeout_secs) + SHUTDOWN_GRACE,
    ));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            info!("termination signal received");
            cancel.interrupt();
        })
        .map_err(|err| Error::FatalStartup(format!("installing signal handler: {err}")))?;
    }

    let cgroup = CpuCgroup::discover()?;
    let jobs = f64::from(settings.jobs);
    cgroup.init(&settings.fuzzers, jobs)?;

    let driver: Arc<dyn FuzzerDriver> = Arc::new(CommandDriver::new(config.driver.clone()));
    let evaluator: Arc<dyn Evaluator> = Arc::new(EvalDir::new(settings.output.join("eval")));
    let probe = CoverageProbe::new(evaluator.clone(), settings.fuzzers.clone());

    let mut cpu = CpuController::new(jobs, cgroup.clone(), driver.clone());
    let requests: Vec<DriverRequest> = settings
        .fuzzers
        .iter()
        .map(|fuzzer| driver_request(&settings, &target, &cgroup, *fuzzer))
        .collect();
    for request in &requests {
        cpu.register(request.clone());
    }

    let arms = settings
        .fuzzers
        .iter()
        .map(|fuzzer| {
            (
                *fuzzer,
                BanditArm::new(f64::from(settings.threshold), settings.diff),
            )
        })
        .collect();

    let datetime = Local::now().format("%Y-%m-%d-%H-%M-%S").to_string();
    let log = Arc::new(RunLog::new(
        settings
            .output
            .join(format!("{}_{datetime}.json", settings.target)),
        cmdline,
        serde_json::to_value(&settings)?,
        serde_json::to_value(&config)?,
        unix_time(),
    ));

    let scheduler = Scheduler::for_settings(&settings);
    log.set_algorithm(scheduler.algorithm());
    info!(algorithm = %scheduler.algorithm(), fuzzers = ?settings.fuzzers, "supervisor initialized");

    let rng = match settings.random_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let mut ctx = SchedulerContext {
        settings,
        target,
        timing: Timing::default(),
        cancel: cancel.clone(),
        evaluator: evaluator.clone(),
        sync: Arc::new(QueueSync),
        probe: probe.clone(),
        cpu,
        arms,
        log: log.clone(),
        rng,
    };

    let started = Arc::new(Mutex::new(Vec::new()));
    let guard = TeardownGuard::new(driver.clone(), started.clone());

    let outcome = supervise(
        &mut ctx,
        &scheduler,
        &requests,
        &started,
        probe,
        health_path,
    );

    // EXIT: finalize the log, stop every fuzzer, then optionally archive.
    log.set_end_time(unix_time());
    if let Err(err) = log.write() {
        warn!(%err, "writing final run log failed");
    }
    guard.stop_all();

    if cancel.failed() {
        return Err(Error::EvaluatorDown("health check failed".to_owned()));
    }
    let clean = match &outcome {
        Ok(()) => true,
        Err(err) => err.exit_code() == 0,
    };
    if clean && ctx.settings.tar {
        save_tar(&ctx.settings.output, &ctx.settings.target, &datetime);
    }
    outcome
}

fn supervise(
    ctx: &mut SchedulerContext,
    scheduler: &Scheduler,
    requests: &[DriverRequest],
    started: &Arc<Mutex<Vec<DriverRequest>>>,
    probe: CoverageProbe,
    health_path: PathBuf,
) -> Result<()> {
    warmup(ctx, requests, started)?;
    wait_seed_evaluation(&ctx.evaluator, &ctx.cancel);

    // Background tasks are read-only against scheduler state and end with
    // the cancel token, so their handles can be dropped.
    drop(spawn_log_flusher(ctx.log.clone(), ctx.cancel.clone()));
    drop(spawn_snapshot_logger(
        probe,
        ctx.log.clone(),
        ctx.cancel.clone(),
        snapshot_cadence(&ctx.settings),
    ));
    drop(spawn_health_check(
        ctx.evaluator.clone(),
        health_path,
        ctx.cancel.clone(),
    ));

    scheduler.run(ctx)?;

    if !ctx.cancel.failed() {
        touch(&ctx.settings.output.join("finish"))?;
        info!("drain: waiting for final coverage");
        while !ctx.is_end() {
            ctx.cancel
                .sleep(Duration::from_secs(COVERAGE_UPDATE_TIME));
        }
    }
    Ok(())
}

/// Start every fuzzer, wait for its readiness file, then pause it until the
/// scheduler hands out CPU. A fuzzer that is not ready within the limit
/// aborts the run.
fn warmup(
    ctx: &SchedulerContext,
    requests: &[DriverRequest],
    started: &Arc<Mutex<Vec<DriverRequest>>>,
) -> Result<()> {
    let driver = ctx.cpu.driver();
    for request in requests {
        let fuzzer = request.fuzzer;
        prepare_output_dir(ctx, fuzzer)?;
        info!(fuzzer = %fuzzer, "warming up");
        // Recorded in the teardown set before readiness: a fuzzer that hangs
        // half-started still must be stopped.
        driver.start(request)?;
        started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let ready = request.output_dir.join("ready");
        let begin = Instant::now();
        while !ready.exists() {
            if begin.elapsed() >= READY_TIMEOUT {
                return Err(Error::FatalStartup(format!(
                    "{fuzzer} produced no readiness file within {}s",
                    READY_TIMEOUT.as_secs()
                )));
            }
            if ctx.cancel.is_end() {
                return Err(Error::Interrupted);
            }
            debug!(fuzzer = %fuzzer, "waiting for readiness");
            ctx.cancel.sleep_granular(READY_POLL, READY_POLL);
        }
        if ctx.settings.focus_one.is_none() {
            driver.pause(request)?;
        }
    }
    Ok(())
}

fn prepare_output_dir(ctx: &SchedulerContext, fuzzer: FuzzerKind) -> Result<()> {
    let fuzzer_dir = ctx
        .settings
        .output
        .join(&ctx.settings.target)
        .join(fuzzer.to_string());
    if fuzzer.profile().create_output_dir {
        fs::create_dir_all(&fuzzer_dir)?;
    } else {
        // The fuzzer insists on creating its own directory.
        if fuzzer_dir.exists() {
            return Err(Error::FatalStartup(format!(
                "remove {} first",
                fuzzer_dir.display()
            )));
        }
        fs::create_dir_all(ctx.settings.output.join(&ctx.settings.target))?;
    }
    Ok(())
}

fn wait_seed_evaluation(evaluator: &Arc<dyn Evaluator>, cancel: &CancelToken) {
    let begin = Instant::now();
    while !evaluator.seed_finished() {
        if cancel.is_end() || begin.elapsed() >= SEED_WAIT_LIMIT {
            warn!("seed evaluation did not finish, continuing anyway");
            return;
        }
        debug!("waiting for seed evaluation");
        cancel.sleep_granular(Duration::from_secs(10), Duration::from_secs(10));
    }
    info!("seed evaluation finished");
}

fn driver_request(
    settings: &Settings,
    target: &TargetConfig,
    cgroup: &CpuCgroup,
    fuzzer: FuzzerKind,
) -> DriverRequest {
    let seed_dir = if settings.empty_seed {
        None
    } else {
        settings.input.clone().or_else(|| target.seed.clone())
    };
    DriverRequest {
        fuzzer,
        seed_dir,
        output_dir: settings
            .output
            .join(&settings.target)
            .join(fuzzer.to_string()),
        program: target.fuzz_target.clone(),
        args: target.args_for(fuzzer).to_owned(),
        jobs: settings.jobs,
        cgroup_path: cgroup.fuzzer_path(fuzzer),
    }
}

/// Snapshot-logging cadence: the densest interval that still tracks every
/// phase boundary.
fn snapshot_cadence(settings: &Settings) -> Duration {
    let secs = 60u64
        .min(settings.explore_time)
        .min(settings.sync_time)
        .min(settings.exploit_time)
        .max(1);
    Duration::from_secs(secs)
}

fn spawn_log_flusher(log: Arc<RunLog>, cancel: Arc<CancelToken>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !cancel.is_end() {
            if let Err(err) = log.write() {
                warn!(%err, "flushing run log failed");
            }
            cancel.sleep(FLUSH_INTERVAL);
        }
    })
}

fn spawn_snapshot_logger(
    probe: CoverageProbe,
    log: Arc<RunLog>,
    cancel: Arc<CancelToken>,
    cadence: Duration,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !cancel.is_end() {
            match probe.try_snapshot() {
                Ok(Some(info)) => log.append_snapshot(SnapshotSummary::from(&info)),
                Ok(None) => {}
                Err(err) => warn!(%err, "snapshot logging failed"),
            }
            cancel.sleep(cadence);
        }
    })
}

fn spawn_health_check(
    evaluator: Arc<dyn Evaluator>,
    health_path: PathBuf,
    cancel: Arc<CancelToken>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !cancel.is_end() {
            cancel.sleep(HEALTH_INTERVAL);
            if cancel.is_end() {
                return;
            }
            if !evaluator.is_alive() {
                error!("evaluator health check failed");
                cancel.fail();
                return;
            }
            if let Err(err) = touch(&health_path) {
                warn!(%err, "touching health file failed");
            }
        }
    })
}

/// Stops every started fuzzer exactly once, also on panic unwinds.
struct TeardownGuard {
    driver: Arc<dyn FuzzerDriver>,
    started: Arc<Mutex<Vec<DriverRequest>>>,
    done: AtomicBool,
}

impl TeardownGuard {
    fn new(driver: Arc<dyn FuzzerDriver>, started: Arc<Mutex<Vec<DriverRequest>>>) -> Self {
        Self {
            driver,
            started,
            done: AtomicBool::new(false),
        }
    }

    fn stop_all(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        for request in started.iter() {
            info!(fuzzer = %request.fuzzer, "stopping");
            if let Err(err) = self.driver.stop(request) {
                warn!(%err, fuzzer = %request.fuzzer, "stop failed");
            }
        }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn touch(path: &Path) -> Result<()> {
    fs::write(path, b"")?;
    Ok(())
}

/// Pack the fuzzer and eval directories into tarballs and drop the source
/// trees, reclaiming disk on long campaigns.
fn save_tar(output: &Path, target: &str, datetime: &str) {
    let fuzzer_dir = output.join(target);
    if fuzzer_dir.is_dir()
        && let Err(err) = archive_dir(&fuzzer_dir, &output.join(format!("{target}.tar.gz")), target)
    {
        warn!(%err, "archiving fuzzer output failed");
    }
    let eval_dir = output.join("eval");
    if eval_dir.is_dir()
        && let Err(err) = archive_dir(
            &eval_dir,
            &output.join(format!("{target}_{datetime}.tar.gz")),
            "eval",
        )
    {
        warn!(%err, "archiving eval output failed");
    }
}

fn archive_dir(src: &Path, dst: &Path, prefix: &str) -> Result<()> {
    info!(src = %src.display(), dst = %dst.display(), "archiving");
    let file = File::create(dst)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(prefix, src)?;
    builder.into_inner()?.finish()?;
    fs::remove_dir_all(src)?;
    Ok(())
}

#[cfg(test)]
mod tests {
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

    #[test]
    fn teardown_stops_each_started_fuzzer_once() {
        let driver = Arc::new(RecordingDriver::default());
        let started = Arc::new(Mutex::new(vec![
            request(FuzzerKind::Afl),
            request(FuzzerKind::Mopt),
        ]));
        let guard = TeardownGuard::new(driver.clone(), started);

        guard.stop_all();
        guard.stop_all();
        drop(guard);

        assert_eq!(driver.calls(), vec!["stop afl", "stop mopt"]);
    }

    #[test]
    fn archive_replaces_directory_with_tarball() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("demo");
        fs::create_dir_all(src.join("afl/queue")).unwrap();
        fs::write(src.join("afl/queue/id:000000"), b"seed").unwrap();
        let dst = dir.path().join("demo.tar.gz");

        archive_dir(&src, &dst, "demo").unwrap();

        assert!(dst.is_file());
        assert!(!src.exists());
        assert!(fs::metadata(&dst).unwrap().len() > 0);
    }

    #[test]
    fn snapshot_cadence_follows_smallest_phase() {
        let settings = Settings {
            output: PathBuf::from("/tmp/out"),
            input: None,
            target: "demo".to_owned(),
            fuzzers: vec![FuzzerKind::Afl],
            explore_time: 600,
            exploit_time: 600,
            sync_time: 30,
            timeout_secs: 3600,
            empty_seed: false,
            crash_mode: crate::config::CrashMode::Ip,
            focus_one: None,
            threshold: 10,
            diff: 1.0,
            tar: false,
            jobs: 1,
            random_seed: None,
        };
        assert_eq!(snapshot_cadence(&settings), Duration::from_secs(30));
    }
}
