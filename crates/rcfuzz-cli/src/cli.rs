use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use rcfuzz::config::{
    Config, CrashMode, DEFAULT_EXPLOIT_TIME, DEFAULT_EXPLORE_TIME, DEFAULT_SYNC_TIME,
    DEFAULT_THRESHOLD, Settings, TargetConfig,
};
use rcfuzz::error::Error;
use rcfuzz::fuzzers::FuzzerKind;
use rcfuzz::supervisor;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Adaptive scheduler for a cohort of coverage-guided fuzzers.
#[derive(Debug, clap::Parser)]
#[command(name = "rcfuzz", version, about, styles = clap::builder::Styles::styled())]
pub struct Cli {
    #[clap(flatten)]
    global_options: GlobalOptions,

    /// An output directory (must not already exist).
    #[clap(long, short)]
    output: PathBuf,

    /// Optional input (seed) directory.
    #[clap(long, short)]
    input: Option<PathBuf>,

    /// Baseline fuzzers to include, or `all`.
    #[clap(long, short, required = true, num_args = 1.., value_parser = parse_fuzzer_choice)]
    fuzzer: Vec<FuzzerChoice>,

    /// Target program to fuzz.
    #[clap(long, short)]
    target: String,

    /// Explore phase time in seconds.
    #[clap(long, default_value_t = DEFAULT_EXPLORE_TIME)]
    explore: u64,

    /// Exploit round time in seconds.
    #[clap(long, default_value_t = DEFAULT_EXPLOIT_TIME)]
    exploit: u64,

    /// Seed sync interval in seconds.
    #[clap(long, default_value_t = DEFAULT_SYNC_TIME)]
    sync: u64,

    /// Total fuzzing budget, e.g. `24h` or `90m`.
    #[clap(long, short = 'T', default_value = "24h", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Start from an empty seed instead of the target's corpus.
    #[clap(long)]
    empty_seed: bool,

    /// Method to deduplicate bugs.
    #[clap(long, value_enum, default_value_t = CrashMode::Ip)]
    crash_mode: CrashMode,

    /// Run a single fuzzer without adaptive scheduling.
    #[clap(long, value_enum)]
    focus_one: Option<FuzzerKind>,

    /// Initial coverage-delta threshold (theta).
    #[clap(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: u32,

    /// Static per-fuzzer difficulty weight.
    #[clap(long, default_value_t = 1.0)]
    diff: f64,

    /// Archive fuzzer and eval directories on exit.
    #[clap(long)]
    tar: bool,

    /// Total CPU budget to distribute over the cohort.
    #[clap(long, short, default_value_t = 1)]
    jobs: u32,

    /// JSON config overriding the built-in defaults.
    #[clap(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, clap::Parser)]
struct GlobalOptions {
    #[clap(long, default_value = "info")]
    default_log_level: LevelFilter,

    #[clap(long)]
    random_seed: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
enum FuzzerChoice {
    All,
    Kind(FuzzerKind),
}

fn parse_fuzzer_choice(input: &str) -> Result<FuzzerChoice, String> {
    if input.eq_ignore_ascii_case("all") {
        return Ok(FuzzerChoice::All);
    }
    <FuzzerKind as clap::ValueEnum>::from_str(input, true).map(FuzzerChoice::Kind)
}

impl Cli {
    pub fn run(self) -> ExitCode {
        if let Err(err) = setup_logger(&self.global_options) {
            eprintln!("failed to initialize logging: {err:#}");
            return ExitCode::FAILURE;
        }
        match self.execute() {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) if err.exit_code() == 0 => {
                info!("interrupted, shut down cleanly");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("{err}");
                ExitCode::FAILURE
            }
        }
    }

    fn execute(self) -> rcfuzz::Result<()> {
        let config = Config::load(self.config.as_deref())?;
        let target = config.target_config(&self.target);
        let fuzzers = resolve_fuzzers(&self.fuzzer, self.focus_one, &target)?;

        let cores = num_cpus::get();
        if self.jobs as usize > cores {
            warn!(jobs = self.jobs, cores, "jobs exceed available cores");
        }

        let settings = Settings {
            output: self.output,
            input: self.input,
            target: self.target,
            fuzzers,
            explore_time: self.explore,
            exploit_time: self.exploit,
            sync_time: self.sync,
            timeout_secs: self.timeout.as_secs(),
            empty_seed: self.empty_seed,
            crash_mode: self.crash_mode,
            focus_one: self.focus_one,
            threshold: self.threshold,
            diff: self.diff,
            tar: self.tar,
            jobs: self.jobs,
            random_seed: self.global_options.random_seed,
        };
        info!(
            target = %settings.target,
            fuzzers = ?settings.fuzzers,
            timeout_secs = settings.timeout_secs,
            "starting rcfuzz"
        );
        supervisor::run(settings, config)
    }
}

fn resolve_fuzzers(
    choices: &[FuzzerChoice],
    focus_one: Option<FuzzerKind>,
    target: &TargetConfig,
) -> rcfuzz::Result<Vec<FuzzerKind>> {
    if let Some(focus) = focus_one {
        return Ok(vec![focus]);
    }
    let mut fuzzers = Vec::new();
    for choice in choices {
        match choice {
            FuzzerChoice::All => {
                for fuzzer in FuzzerKind::ALL {
                    if !target.unsupported.contains(&fuzzer) && !fuzzers.contains(&fuzzer) {
                        fuzzers.push(fuzzer);
                    }
                }
            }
            FuzzerChoice::Kind(fuzzer) => {
                if target.unsupported.contains(fuzzer) {
                    return Err(Error::FatalStartup(format!(
                        "{fuzzer} does not support target {}",
                        target.fuzz_target
                    )));
                }
                if !fuzzers.contains(fuzzer) {
                    fuzzers.push(*fuzzer);
                }
            }
        }
    }
    if fuzzers.is_empty() {
        return Err(Error::FatalStartup("no fuzzers selected".to_owned()));
    }
    Ok(fuzzers)
}

fn setup_logger(global_opts: &GlobalOptions) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_owned())))
        .with(
            EnvFilter::builder()
                .with_default_directive(global_opts.default_log_level.into())
                .from_env()
                .context("Constructing log filter from env.")?,
        )
        .init();

    Ok(())
}
