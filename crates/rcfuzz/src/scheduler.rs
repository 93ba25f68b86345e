use indexmap::IndexMap;
use tracing::{debug, info};

use crate::bandit;
use crate::config::Settings;
use crate::context::SchedulerContext;
use crate::coverage::FuzzerInfo;
use crate::error::{Error, Result};
use crate::fuzzers::FuzzerKind;
use crate::policy::{self, CpuAssignment};
use crate::runlog::{RoundSummary, SnapshotSummary};

/// Consecutive unproductive sub-slices before a focus block is aborted.
pub const MAX_CONSECUTIVE_FAILS: u32 = 5;

/// The scheduling algorithm driving the cohort.
///
/// `Focus` runs a single fuzzer with the whole budget and no adaptive logic;
/// `RcFuzz` is the two-phase explore/exploit bandit.
#[derive(Debug, Clone)]
pub enum Scheduler {
    Focus(FuzzerKind),
    RcFuzz {
        explore_time: u64,
        exploit_time: u64,
        threshold: f64,
    },
}

impl Scheduler {
    pub fn for_settings(settings: &Settings) -> Self {
        match settings.focus_one {
            Some(fuzzer) => Scheduler::Focus(fuzzer),
            None => Scheduler::RcFuzz {
                explore_time: settings.explore_time,
                exploit_time: settings.exploit_time,
                threshold: f64::from(settings.threshold),
            },
        }
    }

    /// Name recorded in the run log.
    pub fn algorithm(&self) -> String {
        match self {
            Scheduler::Focus(fuzzer) => fuzzer.to_string(),
            Scheduler::RcFuzz { .. } => "rcfuzz".to_owned(),
        }
    }

    /// Drive the cohort until the global deadline. Returns early (without
    /// error) on interruption; structural failures propagate.
    pub fn run(&self, ctx: &mut SchedulerContext) -> Result<()> {
        match *self {
            Scheduler::Focus(fuzzer) => run_focus(ctx, fuzzer),
            Scheduler::RcFuzz {
                explore_time,
                exploit_time,
                threshold,
            } => run_rcfuzz(ctx, explore_time, exploit_time, threshold),
        }
    }
}

/// A required snapshot, with interruption folded into `None` so the calling
/// loop can unwind cleanly into the drain phase.
fn snapshot_or_end(ctx: &SchedulerContext) -> Result<Option<FuzzerInfo>> {
    match ctx.require_snapshot() {
        Ok(info) => Ok(Some(info)),
        Err(Error::Interrupted) => Ok(None),
        Err(err) => Err(err),
    }
}

fn run_focus(ctx: &mut SchedulerContext, focus: FuzzerKind) -> Result<()> {
    let jobs = ctx.cpu.jobs();
    let mut round = 1u32;
    while !ctx.is_end() {
        let Some(before) = snapshot_or_end(ctx)? else {
            return Ok(());
        };
        ctx.run_one(focus, jobs)?;
        ctx.sleep_secs(ctx.timing.focus_granule);
        let Some(info) = snapshot_or_end(ctx)? else {
            return Ok(());
        };
        let find_new = info.global_edges() > before.global_edges();
        ctx.log.append_round(RoundSummary {
            round,
            picked: vec![focus],
            cpu_assign: IndexMap::from([(focus, jobs)]),
            find_new,
            fuzzer_info: SnapshotSummary::from(&info),
        });
        round += 1;
    }
    Ok(())
}

fn run_rcfuzz(
    ctx: &mut SchedulerContext,
    explore_time: u64,
    exploit_time: u64,
    threshold: f64,
) -> Result<()> {
    if ctx.is_end() {
        return Ok(());
    }
    info!("explore phase start");
    explore(ctx, explore_time, threshold)?;
    info!("explore phase end");

    let mut picked_times: IndexMap<FuzzerKind, u32> =
        ctx.settings.fuzzers.iter().map(|f| (*f, 0)).collect();
    let explore_set = ctx.settings.fuzzers.len();
    let mut round = 1u32;
    while !ctx.is_end() {
        info!(round, "exploit round start");
        exploit(ctx, exploit_time, explore_set, round, &mut picked_times)?;
        info!(round, "exploit round end");
        round += 1;
    }
    Ok(())
}

/// One-shot round-robin probing. Every fuzzer gets exclusive CPU for one
/// slice per sub-round; productivity deltas against the previous global
/// bitmap feed the bandit arms.
fn explore(ctx: &mut SchedulerContext, explore_time: u64, threshold: f64) -> Result<()> {
    let fuzzers = ctx.settings.fuzzers.clone();
    ctx.do_sync(&fuzzers)?;
    let Some(mut previous) = snapshot_or_end(ctx)? else {
        return Ok(());
    };
    for arm in ctx.arms.values_mut() {
        arm.reset_threshold(threshold);
    }
    let jobs = ctx.cpu.jobs();
    let mut remain = explore_time as f64;
    let mut sub_round = 1u32;
    while remain > 0.0 && !ctx.is_end() {
        let slice = remain.min(ctx.timing.explore_granule);
        for fuzzer in &fuzzers {
            if ctx.is_end() {
                return Ok(());
            }
            ctx.run_one(*fuzzer, jobs)?;
            ctx.sleep_secs(slice);
        }
        let Some(current) = snapshot_or_end(ctx)? else {
            return Ok(());
        };
        for fuzzer in &fuzzers {
            let delta = current.per_fuzzer[fuzzer]
                .bitmap
                .diff(&previous.global.bitmap)
                .count();
            let arm = &mut ctx.arms[fuzzer];
            let success = delta as f64 > arm.threshold();
            arm.record(success);
            debug!(
                sub_round,
                fuzzer = %fuzzer,
                delta,
                success,
                successes = arm.successes(),
                failures = arm.failures(),
                threshold = arm.threshold(),
                "explore sub-round result"
            );
        }
        remain -= slice;
        previous = current;
        sub_round += 1;
        ctx.do_sync(&fuzzers)?;
    }
    Ok(())
}

/// One exploit round: sync, snapshot, Thompson-select, apportion CPU by
/// contribution, run the picked fuzzers focused, then account the round.
fn exploit(
    ctx: &mut SchedulerContext,
    exploit_time: u64,
    explore_set: usize,
    round: u32,
    picked_times: &mut IndexMap<FuzzerKind, u32>,
) -> Result<()> {
    let fuzzers = ctx.settings.fuzzers.clone();
    ctx.do_sync(&fuzzers)?;
    let Some(before) = snapshot_or_end(ctx)? else {
        return Ok(());
    };

    let selected = bandit::select_fuzzers(&ctx.arms, &mut ctx.rng);
    debug!(?selected, "thompson selection");
    let jobs = ctx.cpu.jobs();
    let assignment = policy::calculate_cpu(&selected, &before, jobs, exploit_time as f64);
    if assignment.picked.is_empty() {
        debug!("no fuzzer met the minimum focus budget, idling one slice");
        ctx.sleep_secs(ctx.timing.exploit_granule);
        return Ok(());
    }
    for fuzzer in &assignment.picked {
        picked_times[fuzzer] += 1;
        debug!(fuzzer = %fuzzer, times = picked_times[fuzzer], "picked");
    }
    info!(
        round,
        picked = ?assignment.picked,
        shares = ?assignment.shares,
        "exploit allocation"
    );

    focus_run(ctx, &assignment, exploit_time, explore_set)?;

    ctx.do_sync(&fuzzers)?;
    let Some(after) = snapshot_or_end(ctx)? else {
        return Ok(());
    };
    let find_new = after.global_edges() > before.global_edges();
    info!(
        round,
        find_new,
        before = before.global_edges(),
        after = after.global_edges(),
        "exploit round result"
    );
    ctx.log.append_round(RoundSummary {
        round,
        picked: assignment.picked.clone(),
        cpu_assign: assignment.shares.clone(),
        find_new,
        fuzzer_info: SnapshotSummary::from(&after),
    });
    Ok(())
}

/// Run each picked fuzzer focused, in descending-share order, in sub-slices.
/// A slice succeeds when the fuzzer's own bitmap outgrew its threshold or it
/// found a new unique bug; five consecutive failures abort the block.
fn focus_run(
    ctx: &mut SchedulerContext,
    assignment: &CpuAssignment,
    exploit_time: u64,
    explore_set: usize,
) -> Result<()> {
    let jobs = ctx.cpu.jobs();
    // Budget follows the explored cohort size, not the picked subset.
    let focus_total = exploit_time as f64 * explore_set as f64;
    let Some(mut last) = snapshot_or_end(ctx)? else {
        return Ok(());
    };
    for fuzzer in &assignment.picked {
        let share = assignment.shares[fuzzer];
        let budget = focus_total * share / jobs;
        info!(fuzzer = %fuzzer, share, budget, "focus block start");
        let mut remain = budget;
        let mut strikes = 0u32;
        let mut prev_edges = last.per_fuzzer[fuzzer].bitmap.count();
        let mut prev_bugs = last.per_fuzzer[fuzzer].unique_bugs.total;
        while remain > 0.0 {
            if ctx.is_end() {
                return Ok(());
            }
            let slice = remain.min(ctx.timing.exploit_granule);
            ctx.run_one(*fuzzer, share)?;
            ctx.sleep_secs(slice);
            ctx.arms[fuzzer].add_runtime(slice);

            let Some(current) = snapshot_or_end(ctx)? else {
                return Ok(());
            };
            let edges = current.per_fuzzer[fuzzer].bitmap.count();
            let bugs = current.per_fuzzer[fuzzer].unique_bugs.total;
            let arm = &mut ctx.arms[fuzzer];
            let new_edges = edges.saturating_sub(prev_edges);
            let success = new_edges as f64 > arm.threshold() || bugs > prev_bugs;
            arm.record(success);
            if success {
                strikes = 0;
            } else {
                strikes += 1;
            }
            debug!(
                fuzzer = %fuzzer,
                new_edges,
                bugs,
                success,
                strikes,
                threshold = arm.threshold(),
                remain,
                "focus sub-slice"
            );
            remain -= slice;
            prev_edges = edges;
            prev_bugs = bugs;
            last = current;
            if strikes >= MAX_CONSECUTIVE_FAILS {
                info!(fuzzer = %fuzzer, "early abort, no progress");
                break;
            }
        }
        // Let the others pick up whatever the focused fuzzer found.
        ctx.do_sync(&assignment.picked)?;
    }
    Ok(())
}
