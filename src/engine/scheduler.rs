//! The scheduler loop: scan due jobs, dispatch workers, re-arm schedules.

use crate::config::Config;
use crate::cron::CronExpr;
use crate::engine::events::{EngineEvent, EngineEventKind, EventBus};
use crate::engine::executor::{self, JobResult};
use crate::error::{Error, Result};
use crate::store::{Database, Job, Run, RunOutcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Floor on the adaptive sleep so an overlapped due job cannot spin the
/// loop.
const MIN_SLEEP: Duration = Duration::from_secs(1);

/// Consecutive due-scan failures tolerated before the store is declared
/// unavailable and the engine tears itself down.
const MAX_STORE_FAILURES: u32 = 3;

/// How often the retention sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Everything a scheduler run needs, handed down by the host at start.
/// The scheduler publishes through the bus and never reaches back into
/// the host.
pub(crate) struct SchedulerContext {
    pub db: Arc<Database>,
    pub bus: EventBus,
    pub config: Config,
    pub cancel: CancellationToken,
    /// Names of jobs with a live run; guards per-job overlap.
    pub running: Arc<Mutex<HashSet<String>>>,
    /// Bounded worker pool.
    pub slots: Arc<Semaphore>,
}

/// Startup priming: close orphaned runs, then arm every enabled job that
/// has no `next_run` yet. Runs before the first tick.
pub(crate) fn prime(db: &Database) -> Result<()> {
    let reconciled = db.reconcile_orphans()?;
    if reconciled > 0 {
        tracing::info!("Reconciled {reconciled} runs interrupted by shutdown");
    }

    let now = Utc::now();
    for job in db.list_jobs(&crate::store::JobFilter {
        enabled_only: true,
        ..Default::default()
    })? {
        if job.next_run.is_some() {
            continue;
        }
        let next = CronExpr::parse(&job.cron)?.next_after(now);
        db.set_next_run(&job.name, next)?;
        match next {
            Some(next) => tracing::debug!("Armed '{}' for {next}", job.name),
            None => tracing::warn!("'{}' has no future firing time", job.name),
        }
    }
    Ok(())
}

/// The loop proper. Ticks until the cancel token fires, then drains live
/// workers within the configured shutdown timeout.
pub(crate) async fn run(ctx: SchedulerContext) {
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut last_sweep: Option<Instant> = None;
    let mut store_failures = 0u32;
    let mut store_lost = false;

    loop {
        match tick(&ctx, &mut workers, &mut last_sweep) {
            Ok(()) => store_failures = 0,
            Err(e) => {
                store_failures += 1;
                if store_failures >= MAX_STORE_FAILURES {
                    tracing::error!("Store unavailable, stopping engine: {e}");
                    ctx.bus.publish(
                        EngineEvent::new(EngineEventKind::EngineStopping)
                            .with_detail(format!("store unavailable: {e}")),
                    );
                    // Interrupt workers before draining; the host never
                    // gets to run its stop sequence on this path.
                    ctx.cancel.cancel();
                    store_lost = true;
                    break;
                }
                tracing::warn!("Scheduler scan failed ({store_failures}/{MAX_STORE_FAILURES}): {e}");
            }
        }

        // Reap finished workers without blocking the loop.
        while workers.try_join_next().is_some() {}

        let sleep_for = next_wake(&ctx.db, ctx.config.check_interval);
        tokio::select! {
            () = ctx.cancel.cancelled() => break,
            () = tokio::time::sleep(sleep_for) => {}
        }
    }

    drain(&ctx, workers).await;

    if store_lost {
        ctx.bus.publish(EngineEvent::new(EngineEventKind::EngineStopped));
    }
}

/// One wake: scan due jobs in deterministic order and dispatch each.
/// An `Err` means the due scan itself failed and the store may be gone.
fn tick(
    ctx: &SchedulerContext,
    workers: &mut JoinSet<()>,
    last_sweep: &mut Option<Instant>,
) -> Result<()> {
    let now = Utc::now();
    let due = ctx.db.due_jobs(now)?;

    ctx.bus.publish(
        EngineEvent::new(EngineEventKind::SchedulerTick).with_detail(format!("{} due", due.len())),
    );

    for job in due {
        dispatch(ctx, workers, job, now);
    }

    if last_sweep.is_none_or(|at| at.elapsed() >= SWEEP_INTERVAL) {
        *last_sweep = Some(Instant::now());
        match ctx.db.purge_runs_older_than(ctx.config.run_retention_days) {
            Ok(0) => {}
            Ok(removed) => tracing::info!("Retention sweep removed {removed} runs"),
            Err(e) => tracing::warn!("Retention sweep failed: {e}"),
        }
    }

    Ok(())
}

/// Atomically advance the job and open its run, then hand the execution to
/// a pooled worker. Per-job errors are logged and never abort the loop.
fn dispatch(ctx: &SchedulerContext, workers: &mut JoinSet<()>, job: Job, now: DateTime<Utc>) {
    {
        let mut running = ctx.running.lock();
        if running.contains(&job.name) {
            ctx.bus.publish(
                EngineEvent::for_job(EngineEventKind::JobSkipped, &job.name)
                    .with_detail("already running"),
            );
            return;
        }
        running.insert(job.name.clone());
    }

    // Re-arm from now, not from the missed instant: one catch-up per wake,
    // never a storm after the machine slept.
    let next_run = match CronExpr::parse(&job.cron) {
        Ok(expr) => expr.next_after(now),
        Err(e) => {
            // The stored expression was validated at write time; treat a
            // corrupt one as never firing rather than wedging the job.
            tracing::warn!("Stored cron for '{}' no longer parses: {e}", job.name);
            None
        }
    };

    let run_id = match ctx.db.dispatch_scheduled(&job.name, now, next_run) {
        Ok(run_id) => run_id,
        Err(e) => {
            tracing::warn!("Dispatch of '{}' failed: {e}", job.name);
            ctx.running.lock().remove(&job.name);
            return;
        }
    };

    ctx.bus.publish(EngineEvent::for_run(
        EngineEventKind::JobStarted,
        &job.name,
        run_id,
    ));

    let db = ctx.db.clone();
    let bus = ctx.bus.clone();
    let cancel = ctx.cancel.clone();
    let running = ctx.running.clone();
    let slots = ctx.slots.clone();
    workers.spawn(async move {
        // The pool bounds concurrency, not admission: the run record
        // already exists and waits for a slot here.
        let Ok(_permit) = slots.acquire_owned().await else {
            running.lock().remove(&job.name);
            return;
        };
        let result = executor::execute(
            &job.command,
            job.working_dir.as_deref().map(Path::new),
            Duration::from_secs(u64::from(job.timeout_seconds)),
            &cancel,
        )
        .await;
        finish_run(&db, &bus, &job.name, run_id, &result);
        running.lock().remove(&job.name);
    });
}

/// Close the run and emit its terminal event. The store write is retried
/// once; a run left open after that is reconciled at the next start.
fn finish_run(db: &Database, bus: &EventBus, name: &str, run_id: i64, result: &JobResult) {
    let outcome = RunOutcome {
        ended_at: Utc::now(),
        exit_code: Some(result.exit_code),
        stdout: result.stdout.clone(),
        stderr: result.stderr.clone(),
        timed_out: result.timed_out,
    };

    if let Err(e) = db.complete_run(run_id, &outcome) {
        tracing::warn!("Recording run {run_id} of '{name}' failed, retrying: {e}");
        if let Err(e) = db.complete_run(run_id, &outcome) {
            tracing::error!("Run {run_id} of '{name}' left open for reconciliation: {e}");
        }
    }

    let kind = if result.timed_out {
        EngineEventKind::JobTimedOut
    } else if result.success {
        EngineEventKind::JobCompleted
    } else {
        EngineEventKind::JobFailed
    };
    let mut event = EngineEvent::for_run(kind, name, run_id);
    if kind == EngineEventKind::JobFailed {
        event = event.with_detail(format!("exit code {}", result.exit_code));
    }
    bus.publish(event);
}

/// Sleep until the earlier of the wake period and the earliest armed
/// `next_run`, floored so due-but-running jobs cannot busy-loop the tick.
fn next_wake(db: &Database, check_interval: Duration) -> Duration {
    let until_next = match db.earliest_next_run() {
        Ok(Some(next)) => (next - Utc::now()).to_std().unwrap_or(Duration::ZERO),
        Ok(None) => check_interval,
        Err(e) => {
            tracing::warn!("Reading earliest schedule failed: {e}");
            check_interval
        }
    };
    until_next.min(check_interval).max(MIN_SLEEP)
}

/// Stop accepting work and wait for live workers, bounded by the shutdown
/// timeout. Workers observe the cancel token inside their next await.
async fn drain(ctx: &SchedulerContext, mut workers: JoinSet<()>) {
    let live = workers.len();
    if live > 0 {
        tracing::info!("Draining {live} live workers");
    }
    let deadline = ctx.config.shutdown_timeout;
    let drained = tokio::time::timeout(deadline, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            "{} workers still live after {}s drain; their runs will be reconciled on next start",
            workers.len(),
            deadline.as_secs()
        );
        workers.abort_all();
    }
}

/// Manual trigger: bypass the due check, run to completion, record the run
/// with a `manual` marker, and leave the normal schedule undisturbed.
pub(crate) async fn trigger(
    db: &Arc<Database>,
    bus: &EventBus,
    running: &Arc<Mutex<HashSet<String>>>,
    cancel: &CancellationToken,
    name: &str,
) -> Result<Run> {
    let job = db
        .get_job(name)?
        .ok_or_else(|| Error::NotFound(name.to_string()))?;

    {
        let mut live = running.lock();
        if live.contains(name) {
            bus.publish(
                EngineEvent::for_job(EngineEventKind::JobSkipped, name)
                    .with_detail("already running"),
            );
            return Err(Error::AlreadyRunning(name.to_string()));
        }
        live.insert(name.to_string());
    }

    let now = Utc::now();
    let run_id = match db.dispatch_manual(name, now) {
        Ok(run_id) => run_id,
        Err(e) => {
            running.lock().remove(name);
            return Err(e);
        }
    };
    bus.publish(EngineEvent::for_run(
        EngineEventKind::JobStarted,
        name,
        run_id,
    ));

    let result = executor::execute(
        &job.command,
        job.working_dir.as_deref().map(Path::new),
        Duration::from_secs(u64::from(job.timeout_seconds)),
        cancel,
    )
    .await;
    finish_run(db, bus, name, run_id, &result);
    running.lock().remove(name);

    db.get_run(run_id)?.ok_or(Error::RunNotFound(run_id))
}
