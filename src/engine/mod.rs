//! Engine host: owns the store, the scheduler loop, and the event bus, and
//! exposes the command/query facade consumed by front-ends.

mod events;
mod executor;
mod scheduler;

pub use events::{EngineEvent, EngineEventKind, EventBus, EventStream};
pub use executor::JobResult;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{Database, Job, JobFilter, JobPatch, NewJob, Run, RunFilter};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Point-in-time engine snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub is_running: bool,
    pub total_jobs: usize,
    pub enabled_jobs: usize,
    pub running_jobs: usize,
    pub uptime_seconds: u64,
}

struct EngineState {
    scheduler: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    started_at: Option<Instant>,
}

/// The long-running core. Construct once, share by reference; `start` and
/// `stop` are both idempotent.
pub struct Engine {
    config: Config,
    db: Arc<Database>,
    bus: EventBus,
    running: Arc<Mutex<HashSet<String>>>,
    slots: Arc<Semaphore>,
    state: Mutex<EngineState>,
}

impl Engine {
    /// Open the store and assemble the engine without starting it.
    pub fn new(config: Config) -> Result<Self> {
        let db = Arc::new(Database::open(&config.db_path)?);
        Ok(Self::with_database(config, db))
    }

    fn with_database(config: Config, db: Arc<Database>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            config,
            db,
            bus: EventBus::new(),
            running: Arc::new(Mutex::new(HashSet::new())),
            slots,
            state: Mutex::new(EngineState {
                scheduler: None,
                cancel: CancellationToken::new(),
                started_at: None,
            }),
        }
    }

    /// Start the scheduler. Priming (orphan reconciliation and schedule
    /// arming) completes before this returns. Calling start on a running
    /// engine is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.state.lock().scheduler.is_some() {
            return Ok(());
        }

        scheduler::prime(&self.db)?;

        let mut state = self.state.lock();
        if state.scheduler.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        state.cancel = cancel.clone();
        state.started_at = Some(Instant::now());
        self.bus.publish(EngineEvent::new(EngineEventKind::EngineStarted));

        let ctx = scheduler::SchedulerContext {
            db: self.db.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            cancel,
            running: self.running.clone(),
            slots: self.slots.clone(),
        };
        state.scheduler = Some(tokio::spawn(scheduler::run(ctx)));
        tracing::info!("Engine started");
        Ok(())
    }

    /// Stop the scheduler: cancel workers, drain, and tear down. `timeout`
    /// bounds the wait for the loop itself (the loop drains its workers
    /// within the configured shutdown timeout). Idempotent.
    pub async fn stop(&self, timeout: Duration) {
        let (handle, cancel) = {
            let mut state = self.state.lock();
            match state.scheduler.take() {
                Some(handle) => (handle, state.cancel.clone()),
                None => return,
            }
        };

        // A loop that hit a fatal store failure has already cancelled
        // itself and closed out the lifecycle events.
        if cancel.is_cancelled() {
            let _ = handle.await;
            self.state.lock().started_at = None;
            return;
        }

        self.bus.publish(EngineEvent::new(EngineEventKind::EngineStopping));
        cancel.cancel();

        if tokio::time::timeout(timeout, handle).await.is_err() {
            tracing::warn!("Scheduler did not stop within {}s", timeout.as_secs());
        }

        self.state.lock().started_at = None;
        self.bus.publish(EngineEvent::new(EngineEventKind::EngineStopped));
        tracing::info!("Engine stopped");
    }

    pub fn status(&self) -> Result<EngineStatus> {
        let (total_jobs, enabled_jobs) = self.db.job_counts()?;
        let state = self.state.lock();
        Ok(EngineStatus {
            is_running: state
                .scheduler
                .as_ref()
                .is_some_and(|handle| !handle.is_finished()),
            total_jobs,
            enabled_jobs,
            running_jobs: self.running.lock().len(),
            uptime_seconds: state
                .started_at
                .map_or(0, |started| started.elapsed().as_secs()),
        })
    }

    /// Read-only access to the store for external command handlers.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Register a subscriber. Events arrive in emission order; a slow
    /// subscriber never blocks the engine.
    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Execute a job immediately, outside its schedule, and wait for the
    /// completed run. `next_run` is left untouched.
    pub async fn trigger(&self, name: &str) -> Result<Run> {
        let cancel = self.state.lock().cancel.clone();
        scheduler::trigger(&self.db, &self.bus, &self.running, &cancel, name).await
    }

    // ── Catalog facade ────────────────────────────────────────────

    pub fn add_job(&self, new: NewJob) -> Result<Job> {
        let job = self.db.add_job(new)?;
        tracing::info!("Added job '{}' ({})", job.name, job.cron);
        Ok(job)
    }

    pub fn get_job(&self, name: &str) -> Result<Option<Job>> {
        self.db.get_job(name)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.db.list_jobs(filter)
    }

    pub fn update_job(&self, name: &str, patch: JobPatch) -> Result<Job> {
        self.db.update_job(name, patch)
    }

    pub fn enable_job(&self, name: &str) -> Result<Job> {
        self.db.update_job(
            name,
            JobPatch {
                enabled: Some(true),
                ..JobPatch::default()
            },
        )
    }

    pub fn disable_job(&self, name: &str) -> Result<Job> {
        self.db.update_job(
            name,
            JobPatch {
                enabled: Some(false),
                ..JobPatch::default()
            },
        )
    }

    pub fn delete_job(&self, name: &str, purge: bool) -> Result<()> {
        self.db.delete_job(name, purge)?;
        tracing::info!("Removed job '{name}'");
        Ok(())
    }

    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        self.db.list_runs(filter)
    }

    pub fn get_run(&self, id: i64) -> Result<Run> {
        self.db.get_run(id)?.ok_or(Error::RunNotFound(id))
    }

    pub fn last_run_for(&self, name: &str) -> Result<Option<Run>> {
        self.db.last_run_for(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Trigger;

    fn engine() -> Engine {
        let db = Arc::new(Database::open_in_memory().unwrap());
        Engine::with_database(Config::default(), db)
    }

    #[tokio::test]
    async fn status_tracks_catalog_and_lifecycle() {
        let engine = engine();
        engine.add_job(NewJob::new("one", "*/5 * * * *", "echo hi")).unwrap();

        let idle = engine.status().unwrap();
        assert!(!idle.is_running);
        assert_eq!(idle.total_jobs, 1);
        assert_eq!(idle.enabled_jobs, 1);
        assert_eq!(idle.running_jobs, 0);
        assert_eq!(idle.uptime_seconds, 0);

        engine.start().await.unwrap();
        assert!(engine.status().unwrap().is_running);

        engine.stop(Duration::from_secs(5)).await;
        assert!(!engine.status().unwrap().is_running);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let engine = engine();
        let mut events = engine.subscribe();

        engine.start().await.unwrap();
        engine.start().await.unwrap();
        engine.stop(Duration::from_secs(5)).await;
        engine.stop(Duration::from_secs(5)).await;

        let mut kinds = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), events.recv()).await
        {
            match event.kind {
                EngineEventKind::SchedulerTick => {}
                kind => kinds.push(kind),
            }
        }
        assert_eq!(
            kinds,
            vec![
                EngineEventKind::EngineStarted,
                EngineEventKind::EngineStopping,
                EngineEventKind::EngineStopped,
            ]
        );
    }

    #[tokio::test]
    async fn trigger_records_a_manual_run() {
        let engine = engine();
        engine
            .add_job(NewJob::new("manual", "0 3 * * *", "echo from-trigger"))
            .unwrap();

        let run = engine.trigger("manual").await.unwrap();
        assert_eq!(run.trigger, Trigger::Manual);
        assert!(run.success());
        assert!(run.stdout.contains("from-trigger"));

        let fetched = engine.get_run(run.id).unwrap();
        assert_eq!(fetched.id, run.id);
        assert_eq!(
            engine.last_run_for("manual").unwrap().unwrap().id,
            run.id
        );
    }

    #[tokio::test]
    async fn enable_disable_round_trip() {
        let engine = engine();
        engine.add_job(NewJob::new("toggle", "*/5 * * * *", "echo hi")).unwrap();

        let off = engine.disable_job("toggle").unwrap();
        assert!(!off.enabled);
        assert!(off.next_run.is_none());

        let on = engine.enable_job("toggle").unwrap();
        assert!(on.enabled);
        assert!(on.next_run.is_some());
    }

    #[tokio::test]
    async fn get_run_unknown_id_errors() {
        let engine = engine();
        assert!(matches!(engine.get_run(999), Err(Error::RunNotFound(999))));
    }
}
