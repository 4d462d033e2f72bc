//! Single-file embedded persistence for jobs and their run history.
//!
//! `Database` is the only component that touches the SQLite file. The
//! connection sits behind a mutex, every mutation runs inside a transaction,
//! and the file is opened in WAL mode, so concurrent observers see either
//! the pre- or post-state of a writer, never a partial state.

mod records;

pub use records::{Job, JobFilter, JobPatch, NewJob, Run, RunFilter, RunOutcome, Trigger};

use crate::cron::CronExpr;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// Cap on each captured stream persisted with a run.
const MAX_CAPTURE_BYTES: usize = 16 * 1024;
const TRUNCATED_MARKER: &str = "\n...[truncated]";

/// Text written onto runs closed by shutdown reconciliation and onto runs
/// whose worker was cancelled mid-flight.
pub const INTERRUPTED_STDERR: &str = "Interrupted by shutdown";

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS jobs (
    id              INTEGER PRIMARY KEY,
    name            TEXT UNIQUE NOT NULL,
    cron            TEXT NOT NULL,
    command         TEXT NOT NULL,
    working_dir     TEXT,
    timeout_seconds INTEGER NOT NULL,
    tags            TEXT,
    enabled         INTEGER NOT NULL,
    created_at      TEXT,
    updated_at      TEXT,
    last_run        TEXT,
    next_run        TEXT
);

CREATE TABLE IF NOT EXISTS runs (
    id         INTEGER PRIMARY KEY,
    job_id     INTEGER,
    job_name   TEXT,
    started_at TEXT,
    ended_at   TEXT,
    exit_code  INTEGER,
    stdout     TEXT,
    stderr     TEXT,
    timed_out  INTEGER,
    \"trigger\"  TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_job_name ON runs(job_name);
CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC);
";

const JOB_COLUMNS: &str = "id, name, cron, command, working_dir, timeout_seconds, tags, enabled, \
                           created_at, updated_at, last_run, next_run";
const RUN_COLUMNS: &str = "id, job_id, job_name, started_at, ended_at, exit_code, stdout, stderr, \
                           timed_out, \"trigger\"";

/// Shared handle to the store. Clone via `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (and migrate) the store file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL keeps commits durable without blocking readers. The pragma
        // reports the resulting mode, so it goes through query_row.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Jobs ──────────────────────────────────────────────────────

    /// Insert a new job. The cron expression is validated before any write;
    /// `next_run` is computed immediately for enabled jobs.
    pub fn add_job(&self, new: NewJob) -> Result<Job> {
        let expr = CronExpr::parse(&new.cron)?;
        if new.timeout_seconds == 0 {
            return Err(Error::InvalidTimeout);
        }

        let now = Utc::now();
        let next_run = if new.enabled { expr.next_after(now) } else { None };

        let conn = self.conn.lock();
        let inserted = conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS}) \
                 VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10)"
            ),
            params![
                new.name,
                expr.source(),
                new.command,
                new.working_dir,
                new.timeout_seconds,
                join_tags(&new.tags),
                i64::from(new.enabled),
                now.to_rfc3339(),
                now.to_rfc3339(),
                next_run.map(|t| t.to_rfc3339()),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(Error::DuplicateName(new.name));
            }
            Err(e) => return Err(e.into()),
        }

        let id = conn.last_insert_rowid();
        Ok(Job {
            id,
            name: new.name,
            cron: expr.source().to_string(),
            command: new.command,
            working_dir: new.working_dir,
            timeout_seconds: new.timeout_seconds,
            tags: new.tags,
            enabled: new.enabled,
            created_at: now,
            updated_at: now,
            last_run: None,
            next_run,
        })
    }

    pub fn get_job(&self, name: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1"),
            params![name],
            map_job_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// All jobs matching the filter, ordered by name.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY name ASC"))?;
        let rows = stmt.query_map([], map_job_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            let job = row?;
            if filter.enabled_only && !job.enabled {
                continue;
            }
            if let Some(tag) = &filter.tag {
                if !job.tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Apply a patch to an existing job. A changed cron expression is
    /// re-validated and re-armed; disabling clears `next_run`, enabling
    /// recomputes it.
    pub fn update_job(&self, name: &str, patch: JobPatch) -> Result<Job> {
        let new_expr = patch.cron.as_deref().map(CronExpr::parse).transpose()?;
        if patch.timeout_seconds == Some(0) {
            return Err(Error::InvalidTimeout);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut job = tx
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1"),
                params![name],
                map_job_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let now = Utc::now();
        let was_enabled = job.enabled;

        if let Some(expr) = &new_expr {
            job.cron = expr.source().to_string();
        }
        if let Some(command) = patch.command {
            job.command = command;
        }
        if let Some(working_dir) = patch.working_dir {
            job.working_dir = working_dir;
        }
        if let Some(timeout) = patch.timeout_seconds {
            job.timeout_seconds = timeout;
        }
        if let Some(tags) = patch.tags {
            job.tags = tags;
        }
        if let Some(enabled) = patch.enabled {
            job.enabled = enabled;
        }

        job.next_run = if job.enabled {
            let rearm = new_expr.is_some() || !was_enabled || job.next_run.is_none();
            if rearm {
                CronExpr::parse(&job.cron)?.next_after(now)
            } else {
                job.next_run
            }
        } else {
            None
        };
        job.updated_at = now;

        tx.execute(
            "UPDATE jobs SET cron = ?1, command = ?2, working_dir = ?3, timeout_seconds = ?4, \
             tags = ?5, enabled = ?6, updated_at = ?7, next_run = ?8 WHERE name = ?9",
            params![
                job.cron,
                job.command,
                job.working_dir,
                job.timeout_seconds,
                join_tags(&job.tags),
                i64::from(job.enabled),
                job.updated_at.to_rfc3339(),
                job.next_run.map(|t| t.to_rfc3339()),
                name,
            ],
        )?;
        tx.commit()?;

        Ok(job)
    }

    /// Delete a job. Runs are kept as orphan history unless `purge` is set.
    pub fn delete_job(&self, name: &str, purge: bool) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if purge {
            tx.execute("DELETE FROM runs WHERE job_name = ?1", params![name])?;
        }
        let deleted = tx.execute("DELETE FROM jobs WHERE name = ?1", params![name])?;
        tx.commit()?;

        if deleted == 0 {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn set_next_run(&self, name: &str, instant: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE jobs SET next_run = ?1 WHERE name = ?2",
            params![instant.map(|t| t.to_rfc3339()), name],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(())
    }

    /// Enabled jobs whose `next_run` has come due, ordered by `next_run`
    /// then name so dispatch order is deterministic.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ?1 \
             ORDER BY next_run ASC, name ASC"
        ))?;
        let rows = stmt.query_map(params![now.to_rfc3339()], map_job_row)?;
        collect_rows(rows)
    }

    /// Earliest armed `next_run` across enabled jobs, for adaptive sleeps.
    pub fn earliest_next_run(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT next_run FROM jobs \
                 WHERE enabled = 1 AND next_run IS NOT NULL \
                 ORDER BY next_run ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(parse_ts(&raw)?)),
            None => Ok(None),
        }
    }

    /// `(total, enabled)` job counts for status snapshots.
    pub fn job_counts(&self) -> Result<(usize, usize)> {
        let conn = self.conn.lock();
        let (total, enabled): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(enabled), 0) FROM jobs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((total as usize, enabled as usize))
    }

    // ── Runs ──────────────────────────────────────────────────────

    /// Record the start of a run. The row stays open (`ended_at` null)
    /// until `complete_run` or startup reconciliation closes it.
    pub fn create_run(
        &self,
        job_id: i64,
        job_name: &str,
        started_at: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO runs ({RUN_COLUMNS}) \
                 VALUES (NULL, ?1, ?2, ?3, NULL, NULL, '', '', 0, ?4)"
            ),
            params![job_id, job_name, started_at.to_rfc3339(), trigger.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomic scheduled dispatch: advance `last_run`/`next_run` and open the
    /// run record in one transaction.
    pub fn dispatch_scheduled(
        &self,
        name: &str,
        now: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        self.dispatch(name, now, Some(next_run), Trigger::Schedule)
    }

    /// Atomic manual dispatch: advance `last_run` and open the run record,
    /// leaving the normal schedule undisturbed.
    pub fn dispatch_manual(&self, name: &str, now: DateTime<Utc>) -> Result<i64> {
        self.dispatch(name, now, None, Trigger::Manual)
    }

    fn dispatch(
        &self,
        name: &str,
        now: DateTime<Utc>,
        next_run: Option<Option<DateTime<Utc>>>,
        trigger: Trigger,
    ) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let job_id: i64 = tx
            .query_row("SELECT id FROM jobs WHERE name = ?1", params![name], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        match next_run {
            Some(next) => tx.execute(
                "UPDATE jobs SET last_run = ?1, next_run = ?2, updated_at = ?1 WHERE id = ?3",
                params![now.to_rfc3339(), next.map(|t| t.to_rfc3339()), job_id],
            )?,
            None => tx.execute(
                "UPDATE jobs SET last_run = ?1, updated_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), job_id],
            )?,
        };

        tx.execute(
            &format!(
                "INSERT INTO runs ({RUN_COLUMNS}) \
                 VALUES (NULL, ?1, ?2, ?3, NULL, NULL, '', '', 0, ?4)"
            ),
            params![job_id, name, now.to_rfc3339(), trigger.as_str()],
        )?;
        let run_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(run_id)
    }

    /// Close a run. Captured streams are bounded before persisting; a run is
    /// completed exactly once and never edited afterwards, so a second
    /// completion attempt is rejected rather than overwriting history.
    pub fn complete_run(&self, id: i64, outcome: &RunOutcome) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE runs SET ended_at = ?1, exit_code = ?2, stdout = ?3, stderr = ?4, \
             timed_out = ?5 WHERE id = ?6 AND ended_at IS NULL",
            params![
                outcome.ended_at.to_rfc3339(),
                outcome.exit_code,
                truncate_capture(&outcome.stdout),
                truncate_capture(&outcome.stderr),
                i64::from(outcome.timed_out),
                id,
            ],
        )?;
        if changed == 0 {
            return Err(Error::RunNotFound(id));
        }
        Ok(())
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            params![id],
            map_run_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Runs matching the filter, most recent first.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE (?1 IS NULL OR job_name = ?1) \
               AND (?2 IS NULL OR started_at >= ?2) \
               AND (?3 = 0 OR (ended_at IS NOT NULL \
                    AND (timed_out = 1 OR COALESCE(exit_code, -1) <> 0))) \
             ORDER BY started_at DESC, id DESC \
             LIMIT ?4"
        ))?;
        let limit = filter.limit.map_or(-1, |n| n as i64);
        let rows = stmt.query_map(
            params![
                filter.job,
                filter.since.map(|t| t.to_rfc3339()),
                i64::from(filter.failed_only),
                limit,
            ],
            map_run_row,
        )?;
        collect_rows(rows)
    }

    /// Most recent run for a job, if any.
    pub fn last_run_for(&self, name: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE job_name = ?1 \
                 ORDER BY started_at DESC, id DESC LIMIT 1"
            ),
            params![name],
            map_run_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Close every run left open by an unclean shutdown. Returns the count.
    pub fn reconcile_orphans(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE runs SET ended_at = ?1, exit_code = -1, stderr = ?2, timed_out = 0 \
             WHERE ended_at IS NULL",
            params![Utc::now().to_rfc3339(), INTERRUPTED_STDERR],
        )?;
        Ok(changed)
    }

    /// Retention sweep: drop runs older than the horizon. Returns the count.
    pub fn purge_runs_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM runs WHERE started_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(removed)
    }
}

fn collect_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn join_tags(tags: &[String]) -> Option<String> {
    if tags.is_empty() {
        None
    } else {
        Some(tags.join(","))
    }
}

fn split_tags(raw: Option<String>) -> Vec<String> {
    raw.map_or_else(Vec::new, |joined| {
        joined
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    })
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_ts_opt(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_ts(&raw)).transpose()
}

fn map_job_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        cron: row.get(2)?,
        command: row.get(3)?,
        working_dir: row.get(4)?,
        timeout_seconds: row.get(5)?,
        tags: split_tags(row.get(6)?),
        enabled: row.get::<_, i64>(7)? != 0,
        created_at: parse_ts(&row.get::<_, String>(8)?)?,
        updated_at: parse_ts(&row.get::<_, String>(9)?)?,
        last_run: parse_ts_opt(row.get(10)?)?,
        next_run: parse_ts_opt(row.get(11)?)?,
    })
}

fn map_run_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        job_id: row.get(1)?,
        job_name: row.get(2)?,
        started_at: parse_ts(&row.get::<_, String>(3)?)?,
        ended_at: parse_ts_opt(row.get(4)?)?,
        exit_code: row.get(5)?,
        stdout: row.get(6)?,
        stderr: row.get(7)?,
        timed_out: row.get::<_, i64>(8)? != 0,
        trigger: Trigger::parse(&row.get::<_, String>(9)?),
    })
}

/// Bound a captured stream, marking the cut at a UTF-8 boundary.
fn truncate_capture(output: &str) -> String {
    if output.len() <= MAX_CAPTURE_BYTES {
        return output.to_string();
    }

    let mut cutoff = MAX_CAPTURE_BYTES - TRUNCATED_MARKER.len();
    while cutoff > 0 && !output.is_char_boundary(cutoff) {
        cutoff -= 1;
    }

    let mut truncated = output[..cutoff].to_string();
    truncated.push_str(TRUNCATED_MARKER);
    truncated
}
