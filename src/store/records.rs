use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A schedulable unit: one named shell command bound to a cron expression.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    /// Unique, user-facing, case-sensitive.
    pub name: String,
    /// Five-field cron expression, validated at write time.
    pub cron: String,
    /// Opaque shell string; the engine never parses it.
    pub command: String,
    pub working_dir: Option<String>,
    pub timeout_seconds: u32,
    pub tags: Vec<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Input for creating a job; id and timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub cron: String,
    pub command: String,
    pub working_dir: Option<String>,
    pub timeout_seconds: u32,
    pub tags: Vec<String>,
    pub enabled: bool,
}

impl NewJob {
    pub fn new(name: impl Into<String>, cron: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cron: cron.into(),
            command: command.into(),
            working_dir: None,
            timeout_seconds: 300,
            tags: Vec::new(),
            enabled: true,
        }
    }
}

/// Fields of a job that may change after creation. `None` leaves the stored
/// value untouched; `working_dir` uses a nested `Option` so it can be
/// cleared explicitly.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub cron: Option<String>,
    pub command: Option<String>,
    pub working_dir: Option<Option<String>>,
    pub timeout_seconds: Option<u32>,
    pub tags: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

/// Filters for `list_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub tag: Option<String>,
    pub enabled_only: bool,
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Schedule,
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Manual => "manual",
        }
    }

    /// Lenient read-side parse: unknown markers count as scheduled.
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("manual") {
            Self::Manual
        } else {
            Self::Schedule
        }
    }
}

/// One execution attempt of a job. `job_name` is denormalised so history
/// stays readable after the job itself is deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: i64,
    pub job_id: i64,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the run is live or was cut short by an unclean
    /// shutdown; reconciled at the next engine start.
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub trigger: Trigger,
}

impl Run {
    /// A run succeeded iff it exited zero and did not time out.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// Terminal state written onto a run exactly once, at completion.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub ended_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Filters for `list_runs`. Most-recent-first, optionally bounded.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub job: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub failed_only: bool,
}
