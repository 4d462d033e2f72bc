#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_async
)]

use clap::Subcommand;

pub mod config;
pub mod cron;
pub mod engine;
pub mod error;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};

/// Job catalog subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum JobCommands {
    /// Add a new job to the catalog
    #[command(long_about = "\
Add a new job to the catalog.

Uses standard 5-field cron syntax: 'min hour day month weekday'. \
All times are evaluated in UTC.

Examples:
  cronbox job add nightly-backup '0 3 * * *' 'tar czf /backups/home.tgz /home'
  cronbox job add health-check '*/15 * * * *' 'curl -fsS http://localhost:8080/healthz' --tag ops")]
    Add {
        /// Unique job name
        name: String,
        /// Cron expression
        cron: String,
        /// Command to run (handed to the OS shell verbatim)
        command: String,
        /// Working directory for the command
        #[arg(long)]
        workdir: Option<String>,
        /// Kill the command after this many seconds
        #[arg(long, default_value = "300")]
        timeout: u32,
        /// Tag the job (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Create the job disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List jobs in the catalog
    List {
        /// Only jobs carrying this tag
        #[arg(long)]
        tag: Option<String>,
        /// Only enabled jobs
        #[arg(long)]
        enabled: bool,
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one job in full
    Show {
        /// Job name
        name: String,
    },
    /// Update fields of an existing job
    #[command(long_about = "\
Update one or more fields of an existing job.

Only the fields you specify are changed; others remain unchanged. \
Passing --tag replaces the full tag set.

Examples:
  cronbox job update nightly-backup --cron '0 4 * * *'
  cronbox job update health-check --timeout 30 --tag ops --tag probes")]
    Update {
        /// Job name
        name: String,
        /// New cron expression
        #[arg(long)]
        cron: Option<String>,
        /// New command
        #[arg(long)]
        command: Option<String>,
        /// New working directory
        #[arg(long)]
        workdir: Option<String>,
        /// New timeout in seconds
        #[arg(long)]
        timeout: Option<u32>,
        /// Replacement tag set (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Enable a job
    Enable {
        /// Job name
        name: String,
    },
    /// Disable a job without deleting it
    Disable {
        /// Job name
        name: String,
    },
    /// Remove a job from the catalog
    Remove {
        /// Job name
        name: String,
        /// Also delete the job's recorded runs
        #[arg(long)]
        purge: bool,
    },
}
