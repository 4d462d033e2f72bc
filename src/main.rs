#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use cronbox::engine::Engine;
use cronbox::store::{JobFilter, JobPatch, NewJob, Run, RunFilter};
use cronbox::{Config, JobCommands};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, EnvFilter};

/// `cronbox` - persistent cron-style job scheduler.
#[derive(Parser, Debug)]
#[command(name = "cronbox")]
#[command(version)]
#[command(about = "Schedule shell commands and keep their history.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler engine in the foreground until interrupted
    Serve,
    /// Manage the job catalog
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Show recorded runs, most recent first
    Runs {
        /// Only runs of this job
        #[arg(long)]
        job: Option<String>,
        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Only failed runs
        #[arg(long)]
        failed: bool,
    },
    /// Execute a job immediately, outside its schedule
    Trigger {
        /// Job name
        name: String,
    },
    /// Catalog and engine status snapshot
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();
    init_logging(&config, matches!(cli.command, Commands::Serve))?;

    let engine = Engine::new(config.clone())?;

    match cli.command {
        Commands::Serve => serve(&engine, &config).await,
        Commands::Job { command } => handle_job_command(&engine, command),
        Commands::Runs { job, limit, failed } => {
            let runs = engine.list_runs(&RunFilter {
                job,
                limit: Some(limit),
                failed_only: failed,
                ..RunFilter::default()
            })?;
            if runs.is_empty() {
                println!("No runs recorded yet.");
                return Ok(());
            }
            println!("🗒️  Runs ({}):", runs.len());
            for run in runs {
                print_run_line(&run);
            }
            Ok(())
        }
        Commands::Trigger { name } => {
            let run = engine.trigger(&name).await?;
            let verdict = if run.success() {
                "✅ succeeded"
            } else if run.timed_out {
                "⏱️ timed out"
            } else {
                "❌ failed"
            };
            println!(
                "{verdict} (run {}, exit code {})",
                run.id,
                run.exit_code.unwrap_or(-1)
            );
            if !run.stdout.is_empty() {
                println!("--- stdout ---\n{}", run.stdout.trim_end());
            }
            if !run.stderr.is_empty() {
                println!("--- stderr ---\n{}", run.stderr.trim_end());
            }
            Ok(())
        }
        Commands::Status => {
            let status = engine.status()?;
            println!(
                "Jobs: {} total, {} enabled",
                status.total_jobs, status.enabled_jobs
            );
            let mut upcoming: Vec<_> = engine
                .list_jobs(&JobFilter {
                    enabled_only: true,
                    ..JobFilter::default()
                })?
                .into_iter()
                .filter_map(|job| job.next_run.map(|next| (next, job.name)))
                .collect();
            upcoming.sort();
            match upcoming.first() {
                Some((next, name)) => println!("Next due: '{name}' at {}", next.to_rfc3339()),
                None => println!("Next due: nothing scheduled"),
            }
            Ok(())
        }
    }
}

/// Run the engine until interrupted, then drain within the configured
/// shutdown timeout.
async fn serve(engine: &Engine, config: &Config) -> Result<()> {
    // Mirror engine events into the log so `serve` output tells the story.
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.kind {
                cronbox::engine::EngineEventKind::SchedulerTick => {
                    tracing::debug!("{:?} {}", event.kind, event.detail.unwrap_or_default());
                }
                kind => tracing::info!(
                    "{kind:?} job={} run={} {}",
                    event.job_name.unwrap_or_default(),
                    event.run_id.map_or_else(String::new, |id| id.to_string()),
                    event.detail.unwrap_or_default()
                ),
            }
        }
    });

    engine.start().await?;
    tracing::info!(
        "Serving jobs from {} (check interval {}s)",
        config.db_path.display(),
        config.check_interval.as_secs()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, draining");
    engine
        .stop(config.shutdown_timeout + Duration::from_secs(5))
        .await;
    Ok(())
}

fn handle_job_command(engine: &Engine, command: JobCommands) -> Result<()> {
    match command {
        JobCommands::Add {
            name,
            cron,
            command,
            workdir,
            timeout,
            tags,
            disabled,
        } => {
            let job = engine.add_job(NewJob {
                name,
                cron,
                command,
                working_dir: workdir,
                timeout_seconds: timeout,
                tags,
                enabled: !disabled,
            })?;
            println!("✅ Added job '{}'", job.name);
            println!("  Cron: {}", job.cron);
            println!("  Cmd : {}", job.command);
            match job.next_run {
                Some(next) => println!("  Next: {}", next.to_rfc3339()),
                None => println!("  Next: never (disabled or no future firing time)"),
            }
            Ok(())
        }
        JobCommands::List { tag, enabled, json } => {
            let jobs = engine.list_jobs(&JobFilter {
                tag,
                enabled_only: enabled,
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
                return Ok(());
            }
            if jobs.is_empty() {
                println!("No jobs yet.");
                println!("\nUsage:");
                println!("  cronbox job add nightly-backup '0 3 * * *' 'tar czf /backups/home.tgz /home'");
                return Ok(());
            }
            println!("🕒 Jobs ({}):", jobs.len());
            for job in jobs {
                let state = if job.enabled { "enabled" } else { "disabled" };
                let next = job
                    .next_run
                    .map_or_else(|| "never".into(), |t| t.to_rfc3339());
                println!("- {} | {} | {state} | next={next}", job.name, job.cron);
                println!("    cmd: {}", job.command);
                if !job.tags.is_empty() {
                    println!("    tags: {}", job.tags.join(", "));
                }
            }
            Ok(())
        }
        JobCommands::Show { name } => {
            let job = engine
                .get_job(&name)?
                .ok_or_else(|| anyhow::anyhow!("no job named '{name}'"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            if let Some(run) = engine.last_run_for(&name)? {
                println!("\nLast run:");
                print_run_line(&run);
            }
            Ok(())
        }
        JobCommands::Update {
            name,
            cron,
            command,
            workdir,
            timeout,
            tags,
        } => {
            if cron.is_none()
                && command.is_none()
                && workdir.is_none()
                && timeout.is_none()
                && tags.is_empty()
            {
                anyhow::bail!(
                    "At least one of --cron, --command, --workdir, --timeout, or --tag must be provided"
                );
            }
            let job = engine.update_job(
                &name,
                JobPatch {
                    cron,
                    command,
                    working_dir: workdir.map(Some),
                    timeout_seconds: timeout,
                    tags: if tags.is_empty() { None } else { Some(tags) },
                    enabled: None,
                },
            )?;
            println!("✅ Updated job '{}'", job.name);
            println!("  Cron: {}", job.cron);
            println!("  Cmd : {}", job.command);
            Ok(())
        }
        JobCommands::Enable { name } => {
            let job = engine.enable_job(&name)?;
            let next = job
                .next_run
                .map_or_else(|| "never".into(), |t| t.to_rfc3339());
            println!("▶️  Enabled job '{name}' (next={next})");
            Ok(())
        }
        JobCommands::Disable { name } => {
            engine.disable_job(&name)?;
            println!("⏸️  Disabled job '{name}'");
            Ok(())
        }
        JobCommands::Remove { name, purge } => {
            engine.delete_job(&name, purge)?;
            if purge {
                println!("🗑️  Removed job '{name}' and its run history");
            } else {
                println!("🗑️  Removed job '{name}' (runs kept as history)");
            }
            Ok(())
        }
    }
}

fn print_run_line(run: &Run) {
    let ended = run
        .ended_at
        .map_or_else(|| "running".into(), |t| t.to_rfc3339());
    let verdict = if run.ended_at.is_none() {
        "live"
    } else if run.timed_out {
        "timeout"
    } else if run.success() {
        "ok"
    } else {
        "error"
    };
    let exit = run
        .exit_code
        .map_or_else(|| "-".into(), |code| code.to_string());
    println!(
        "- #{} {} | {} | started={} ended={ended} | exit={exit} | {}",
        run.id,
        run.job_name,
        verdict,
        run.started_at.to_rfc3339(),
        run.trigger.as_str(),
    );
}

/// Initialize logging. `LOG_LEVEL` seeds the filter (`RUST_LOG` wins when
/// set); `serve` additionally tees into `LOG_DIR/cronbox.log`.
fn init_logging(config: &Config, to_file: bool) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter()));

    let writer = if to_file {
        std::fs::create_dir_all(&config.log_dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.log_dir.join("cronbox.log"))?;
        BoxMakeWriter::new(std::io::stdout.and(Arc::new(file)))
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(!to_file)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
    Ok(())
}
