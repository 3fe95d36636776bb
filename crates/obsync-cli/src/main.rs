use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use obsync_sync::{maybe_build_scheduler, runner_from_env, JobSummary};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "obsync-cli")]
#[command(about = "Incremental sync of catalog observations into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Fallback filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stations, then observations.
    Sync,
    Observations,
    Stations,
    /// Create tables and indexes.
    Migrate,
    /// Remove observations older than the retention window.
    Purge,
    /// Run `sync` on the SYNC_CRON schedule until interrupted.
    Schedule,
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current data object");
            token.cancel();
        }
    });
}

fn print_summary(summary: &JobSummary) {
    println!(
        "{:?} complete: run_id={} discovered={} accepted={} skipped={} rejected={} failed={} purged={} stations={}",
        summary.job,
        summary.run_id,
        summary.discovered_objects,
        summary.accepted_records,
        summary.skipped_records,
        summary.rejected_records,
        summary.failed_objects,
        summary.purged_records,
        summary.stations_written
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let runner = Arc::new(runner_from_env());
    cancel_on_ctrl_c(runner.cancellation_token());

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = runner.sync_all().await?;
            print_summary(&summary.stations);
            print_summary(&summary.observations);
        }
        Commands::Observations => print_summary(&runner.sync_observations().await?),
        Commands::Stations => print_summary(&runner.sync_stations().await?),
        Commands::Migrate => {
            runner.migrate().await?;
            println!("schema ready");
        }
        Commands::Purge => {
            let purged = runner.purge().await?;
            println!("purged {purged} expired observations");
        }
        Commands::Schedule => {
            let token = runner.cancellation_token();
            let Some(mut sched) = maybe_build_scheduler(runner.clone()).await? else {
                bail!("scheduler disabled; set OBSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %runner.config().sync_cron, "scheduler started");
            token.cancelled().await;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
