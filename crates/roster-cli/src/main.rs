use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roster_adapters::{FileSource, RowFormat, RowSource};
use roster_storage::PgOfferingStore;
use roster_sync::{report_recent_runs_markdown, ReconcileOutcome, SyncConfig, SyncRuntime};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "roster-cli")]
#[command(about = "Academic offering roster sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync from a local export, or from the source in roster.yaml.
    Sync {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value = "csv")]
        format: String,
        #[arg(long)]
        delimiter: Option<char>,
        /// Identity recorded as the updater; defaults to ROSTER_SYSTEM_ACTOR.
        #[arg(long)]
        actor: Option<String>,
    },
    Migrate,
    Serve,
    /// Keep the cron scheduler running in the foreground.
    Schedule,
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,roster_sync=info,roster_storage=info,roster_web=info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        file: None,
        format: "csv".to_string(),
        delimiter: None,
        actor: None,
    }) {
        Commands::Sync {
            file,
            format,
            delimiter,
            actor,
        } => {
            let runtime = SyncRuntime::from_env().await?;
            let actor = actor.unwrap_or_else(|| runtime.pipeline.config().system_actor.clone());
            let file_source;
            let source: &dyn RowSource = match file {
                Some(path) => {
                    let delimiter = match delimiter {
                        Some(c) if c.is_ascii() => Some(c as u8),
                        Some(c) => anyhow::bail!("unsupported delimiter {c:?}"),
                        None => None,
                    };
                    file_source = FileSource {
                        path,
                        format: format.parse::<RowFormat>()?,
                        delimiter,
                    };
                    &file_source
                }
                None => runtime
                    .remote_source
                    .as_deref()
                    .context("no --file given and roster.yaml defines no source")?,
            };

            let record = runtime.pipeline.run(source, &actor).await?;
            match &record.outcome {
                ReconcileOutcome::Completed(summary) => println!(
                    "sync complete: run_id={} incoming={} created_or_updated={} unchanged={} deactivated={} failures={}",
                    record.run_id,
                    summary.total_incoming_records,
                    summary.created_or_updated,
                    summary.skipped_unchanged,
                    summary.deactivated,
                    summary.write_failures.len()
                ),
                ReconcileOutcome::NoData => {
                    println!("sync skipped: run_id={} snapshot had no valid rows", record.run_id);
                    std::process::exit(2);
                }
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let url = config
                .database_url
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgOfferingStore::connect(&url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            roster_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let runtime = SyncRuntime::from_env().await?;
            let scheduler = runtime
                .maybe_build_scheduler()
                .await?
                .context("scheduler disabled or no source configured; set ROSTER_SCHEDULER_ENABLED=true")?;
            scheduler.start().await?;
            info!(cron = %runtime.pipeline.config().sync_cron, "roster scheduler running");
            tokio::signal::ctrl_c().await?;
        }
        Commands::Report { runs } => {
            let workspace = SyncConfig::from_env().workspace_root;
            println!("{}", report_recent_runs_markdown(runs, &workspace)?);
        }
    }

    Ok(())
}
