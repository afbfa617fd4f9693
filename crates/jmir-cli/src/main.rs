use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use jmir_storage::IssueStore;
use jmir_sync::{run_scheduled, run_sync_once, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jmir-cli")]
#[command(about = "Mirror Jira Cloud issues into a local SQLite database")]
struct Cli {
    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass, or keep syncing when --schedule is set (default).
    Sync,
    /// Create the issues table and indexes, then exit.
    Migrate,
}

/// Overrides for values otherwise read from the environment / `.env`.
#[derive(Debug, Args)]
struct RunArgs {
    /// Jira Cloud account email
    #[arg(long, global = true)]
    email: Option<String>,
    /// Jira Cloud API token
    #[arg(long, global = true)]
    token: Option<String>,
    /// Jira Cloud base URL
    #[arg(long, global = true)]
    server: Option<String>,
    /// Location of the SQLite database file
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// Project key to mirror
    #[arg(long, global = true)]
    project: Option<String>,
    /// Trailing window in days
    #[arg(long, global = true)]
    days: Option<u32>,
    /// Issues per search request
    #[arg(long, global = true)]
    page_size: Option<usize>,
    /// Custom field stored in the `isp` column
    #[arg(long, global = true)]
    custom_field: Option<String>,
    /// URL pinged after every successful pass
    #[arg(long, global = true)]
    health_check: Option<String>,
    /// Re-run the sync every N minutes until interrupted
    #[arg(long, global = true)]
    schedule: Option<u64>,
}

impl RunArgs {
    fn apply(self, config: &mut SyncConfig) {
        if self.email.is_some() {
            config.email = self.email;
        }
        if self.token.is_some() {
            config.token = self.token;
        }
        if let Some(server) = self.server {
            config.server_url = server;
        }
        if let Some(database) = self.database {
            config.database_path = database;
        }
        if let Some(project) = self.project {
            config.project = project;
        }
        if let Some(days) = self.days {
            config.window_days = days;
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }
        if let Some(field) = self.custom_field {
            config.classification_field = field;
        }
        if self.health_check.is_some() {
            config.health_check_url = self.health_check;
        }
        if self.schedule.is_some() {
            config.schedule_minutes = self.schedule;
        }
    }
}

fn schedule_interval(minutes: u64) -> Result<Duration> {
    if minutes == 0 {
        bail!("--schedule must be at least one minute");
    }
    let Some(secs) = minutes.checked_mul(60) else {
        bail!("--schedule of {minutes} minutes is too large");
    };
    Ok(Duration::from_secs(secs))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    cli.run.apply(&mut config);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            info!(
                email = config.email.as_deref().unwrap_or("<unset>"),
                project = %config.project,
                days = config.window_days,
                "starting jira mirror"
            );
            match config.schedule_minutes {
                Some(minutes) => {
                    let every = schedule_interval(minutes)?;
                    info!(minutes, "running the sync on a schedule");
                    run_scheduled(config, every).await?;
                }
                None => {
                    let summary = run_sync_once(&config).await?;
                    println!(
                        "sync complete: run_id={} pages={} seen={} inserted={} updated={} skipped={}",
                        summary.run_id,
                        summary.counts.pages_fetched,
                        summary.counts.issues_seen,
                        summary.counts.inserted,
                        summary.counts.updated,
                        summary.counts.skipped
                    );
                }
            }
        }
        Commands::Migrate => {
            IssueStore::connect(&config.database_path).await?;
            println!("schema ready: {}", config.database_path.display());
        }
    }

    Ok(())
}
