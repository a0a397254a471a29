mod checkpoint;
mod db;
mod envelope;
mod error;
mod extractor;
mod fetcher;
mod harvester;
mod publisher;
mod queue;
mod scheduler;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::SeedOutcome;
use crate::db::Database;
use crate::extractor::ContentExtractor;
use crate::fetcher::{HttpFetcher, UriTemplate};
use crate::harvester::{Harvester, StopReason};
use crate::publisher::Publisher;
use crate::queue::{DeliveryQueue, HttpQueue, SqliteQueue};
use crate::scheduler::Schedule;
use crate::settings::Settings;

#[derive(Parser)]
#[command(name = "archive_harvester", about = "Sequential archive harvester with checkpointed dual-sink publishing")]
struct Cli {
    /// Optional settings file; HARVEST_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest forever: one cycle per poll interval until Ctrl-C
    Run,
    /// Run a single cycle and exit
    Once,
    /// Set the starting checkpoint for the configured service
    Seed {
        /// Last sequence id considered already harvested
        #[arg(long)]
        last_id: u64,
        /// Allow moving the checkpoint backwards
        #[arg(long)]
        force: bool,
    },
    /// Show checkpoint and sink counts
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let db = Arc::new(Database::open(&settings.database_path)?);

    let result = match cli.command {
        Commands::Run => {
            let harvester = build_harvester(&settings, &db)?;
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, finishing current step");
                    on_signal.cancel();
                }
            });

            let schedule = Schedule {
                poll_interval: settings.poll_interval(),
                retry_backoff: settings.retry_backoff(),
            };
            info!(
                "Harvesting {} every {}s from {}",
                settings.service_name,
                schedule.poll_interval.as_secs(),
                settings.source_uri_template
            );
            scheduler::run_forever(&harvester, schedule, cancel).await?;
            Ok(())
        }
        Commands::Once => {
            let harvester = build_harvester(&settings, &db)?;
            let report = harvester.run_cycle(&CancellationToken::new()).await?;
            match report.stop {
                StopReason::Drained { sequence, status } => println!(
                    "Published {} documents; checkpoint {} -> {} (#{} returned {}).",
                    report.published, report.started_at, report.last_sequence, sequence, status
                ),
                StopReason::Cancelled => println!(
                    "Cancelled after {} documents; checkpoint {}.",
                    report.published, report.last_sequence
                ),
            }
            Ok(())
        }
        Commands::Seed { last_id, force } => {
            let outcome =
                checkpoint::seed(db.as_ref(), &settings.service_name, last_id, force).await?;
            match outcome {
                SeedOutcome::Created => {
                    println!("Seeded {} at {}.", settings.service_name, last_id)
                }
                SeedOutcome::Updated { previous } => println!(
                    "Moved {} checkpoint {} -> {}.",
                    settings.service_name, previous, last_id
                ),
                SeedOutcome::Unchanged => {
                    println!("{} already at {}.", settings.service_name, last_id)
                }
                SeedOutcome::Refused { current } => {
                    warn!(
                        "refusing to rewind {} from {} to {}",
                        settings.service_name, current, last_id
                    );
                    anyhow::bail!(
                        "checkpoint is at {}; pass --force to move it back to {}",
                        current,
                        last_id
                    );
                }
            }
            Ok(())
        }
        Commands::Status => {
            let s = db
                .get_stats(&settings.service_name, &settings.queue_name)
                .context("Failed to read stats")?;
            println!("Service:    {}", settings.service_name);
            println!("Checkpoint: {}", s.last_id.as_deref().unwrap_or("(not seeded)"));
            println!("Documents:  {}", s.documents);
            println!("Latest:     {}", s.latest_created_at.as_deref().unwrap_or("-"));
            match &settings.queue_url {
                Some(url) => println!("Queue:      {} via {}", settings.queue_name, url),
                None => println!("Queue:      {} (local outbox, {} messages)", settings.queue_name, s.queued),
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        info!("Done in {}", format_duration(elapsed));
    }

    result
}

fn build_harvester(settings: &Settings, db: &Arc<Database>) -> anyhow::Result<Harvester> {
    let template = UriTemplate::parse(&settings.source_uri_template)?;
    let fetcher = HttpFetcher::new(template, settings.request_timeout(), &settings.user_agent)?;
    let extractor = ContentExtractor::new(&settings.content_selector)?;
    info!("Content region: `{}`", extractor.selector());

    let queue: Arc<dyn DeliveryQueue> = match &settings.queue_url {
        Some(url) => Arc::new(HttpQueue::new(
            url,
            &settings.queue_name,
            settings.request_timeout(),
            &settings.user_agent,
        )?),
        None => Arc::new(SqliteQueue::new(Arc::clone(db), &settings.queue_name)),
    };
    let publisher = Publisher::new(db.clone(), queue);

    Ok(Harvester::new(
        &settings.service_name,
        db.clone(),
        Arc::new(fetcher),
        extractor,
        publisher,
    ))
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
