use anyhow::Result;
use catalog_sync::activity::{self, SyncOptions};
use catalog_sync::catalog::CatalogClient;
use catalog_sync::orchestrator::{self, SyncParams};
use catalog_sync::{config, crawl, db, health};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run a single pipeline step against the configured database and print its report"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    step: Step,
}

#[derive(Debug, Subcommand)]
enum Step {
    /// Fetch and ingest the next catalog page
    Crawl {
        #[arg(long, alias = "state-id")]
        stream_id: Option<String>,
        /// Page size for this step only; the stored cursor keeps its own
        #[arg(long)]
        page_size: Option<i64>,
        #[arg(long)]
        batch: Option<usize>,
    },
    /// Scan the activity feed down to the stored cursor
    Activity {
        #[arg(long, alias = "state-id")]
        stream_id: Option<String>,
        #[arg(long)]
        max_pages: Option<usize>,
        #[arg(long)]
        page_size: Option<i64>,
        #[arg(long)]
        hard_cap: Option<usize>,
        /// Ignore the stored cursor
        #[arg(long)]
        force: bool,
    },
    /// Enqueue recent activity and drain one queue batch
    Sync {
        #[arg(long)]
        window: Option<i64>,
        #[arg(long)]
        batch: Option<i64>,
        #[arg(long)]
        lease: Option<i64>,
    },
    /// Print the queue health report
    Health {
        #[arg(long)]
        sample: Option<i64>,
        #[arg(long)]
        stale_minutes: Option<i64>,
    },
}

fn print_json<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let client = CatalogClient::from_config(&cfg)?;

    info!(step = ?args.step, "running pipeline step");
    match args.step {
        Step::Crawl {
            stream_id,
            page_size,
            batch,
        } => {
            let stream_id = stream_id.unwrap_or_else(|| cfg.crawl.stream_id.clone());
            let report = crawl::step(
                &pool,
                &client,
                &stream_id,
                cfg.crawl.page_size,
                page_size,
                batch.unwrap_or(cfg.crawl.batch_limit),
            )
            .await?;
            print_json(&report)
        }
        Step::Activity {
            stream_id,
            max_pages,
            page_size,
            hard_cap,
            force,
        } => {
            let stream_id = stream_id.unwrap_or_else(|| cfg.activity.stream_id.clone());
            let opts = SyncOptions {
                max_pages: max_pages.unwrap_or(cfg.activity.max_pages),
                page_size: page_size.unwrap_or(cfg.activity.page_size),
                hard_cap: hard_cap.unwrap_or(cfg.activity.hard_cap),
                force,
            };
            let report = activity::sync(&pool, &client, &stream_id, opts).await?;
            print_json(&report)
        }
        Step::Sync {
            window,
            batch,
            lease,
        } => {
            let params = SyncParams {
                window: window.unwrap_or(cfg.queue.window),
                batch_size: batch.unwrap_or(cfg.queue.batch_size),
                lease_seconds: lease.unwrap_or(cfg.queue.lease_seconds),
                item_limit: cfg.queue.item_limit,
            };
            let report = orchestrator::run(&pool, &client, params).await?;
            print_json(&report)
        }
        Step::Health {
            sample,
            stale_minutes,
        } => {
            let stale = health::stale_window(stale_minutes.unwrap_or(cfg.health.stale_minutes));
            let report = health::report(
                &pool,
                sample.unwrap_or(cfg.health.sample_size),
                stale,
                Utc::now(),
            )
            .await?;
            print_json(&report)
        }
    }
}
