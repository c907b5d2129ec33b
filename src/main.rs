use anyhow::{Context, Result};
use catalog_sync::catalog::{CatalogClient, CatalogSource};
use catalog_sync::server::{self, AppState};
use catalog_sync::{config, db};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about = "Serve the catalog sync trigger endpoints")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    // Both streams exist from the start so health reports them before their first step.
    let now = Utc::now();
    db::cursor::ensure_cursor(&pool, &cfg.crawl.stream_id, cfg.crawl.page_size, now).await?;
    db::cursor::ensure_cursor(&pool, &cfg.activity.stream_id, cfg.activity.page_size, now).await?;

    let source: Arc<dyn CatalogSource> = Arc::new(CatalogClient::from_config(&cfg)?);
    let listener = TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.bind))?;

    info!(bind = %cfg.server.bind, "starting catalog sync trigger server");
    let state = Arc::new(AppState { pool, source, cfg });
    server::serve(listener, state).await
}
