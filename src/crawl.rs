//! Perpetual offset crawl over the remote catalog listing.
//!
//! Every step reads the stream's offset, fetches one page of at most
//! `batch_limit` items, ingests it and advances the offset by the page's
//! limit. Once the offset reaches the remote total it wraps to zero, so a full
//! pass is followed by another one; that next pass is also the only retry for
//! failed items.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::catalog::{normalize_entry, CatalogSource, RemoteResource};
use crate::db::{self, Pool};
use crate::model::ArtifactKind;

/// A single item that could not be ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub external_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlStepReport {
    pub stream_id: String,
    pub offset: i64,
    pub next_offset: i64,
    pub limit: i64,
    pub total: Option<i64>,
    pub fetched: usize,
    pub processed: usize,
    pub wrapped: bool,
    /// False when an overlapping step moved the cursor first.
    pub advanced: bool,
    pub errors: Vec<ItemError>,
}

/// Offset to store after a page fetched at `offset`.
///
/// Advances by the page limit (the remote's, or `page_size` when it reports
/// none) and wraps to zero at the remote total. An empty page with an unknown
/// total also wraps, otherwise the crawl would walk past the end forever.
pub fn next_offset(
    offset: i64,
    page_limit: i64,
    page_size: i64,
    total: Option<i64>,
    page_empty: bool,
) -> (i64, bool) {
    let step = if page_limit > 0 { page_limit } else { page_size.max(1) };
    let next = offset + step;
    match total {
        Some(total) if next >= total => (0, true),
        None if page_empty => (0, true),
        _ => (next, false),
    }
}

/// Run one crawl step on `stream_id`, creating its cursor with
/// `default_page_size` on first use.
///
/// `page_size` overrides the stored page size for this step only; the cursor
/// keeps its own value.
#[instrument(skip_all, fields(stream_id = %stream_id))]
pub async fn step(
    pool: &Pool,
    source: &dyn CatalogSource,
    stream_id: &str,
    default_page_size: i64,
    page_size: Option<i64>,
    batch_limit: usize,
) -> Result<CrawlStepReport> {
    let now = Utc::now();
    let cursor = db::cursor::ensure_cursor(pool, stream_id, default_page_size, now).await?;
    let offset = cursor.cursor_offset;

    let page_size = page_size.unwrap_or(cursor.page_size);
    let limit = page_size.min(batch_limit.max(1) as i64).max(1);
    let page = source
        .list_page(limit, offset)
        .await
        .with_context(|| format!("catalog listing failed at offset {}", offset))?;

    let mut processed = 0usize;
    let mut errors = Vec::new();
    for item in &page.items {
        match ingest_item(pool, item, now).await? {
            Ok(()) => processed += 1,
            Err(message) => {
                warn!(external_id = %item.id, %message, "skipping catalog item");
                errors.push(ItemError {
                    external_id: item.id.clone(),
                    message,
                });
            }
        }
    }

    let total = page.total.or(cursor.total);
    let (next, wrapped) = next_offset(
        offset,
        page.limit,
        limit,
        total,
        page.items.is_empty(),
    );
    let advanced = db::cursor::advance_offset(
        pool,
        stream_id,
        offset,
        next,
        page.total,
        processed as i64,
        Utc::now(),
    )
    .await?;
    if !advanced {
        warn!(offset, "cursor moved by an overlapping step; keeping its position");
    }

    info!(
        offset,
        next_offset = next,
        wrapped,
        processed,
        errors = errors.len(),
        "crawl step finished"
    );

    Ok(CrawlStepReport {
        stream_id: stream_id.to_string(),
        offset,
        next_offset: next,
        limit: page.limit,
        total,
        fetched: page.items.len(),
        processed,
        wrapped,
        advanced,
        errors,
    })
}

/// Upsert one catalog item and queue its cover follow-up.
///
/// The outer `Result` carries store failures, which end the step; the inner
/// one carries item-level problems, which only skip the item.
async fn ingest_item(
    pool: &Pool,
    item: &RemoteResource,
    now: DateTime<Utc>,
) -> Result<std::result::Result<(), String>> {
    let normalized = match normalize_entry(item) {
        Ok(n) => n,
        Err(err) => return Ok(Err(format!("{err:#}"))),
    };
    let entry_id =
        match db::catalog::upsert_entry(pool, &normalized.entry, &normalized.raw, now).await {
            Ok(id) => id,
            Err(err) if is_unique_violation(&err) => return Ok(Err(format!("{err:#}"))),
            Err(err) => return Err(err),
        };
    if let Some(cover) = normalized.cover_ref.as_deref() {
        db::catalog::enqueue_artifact(pool, entry_id, ArtifactKind::Cover, cover, now).await?;
    }
    Ok(Ok(()))
}

/// A concurrent insert can still take a slug between the lookup and the
/// write; that only costs the one item.
fn is_unique_violation(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
        _ => false,
    }
}
