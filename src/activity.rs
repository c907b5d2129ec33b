//! Newest-first scan of the remote activity feed.
//!
//! The stored cursor is the `(remote_updated_at, id)` of the newest item seen
//! so far. A sync walks the feed from the top and stops at the first item at or
//! below that cursor, so steady-state runs only read what changed since the last
//! one.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{normalize_activity, ActivityItem, CatalogSource};
use crate::crawl::ItemError;
use crate::db::{self, Pool};
use crate::model::FeedPosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub max_pages: usize,
    pub page_size: i64,
    /// Upper bound on items ingested by one sync.
    pub hard_cap: usize,
    /// Ignore the stored cursor and rescan the first pages.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivitySyncReport {
    pub stream_id: String,
    pub processed: usize,
    pub pages: usize,
    pub stopped_on_seen: bool,
    pub skipped: Vec<ItemError>,
    pub previous_cursor: Option<FeedPosition>,
    pub newest_cursor: Option<FeedPosition>,
    pub cursor_advanced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentSyncReport {
    pub external_parent_id: String,
    pub fetched: usize,
    pub processed: usize,
    pub skipped: Vec<ItemError>,
}

#[instrument(skip_all, fields(stream_id = %stream_id, force = opts.force))]
pub async fn sync(
    pool: &Pool,
    source: &dyn CatalogSource,
    stream_id: &str,
    opts: SyncOptions,
) -> Result<ActivitySyncReport> {
    let page_size = opts.page_size.max(1);
    let cursor = db::cursor::ensure_cursor(pool, stream_id, page_size, Utc::now()).await?;
    let previous = cursor.feed_position();

    let mut processed = 0usize;
    let mut pages = 0usize;
    let mut stopped_on_seen = false;
    let mut skipped = Vec::new();
    let mut candidate: Option<FeedPosition> = None;
    let mut offset = 0i64;

    'pages: while pages < opts.max_pages && processed < opts.hard_cap {
        let page = source
            .list_recent(page_size, offset)
            .await
            .with_context(|| format!("activity feed request failed at offset {}", offset))?;
        pages += 1;
        let fetched = page.items.len();
        debug!(offset, fetched, "fetched activity page");

        for raw in &page.items {
            let item = match normalize_activity(raw) {
                Ok(item) => item,
                Err(err) => {
                    warn!(external_id = %raw.id, error = %err, "skipping malformed feed item");
                    skipped.push(ItemError {
                        external_id: raw.id.clone(),
                        message: format!("{err:#}"),
                    });
                    continue;
                }
            };
            let position = FeedPosition {
                updated_at: item.remote_updated_at,
                id: item.external_item_id.clone(),
            };
            if !opts.force {
                if let Some(seen) = previous.as_ref() {
                    if &position <= seen {
                        stopped_on_seen = true;
                        break 'pages;
                    }
                }
            }

            ingest_activity(pool, &item, Utc::now()).await?;
            processed += 1;
            if candidate.as_ref().map_or(true, |c| &position > c) {
                candidate = Some(position);
            }
            if processed >= opts.hard_cap {
                break 'pages;
            }
        }

        if (fetched as i64) < page_size {
            break;
        }
        offset += fetched as i64;
    }

    let now = Utc::now();
    let mut cursor_advanced = false;
    if let Some(position) = candidate.as_ref().filter(|_| processed > 0) {
        let newer = previous.as_ref().map_or(true, |p| position > p);
        if newer {
            cursor_advanced =
                db::cursor::advance_feed_position(pool, stream_id, position, processed as i64, now)
                    .await?;
        }
    }
    if processed > 0 && !cursor_advanced {
        db::cursor::add_processed(pool, stream_id, processed as i64, now).await?;
    }

    let newest_cursor = if cursor_advanced {
        candidate
    } else {
        db::cursor::get_cursor(pool, stream_id)
            .await?
            .and_then(|c| c.feed_position())
    };

    info!(
        processed,
        pages,
        stopped_on_seen,
        skipped = skipped.len(),
        cursor_advanced,
        "activity sync finished"
    );

    Ok(ActivitySyncReport {
        stream_id: stream_id.to_string(),
        processed,
        pages,
        stopped_on_seen,
        skipped,
        previous_cursor: previous,
        newest_cursor,
        cursor_advanced,
    })
}

/// Refresh the activity of a single parent from its own feed. Always a forced,
/// single-page read; the global stream cursor is left alone.
#[instrument(skip_all, fields(external_parent_id = %external_parent_id))]
pub async fn sync_parent(
    pool: &Pool,
    source: &dyn CatalogSource,
    external_parent_id: &str,
    limit: i64,
) -> Result<ParentSyncReport> {
    let page = source
        .list_recent_for_parent(external_parent_id, limit.max(1))
        .await
        .with_context(|| format!("feed request for {} failed", external_parent_id))?;

    let mut processed = 0usize;
    let mut skipped = Vec::new();
    for raw in &page.items {
        match normalize_activity(raw) {
            Ok(item) => {
                ingest_activity(pool, &item, Utc::now()).await?;
                processed += 1;
            }
            Err(err) => skipped.push(ItemError {
                external_id: raw.id.clone(),
                message: format!("{err:#}"),
            }),
        }
    }

    Ok(ParentSyncReport {
        external_parent_id: external_parent_id.to_string(),
        fetched: page.items.len(),
        processed,
        skipped,
    })
}

/// Upsert one feed item, linking it to the local catalog entry when the
/// crawler has already ingested its parent.
pub async fn ingest_activity(pool: &Pool, item: &ActivityItem, now: DateTime<Utc>) -> Result<()> {
    let local_parent_id = db::catalog::find_entry_id(pool, &item.external_parent_id).await?;
    db::activity::upsert_activity(pool, item, local_parent_id, now).await
}
