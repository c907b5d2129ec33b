//! Persisted stream positions in `crawl_cursors`.
//!
//! Writes are single conditional row updates: offset streams compare-and-swap
//! on the offset that was read, feed streams only ever move forward.

use super::{from_millis, from_millis_opt, to_millis, Pool};
use crate::model::{CrawlCursor, FeedPosition};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;

const CURSOR_COLUMNS: &str = "stream_id, cursor_offset, cursor_timestamp, cursor_last_id, page_size, \
                              total, processed_count, updated_at";

fn cursor_from_row(row: &SqliteRow) -> Result<CrawlCursor> {
    Ok(CrawlCursor {
        stream_id: row.get("stream_id"),
        cursor_offset: row.get("cursor_offset"),
        cursor_timestamp: from_millis_opt(row.get("cursor_timestamp"))?,
        cursor_last_id: row.get("cursor_last_id"),
        page_size: row.get("page_size"),
        total: row.get("total"),
        processed_count: row.get("processed_count"),
        updated_at: from_millis(row.get("updated_at"))?,
    })
}

/// Create the stream's row if it does not exist yet and return the stored row.
/// An existing row (including its page size) is never overwritten.
#[instrument(skip_all, fields(stream_id = %stream_id))]
pub async fn ensure_cursor(
    pool: &Pool,
    stream_id: &str,
    page_size: i64,
    now: DateTime<Utc>,
) -> Result<CrawlCursor> {
    sqlx::query(
        "INSERT INTO crawl_cursors (stream_id, cursor_offset, page_size, processed_count, updated_at) \
         VALUES (?, 0, ?, 0, ?) ON CONFLICT(stream_id) DO NOTHING",
    )
    .bind(stream_id)
    .bind(page_size)
    .bind(to_millis(now))
    .execute(pool)
    .await?;
    get_cursor(pool, stream_id)
        .await?
        .ok_or_else(|| anyhow!("cursor {} missing after insert", stream_id))
}

pub async fn get_cursor(pool: &Pool, stream_id: &str) -> Result<Option<CrawlCursor>> {
    let sql = format!("SELECT {CURSOR_COLUMNS} FROM crawl_cursors WHERE stream_id = ?");
    let row = sqlx::query(&sql)
        .bind(stream_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(cursor_from_row).transpose()
}

pub async fn list_cursors(pool: &Pool) -> Result<Vec<CrawlCursor>> {
    let sql = format!("SELECT {CURSOR_COLUMNS} FROM crawl_cursors ORDER BY stream_id");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(cursor_from_row).collect()
}

/// Move an offset stream from `expected_offset` to `next_offset`.
/// Returns `false` when another step already moved the cursor.
#[instrument(skip_all, fields(stream_id = %stream_id))]
pub async fn advance_offset(
    pool: &Pool,
    stream_id: &str,
    expected_offset: i64,
    next_offset: i64,
    total: Option<i64>,
    processed: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE crawl_cursors SET cursor_offset = ?, total = COALESCE(?, total), \
             processed_count = processed_count + ?, updated_at = ? \
         WHERE stream_id = ? AND cursor_offset = ?",
    )
    .bind(next_offset)
    .bind(total)
    .bind(processed)
    .bind(to_millis(now))
    .bind(stream_id)
    .bind(expected_offset)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Store `position` for a time+id stream if it is strictly newer than the
/// stored one. Returns whether the row changed.
#[instrument(skip_all, fields(stream_id = %stream_id))]
pub async fn advance_feed_position(
    pool: &Pool,
    stream_id: &str,
    position: &FeedPosition,
    processed: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let ts = to_millis(position.updated_at);
    let result = sqlx::query(
        "UPDATE crawl_cursors SET cursor_timestamp = ?1, cursor_last_id = ?2, \
             processed_count = processed_count + ?3, updated_at = ?4 \
         WHERE stream_id = ?5 AND ( \
             cursor_timestamp IS NULL OR cursor_last_id IS NULL \
             OR cursor_timestamp < ?1 \
             OR (cursor_timestamp = ?1 AND cursor_last_id < ?2))",
    )
    .bind(ts)
    .bind(&position.id)
    .bind(processed)
    .bind(to_millis(now))
    .bind(stream_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Count processed items without moving the position.
pub async fn add_processed(
    pool: &Pool,
    stream_id: &str,
    processed: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE crawl_cursors SET processed_count = processed_count + ?, updated_at = ? \
         WHERE stream_id = ?",
    )
    .bind(processed)
    .bind(to_millis(now))
    .bind(stream_id)
    .execute(pool)
    .await?;
    Ok(())
}
