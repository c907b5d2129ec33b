//! Work queue over `sync_queue`.
//!
//! Rows move `pending -> processing -> done | error`, with `error` rows becoming
//! claimable again once `next_run_at` passes and `processing` rows becoming
//! claimable again once their lease expires. The only operation that needs
//! mutual exclusion is [`claim_batch`], which is a single `UPDATE ... RETURNING`
//! statement and therefore atomic under SQLite's write lock.

use super::{from_millis, from_millis_opt, to_millis, Pool};
use crate::model::{Outcome, QueueItem, QueueStatus};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Fixed delay before an `error` row becomes claimable again.
pub const RETRY_DELAY_SECS: i64 = 5 * 60;

const ITEM_COLUMNS: &str = "id, external_id, status, last_seen_at, next_run_at, locked_until, \
                            lock_token, last_error, attempts, updated_at";

fn item_from_row(row: &SqliteRow) -> Result<QueueItem> {
    let status: String = row.get("status");
    let status = QueueStatus::parse_status(&status)
        .ok_or_else(|| anyhow!("queue row has unknown status {}", status))?;
    Ok(QueueItem {
        id: row.get("id"),
        external_id: row.get("external_id"),
        status,
        last_seen_at: from_millis(row.get("last_seen_at"))?,
        next_run_at: from_millis(row.get("next_run_at"))?,
        locked_until: from_millis_opt(row.get("locked_until"))?,
        lock_token: row.get("lock_token"),
        last_error: row.get("last_error"),
        attempts: row.get("attempts"),
        updated_at: from_millis(row.get("updated_at"))?,
    })
}

/// Create the row as `pending`, or refresh `last_seen_at`/`next_run_at` on an
/// existing row without touching its status, lease or error.
///
/// A `done` row observed with strictly newer activity goes back to `pending`;
/// that is the only status change this function makes. An `error` row keeps
/// its retry time when that is later than `observed_at`.
#[instrument(skip_all, fields(external_id = %external_id))]
pub async fn enqueue_or_touch(
    pool: &Pool,
    external_id: &str,
    observed_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    let observed = to_millis(observed_at);
    sqlx::query(
        "INSERT INTO sync_queue (external_id, status, last_seen_at, next_run_at, created_at, updated_at) \
         VALUES (?1, 'pending', ?2, ?2, ?3, ?3) \
         ON CONFLICT(external_id) DO UPDATE SET \
             status = CASE \
                 WHEN sync_queue.status = 'done' AND excluded.last_seen_at > sync_queue.last_seen_at \
                 THEN 'pending' ELSE sync_queue.status END, \
             last_seen_at = MAX(sync_queue.last_seen_at, excluded.last_seen_at), \
             next_run_at = CASE \
                 WHEN sync_queue.status = 'error' \
                 THEN MAX(sync_queue.next_run_at, excluded.next_run_at) \
                 ELSE excluded.next_run_at END, \
             updated_at = excluded.updated_at",
    )
    .bind(external_id)
    .bind(observed)
    .bind(to_millis(now))
    .execute(pool)
    .await?;
    Ok(())
}

/// Atomically lease up to `max_items` eligible rows.
///
/// Eligible: `pending`, `processing` with an expired lease, or `error` whose
/// `next_run_at` has passed. Each claimed row gets a fresh lock token; any
/// token issued by an earlier lease on the same row stops being valid.
#[instrument(skip_all, fields(max_items = max_items))]
pub async fn claim_batch(
    pool: &Pool,
    max_items: i64,
    lease: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<QueueItem>> {
    if max_items <= 0 {
        return Ok(Vec::new());
    }
    let claim_id = Uuid::new_v4().simple().to_string();
    let now_ms = to_millis(now);
    let sql = format!(
        "UPDATE sync_queue SET \
             status = 'processing', \
             locked_until = ?1, \
             lock_token = ?2 || '-' || id, \
             claimed_seen_at = last_seen_at, \
             attempts = attempts + 1, \
             updated_at = ?3 \
         WHERE id IN ( \
             SELECT id FROM sync_queue \
             WHERE status = 'pending' \
                OR (status = 'processing' AND locked_until < ?3) \
                OR (status = 'error' AND next_run_at <= ?3) \
             ORDER BY next_run_at ASC, id ASC \
             LIMIT ?4 \
         ) \
         RETURNING {ITEM_COLUMNS}"
    );
    let rows = sqlx::query(&sql)
        .bind(to_millis(now + lease))
        .bind(&claim_id)
        .bind(now_ms)
        .bind(max_items)
        .fetch_all(pool)
        .await?;

    let mut items = rows
        .iter()
        .map(item_from_row)
        .collect::<Result<Vec<_>>>()?;
    // RETURNING order is unspecified.
    items.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then(a.id.cmp(&b.id)));
    debug!(claimed = items.len(), claim_id = %claim_id, "claimed queue batch");
    Ok(items)
}

/// Finish a lease. Returns `false` (and changes nothing) when `lock_token` is
/// no longer the row's current token.
///
/// A success lands on `pending` instead of `done` when activity newer than
/// what the lease started from was observed while the row was processing.
#[instrument(skip_all, fields(id = id))]
pub async fn resolve(
    pool: &Pool,
    id: i64,
    lock_token: &str,
    outcome: &Outcome,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now_ms = to_millis(now);
    let result = match outcome {
        Outcome::Success => {
            sqlx::query(
                "UPDATE sync_queue SET \
                     status = CASE WHEN last_seen_at > COALESCE(claimed_seen_at, last_seen_at) \
                         THEN 'pending' ELSE 'done' END, \
                     locked_until = NULL, lock_token = NULL, claimed_seen_at = NULL, \
                     last_error = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND lock_token = ?3 AND status = 'processing'",
            )
            .bind(now_ms)
            .bind(id)
            .bind(lock_token)
            .execute(pool)
            .await?
        }
        Outcome::Failure(message) => {
            sqlx::query(
                "UPDATE sync_queue SET status = 'error', locked_until = NULL, lock_token = NULL, \
                     claimed_seen_at = NULL, last_error = ?1, next_run_at = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND lock_token = ?5 AND status = 'processing'",
            )
            .bind(message)
            .bind(to_millis(now + Duration::seconds(RETRY_DELAY_SECS)))
            .bind(now_ms)
            .bind(id)
            .bind(lock_token)
            .execute(pool)
            .await?
        }
    };
    Ok(result.rows_affected() == 1)
}

pub async fn get_by_external_id(pool: &Pool, external_id: &str) -> Result<Option<QueueItem>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM sync_queue WHERE external_id = ?");
    let row = sqlx::query(&sql)
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(item_from_row).transpose()
}

/// Row count per status; statuses with no rows are reported as zero.
pub async fn status_counts(pool: &Pool) -> Result<BTreeMap<QueueStatus, i64>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")
            .fetch_all(pool)
            .await?;
    let mut counts: BTreeMap<QueueStatus, i64> =
        QueueStatus::ALL.iter().map(|s| (*s, 0)).collect();
    for (status, count) in rows {
        let status = QueueStatus::parse_status(&status)
            .ok_or_else(|| anyhow!("queue row has unknown status {}", status))?;
        counts.insert(status, count);
    }
    Ok(counts)
}

/// `processing` rows whose lease has already run out.
pub async fn count_stuck(pool: &Pool, now: DateTime<Utc>) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sync_queue WHERE status = 'processing' AND locked_until < ?",
    )
    .bind(to_millis(now))
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Most recently updated rows in `status`.
pub async fn recent_by_status(
    pool: &Pool,
    status: QueueStatus,
    limit: i64,
) -> Result<Vec<QueueItem>> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM sync_queue WHERE status = ? ORDER BY updated_at DESC, id DESC LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(item_from_row).collect()
}

/// `pending` rows not updated since `older_than`, oldest first.
pub async fn stale_pending(
    pool: &Pool,
    older_than: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<QueueItem>> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM sync_queue WHERE status = 'pending' AND updated_at < ? \
         ORDER BY updated_at ASC, id ASC LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(to_millis(older_than))
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(item_from_row).collect()
}
