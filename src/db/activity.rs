//! Mirror of the remote activity feed in `activity_records`.

use super::{from_millis, from_millis_opt, to_millis, Pool};
use crate::catalog::ActivityItem;
use crate::model::ActivityRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

/// Insert or overwrite the record for `item.external_item_id`.
#[instrument(skip_all, fields(external_item_id = %item.external_item_id))]
pub async fn upsert_activity(
    pool: &Pool,
    item: &ActivityItem,
    local_parent_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<()> {
    let raw = serde_json::to_string(&item.raw)?;
    sqlx::query(
        "INSERT INTO activity_records (external_item_id, external_parent_id, local_parent_id, title, \
             number, volume, language, group_name, remote_updated_at, remote_readable_at, raw, \
             created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12) \
         ON CONFLICT(external_item_id) DO UPDATE SET \
             external_parent_id = excluded.external_parent_id, \
             local_parent_id = COALESCE(excluded.local_parent_id, activity_records.local_parent_id), \
             title = excluded.title, \
             number = excluded.number, \
             volume = excluded.volume, \
             language = excluded.language, \
             group_name = excluded.group_name, \
             remote_updated_at = excluded.remote_updated_at, \
             remote_readable_at = excluded.remote_readable_at, \
             raw = excluded.raw, \
             updated_at = excluded.updated_at",
    )
    .bind(&item.external_item_id)
    .bind(&item.external_parent_id)
    .bind(local_parent_id)
    .bind(&item.title)
    .bind(&item.number)
    .bind(&item.volume)
    .bind(&item.language)
    .bind(&item.group_name)
    .bind(to_millis(item.remote_updated_at))
    .bind(item.remote_readable_at.map(to_millis))
    .bind(raw)
    .bind(to_millis(now))
    .execute(pool)
    .await
    .with_context(|| format!("failed to upsert activity {}", item.external_item_id))?;
    Ok(())
}

pub async fn get_activity(pool: &Pool, external_item_id: &str) -> Result<Option<ActivityRecord>> {
    let row = sqlx::query(
        "SELECT external_item_id, external_parent_id, local_parent_id, title, number, volume, \
             language, group_name, remote_updated_at, remote_readable_at, updated_at \
         FROM activity_records WHERE external_item_id = ?",
    )
    .bind(external_item_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(ActivityRecord {
        external_item_id: row.get("external_item_id"),
        external_parent_id: row.get("external_parent_id"),
        local_parent_id: row.get("local_parent_id"),
        title: row.get("title"),
        number: row.get("number"),
        volume: row.get("volume"),
        language: row.get("language"),
        group_name: row.get("group_name"),
        remote_updated_at: from_millis(row.get("remote_updated_at"))?,
        remote_readable_at: from_millis_opt(row.get("remote_readable_at"))?,
        updated_at: from_millis(row.get("updated_at"))?,
    }))
}

/// Distinct parent ids among the newest `window` records, each with the
/// newest `remote_updated_at` seen for it inside that window. Newest first.
pub async fn recent_parent_ids(pool: &Pool, window: i64) -> Result<Vec<(String, DateTime<Utc>)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT external_parent_id, MAX(remote_updated_at) AS observed_at FROM ( \
             SELECT external_parent_id, remote_updated_at FROM activity_records \
             ORDER BY remote_updated_at DESC, id DESC LIMIT ? \
         ) GROUP BY external_parent_id ORDER BY observed_at DESC, external_parent_id ASC",
    )
    .bind(window)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|(id, observed)| Ok((id, from_millis(observed)?)))
        .collect()
}

/// Row count and newest remote update time.
pub async fn summary(pool: &Pool) -> Result<(i64, Option<DateTime<Utc>>)> {
    let (count, newest): (i64, Option<i64>) =
        sqlx::query_as("SELECT COUNT(*), MAX(remote_updated_at) FROM activity_records")
            .fetch_one(pool)
            .await?;
    Ok((count, from_millis_opt(newest)?))
}
